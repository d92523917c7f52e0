use serde::{Deserialize, Serialize};

/// Status code shown to the presentation layer while a station delivers current.
pub const STATUS_CODE_CHARGING: u8 = 3;
/// Status code shown for every non-charging status.
pub const STATUS_CODE_STOPPED: u8 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationStatus {
    #[default]
    Available,
    Charging,
    Faulted,
}

impl StationStatus {
    /// Numeric code used by the snapshot surface.
    pub fn code(self) -> u8 {
        match self {
            StationStatus::Charging => STATUS_CODE_CHARGING,
            StationStatus::Available | StationStatus::Faulted => STATUS_CODE_STOPPED,
        }
    }
}

impl std::fmt::Display for StationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationConfig {
    pub id: String,
    pub max_current_amps: u32,
}

impl StationConfig {
    pub fn new(id: impl Into<String>, max_current_amps: u32) -> Self {
        StationConfig {
            id: id.into(),
            max_current_amps,
        }
    }
}

/// One station's readings as seen by the presentation layer.
///
/// Always taken under the station lock, so `active_power_watts` is derived
/// from the same `setpoint_current_amps` that is reported next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSnapshot {
    pub station_id: String,
    pub current_amps: u32,
    pub status: StationStatus,
    pub status_code: u8,
    pub active_power_watts: u64,
    pub setpoint_current_amps: u32,
    pub transaction_id: Option<i32>,
}
