use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use evsim_core::StationConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_STATIONS: usize = 50;

/// Fleet configuration, loaded from a JSON file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
    /// Number of generated stations, used when `stations` is empty
    pub station_count: usize,
    /// Explicit station list; overrides `station_count`
    pub stations: Vec<StationConfig>,
    /// Maximum current of generated stations, in A
    pub max_current_amps: u32,
    pub tick_interval_ms: u64,
    pub notification_timeout_secs: u64,
    /// Without it the fleet runs in simulation-only mode
    pub central_system_url: Option<String>,
    pub port: u16,
    pub seed: Option<u64>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            station_count: 5,
            stations: Vec::new(),
            max_current_amps: 40,
            tick_interval_ms: 1000,
            notification_timeout_secs: 30,
            central_system_url: None,
            port: 3000,
            seed: None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Fleet must have between 1 and {max} stations, got {count}")]
    StationCount { count: usize, max: usize },

    #[error("Station {station_id} must have a maximum current above 0 A")]
    ZeroMaxCurrent { station_id: String },

    #[error("Station id {0} is used more than once")]
    DuplicateStationId(String),

    #[error("Tick interval must be above 0 ms")]
    ZeroTickInterval,

    #[error("Notification timeout must be above 0 s")]
    ZeroNotificationTimeout,
}

impl FleetConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }

    /// Stations to simulate, generating `charger-<n>` ids when none are listed.
    pub fn station_configs(&self) -> Vec<StationConfig> {
        if !self.stations.is_empty() {
            return self.stations.clone();
        }
        (1..=self.station_count)
            .map(|i| StationConfig::new(format!("charger-{}", i), self.max_current_amps))
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stations = self.station_configs();
        if stations.is_empty() || stations.len() > MAX_STATIONS {
            return Err(ConfigError::StationCount {
                count: stations.len(),
                max: MAX_STATIONS,
            });
        }

        let mut seen = HashSet::new();
        for station in &stations {
            if station.max_current_amps == 0 {
                return Err(ConfigError::ZeroMaxCurrent {
                    station_id: station.id.clone(),
                });
            }
            if !seen.insert(station.id.as_str()) {
                return Err(ConfigError::DuplicateStationId(station.id.clone()));
            }
        }

        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.notification_timeout_secs == 0 {
            return Err(ConfigError::ZeroNotificationTimeout);
        }
        Ok(())
    }
}
