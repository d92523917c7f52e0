mod models;
pub mod power;

pub use crate::models::*;

use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    #[error("{quantity} of {value} A is out of range for station {station_id} (0..={max_current_amps} A)")]
    OutOfRange {
        station_id: String,
        quantity: &'static str,
        value: i64,
        max_current_amps: u32,
    },
}

/// Physical and protocol state of a single simulated charge point.
///
/// Fields are only reachable through the operations below; `sample` is the
/// one place where the drawn current and the status move together.
#[derive(Debug)]
pub struct ChargeStation {
    config: StationConfig,
    status: StationStatus,
    current_amps: u32,
    setpoint_current_amps: u32,
    charging_requested: bool,
    active_transaction_id: Option<i32>,
    rng: StdRng,
}

impl ChargeStation {
    pub fn new(config: StationConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Create a station whose sampled currents are reproducible.
    pub fn with_seed(config: StationConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: StationConfig, rng: StdRng) -> Self {
        ChargeStation {
            config,
            status: StationStatus::Available,
            current_amps: 0,
            setpoint_current_amps: 0,
            charging_requested: false,
            active_transaction_id: None,
            rng,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn max_current_amps(&self) -> u32 {
        self.config.max_current_amps
    }

    pub fn status(&self) -> StationStatus {
        self.status
    }

    pub fn current_amps(&self) -> u32 {
        self.current_amps
    }

    pub fn setpoint_current_amps(&self) -> u32 {
        self.setpoint_current_amps
    }

    pub fn charging_requested(&self) -> bool {
        self.charging_requested
    }

    pub fn active_transaction_id(&self) -> Option<i32> {
        self.active_transaction_id
    }

    /// Return the active power, derived from the setpoint and the status.
    pub fn active_power_watts(&self) -> u64 {
        power::active_power_watts(
            self.setpoint_current_amps,
            self.status == StationStatus::Charging,
        )
    }

    fn check_range(&self, quantity: &'static str, amps: i64) -> Result<u32, StationError> {
        let max = self.config.max_current_amps;
        if amps < 0 || amps > i64::from(max) {
            return Err(StationError::OutOfRange {
                station_id: self.config.id.clone(),
                quantity,
                value: amps,
                max_current_amps: max,
            });
        }
        Ok(amps as u32)
    }

    /// Assign the drawn current directly.
    ///
    /// This is the manual override path; the next `sample` overwrites it.
    pub fn set_current(&mut self, amps: i64) -> Result<(), StationError> {
        let amps = self.check_range("current", amps)?;
        tracing::info!("Setting current of station {} to {} A", self.config.id, amps);
        self.current_amps = amps;
        Ok(())
    }

    pub fn set_setpoint(&mut self, amps: i64) -> Result<(), StationError> {
        let amps = self.check_range("setpoint", amps)?;
        tracing::info!("Setting setpoint of station {} to {} A", self.config.id, amps);
        self.setpoint_current_amps = amps;
        Ok(())
    }

    pub fn request_start(&mut self) {
        tracing::info!("Charging requested on station {}", self.config.id);
        self.charging_requested = true;
    }

    pub fn request_stop(&mut self) {
        tracing::info!("Charging stop requested on station {}", self.config.id);
        self.charging_requested = false;
    }

    /// Advance the station by one tick and return its readings.
    pub fn sample(&mut self) -> StationSnapshot {
        if self.charging_requested {
            let max = self.config.max_current_amps;
            self.current_amps = if max == 0 {
                0
            } else {
                self.rng.random_range(1..=max)
            };
            self.status = StationStatus::Charging;
        } else {
            self.current_amps = 0;
            self.status = StationStatus::Available;
            // A transaction cannot outlive the charging it accounts for.
            if let Some(transaction_id) = self.active_transaction_id.take() {
                tracing::warn!(
                    "Station {} stopped charging locally, closing transaction {}",
                    self.config.id,
                    transaction_id
                );
            }
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> StationSnapshot {
        StationSnapshot {
            station_id: self.config.id.clone(),
            current_amps: self.current_amps,
            status: self.status,
            status_code: self.status.code(),
            active_power_watts: self.active_power_watts(),
            setpoint_current_amps: self.setpoint_current_amps,
            transaction_id: self.active_transaction_id,
        }
    }

    /// Open a transaction accepted by the central system.
    ///
    /// Returns the id of a transaction that was still open and got replaced.
    pub fn begin_transaction(&mut self, transaction_id: i32) -> Option<i32> {
        tracing::info!(
            "Starting transaction {} on station {}",
            transaction_id,
            self.config.id
        );
        self.status = StationStatus::Charging;
        self.charging_requested = true;
        self.active_transaction_id.replace(transaction_id)
    }

    /// Close the open transaction, if any, and return its id.
    pub fn end_transaction(&mut self) -> Option<i32> {
        tracing::info!("Stopping transaction on station {}", self.config.id);
        self.status = StationStatus::Available;
        self.charging_requested = false;
        self.active_transaction_id.take()
    }
}

/// Shared, mutually exclusive access to one station.
///
/// Every access runs a synchronous closure under the lock, so the lock can
/// never be held across an await point.
#[derive(Debug, Clone)]
pub struct StationHandle(Arc<Mutex<ChargeStation>>);

impl StationHandle {
    pub fn new(station: ChargeStation) -> Self {
        StationHandle(Arc::new(Mutex::new(station)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ChargeStation) -> R) -> R {
        let mut station = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut station)
    }

    pub fn snapshot(&self) -> StationSnapshot {
        self.with(|station| station.snapshot())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn default_config() -> StationConfig {
        StationConfig::new("charger-1", 40)
    }

    fn default_station() -> ChargeStation {
        ChargeStation::with_seed(default_config(), 42)
    }

    fn assert_invariants(station: &ChargeStation) {
        assert!(station.current_amps() <= station.max_current_amps());
        assert!(station.setpoint_current_amps() <= station.max_current_amps());
        if station.status() == StationStatus::Charging {
            assert_eq!(
                station.active_power_watts(),
                u64::from(station.setpoint_current_amps()) * power::LINE_VOLTAGE
            );
        } else {
            assert_eq!(station.active_power_watts(), 0);
            assert!(station.active_transaction_id().is_none());
        }
    }

    #[test]
    fn test_new_station_is_available() {
        let station = default_station();
        assert_eq!(station.id(), "charger-1");
        assert_eq!(station.status(), StationStatus::Available);
        assert_eq!(station.current_amps(), 0);
        assert_eq!(station.setpoint_current_amps(), 0);
        assert!(!station.charging_requested());
        assert!(station.active_transaction_id().is_none());
    }

    #[test]
    fn test_setpoint_start_and_sample() {
        let mut station = default_station();
        station.set_setpoint(25).expect("setpoint within range");
        station.request_start();

        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Charging);
        assert_eq!(snapshot.status_code, 3);
        assert!((1..=40).contains(&snapshot.current_amps));
        assert_eq!(snapshot.active_power_watts, 5750);
        assert_eq!(snapshot.setpoint_current_amps, 25);
    }

    #[test]
    fn test_set_current_out_of_range() {
        let mut station = default_station();
        station.set_current(10).unwrap();

        let result = station.set_current(50);
        match result {
            Err(StationError::OutOfRange {
                station_id,
                quantity,
                value,
                max_current_amps,
            }) => {
                assert_eq!(station_id, "charger-1");
                assert_eq!(quantity, "current");
                assert_eq!(value, 50);
                assert_eq!(max_current_amps, 40);
            }
            _ => panic!("Expected OutOfRange error"),
        }
        assert_eq!(station.current_amps(), 10);

        assert!(station.set_current(-1).is_err());
        assert_eq!(station.current_amps(), 10);
    }

    #[test]
    fn test_setpoint_out_of_range() {
        let mut station = default_station();
        station.set_setpoint(16).unwrap();

        assert!(station.set_setpoint(41).is_err());
        assert!(station.set_setpoint(-5).is_err());
        assert_eq!(station.setpoint_current_amps(), 16);

        // The bounds themselves are valid
        station.set_setpoint(0).unwrap();
        station.set_setpoint(40).unwrap();
        assert_eq!(station.setpoint_current_amps(), 40);
    }

    #[test]
    fn test_manual_current_is_overwritten_by_next_sample() {
        let mut station = default_station();
        station.set_current(30).unwrap();
        assert_eq!(station.current_amps(), 30);

        let snapshot = station.sample();
        assert_eq!(snapshot.current_amps, 0);
        assert_eq!(snapshot.status, StationStatus::Available);
    }

    #[test]
    fn test_request_does_not_change_status_until_sample() {
        let mut station = default_station();
        station.set_setpoint(10).unwrap();
        station.request_start();
        assert_eq!(station.status(), StationStatus::Available);
        assert_eq!(station.active_power_watts(), 0);

        station.sample();
        assert_eq!(station.status(), StationStatus::Charging);

        station.request_stop();
        assert_eq!(station.status(), StationStatus::Charging);
        assert_eq!(station.active_power_watts(), 2300);

        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Available);
        assert_eq!(snapshot.status_code, 4);
        assert_eq!(snapshot.current_amps, 0);
        assert_eq!(snapshot.active_power_watts, 0);
    }

    #[test]
    fn test_stop_on_stopped_station_is_idempotent() {
        let mut station = default_station();
        station.set_setpoint(12).unwrap();
        station.sample();
        let before = station.snapshot();

        station.request_stop();
        assert!(!station.charging_requested());
        assert_eq!(station.snapshot(), before);

        let after = station.sample();
        assert_eq!(after, before);
    }

    #[test]
    fn test_setpoint_change_updates_power_immediately() {
        let mut station = default_station();
        station.set_setpoint(10).unwrap();
        station.request_start();
        station.sample();
        assert_eq!(station.active_power_watts(), 2300);

        station.set_setpoint(20).unwrap();
        let snapshot = station.snapshot();
        assert_eq!(snapshot.setpoint_current_amps, 20);
        assert_eq!(snapshot.active_power_watts, 4600);
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut station = default_station();
        station.set_setpoint(16).unwrap();

        assert_eq!(station.begin_transaction(1), None);
        assert_eq!(station.status(), StationStatus::Charging);
        assert_eq!(station.active_transaction_id(), Some(1));
        assert!(station.charging_requested());
        assert_invariants(&station);

        // The sampler keeps the protocol-driven status
        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Charging);
        assert_eq!(snapshot.transaction_id, Some(1));

        assert_eq!(station.end_transaction(), Some(1));
        assert_eq!(station.status(), StationStatus::Available);
        assert!(station.active_transaction_id().is_none());
        assert!(!station.charging_requested());
        assert_invariants(&station);

        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Available);
        assert_eq!(snapshot.transaction_id, None);
    }

    #[test]
    fn test_begin_transaction_replaces_open_transaction() {
        let mut station = default_station();
        station.begin_transaction(1);
        assert_eq!(station.begin_transaction(2), Some(1));
        assert_eq!(station.active_transaction_id(), Some(2));
    }

    #[test]
    fn test_local_stop_closes_transaction() {
        let mut station = default_station();
        station.begin_transaction(3);
        station.request_stop();

        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Available);
        assert_eq!(snapshot.transaction_id, None);
        assert_invariants(&station);
    }

    #[test]
    fn test_invariants_hold_under_random_commands() {
        let mut station = default_station();
        let mut commands = StdRng::seed_from_u64(7);

        for _ in 0..2_000 {
            match commands.random_range(0..7) {
                0 => {
                    let _ = station.set_current(commands.random_range(-10..=60));
                }
                1 => {
                    let _ = station.set_setpoint(commands.random_range(-10..=60));
                }
                2 => station.request_start(),
                3 => station.request_stop(),
                4 => {
                    station.begin_transaction(commands.random_range(1..=100));
                }
                5 => {
                    station.end_transaction();
                }
                _ => {
                    station.sample();
                }
            }
            assert_invariants(&station);
        }
    }

    #[test]
    fn test_sampled_current_is_reproducible_for_same_seed() {
        let mut station_1 = ChargeStation::with_seed(default_config(), 99);
        let mut station_2 = ChargeStation::with_seed(default_config(), 99);
        station_1.request_start();
        station_2.request_start();

        for _ in 0..50 {
            assert_eq!(station_1.sample(), station_2.sample());
        }
    }

    #[test]
    fn test_handle_serializes_access() {
        let handle = StationHandle::new(default_station());
        let clone = handle.clone();

        clone.with(|station| station.set_setpoint(8)).unwrap();
        handle.with(|station| station.request_start());
        handle.with(|station| station.sample());

        let snapshot = clone.snapshot();
        assert_eq!(snapshot.status, StationStatus::Charging);
        assert_eq!(snapshot.active_power_watts, 1840);
    }

    #[test]
    fn test_power_above_u32_range() {
        let mut station = ChargeStation::with_seed(StationConfig::new("charger-1", 20_000_000), 1);
        station.set_setpoint(20_000_000).unwrap();
        station.request_start();

        let snapshot = station.sample();
        assert_eq!(snapshot.status, StationStatus::Charging);
        assert_eq!(snapshot.active_power_watts, 4_600_000_000);
        assert_invariants(&station);
    }
}
