pub mod command;

pub use crate::command::{Command, CommandAction, CommandError};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use evsim_core::{ChargeStation, StationConfig, StationError, StationHandle, StationSnapshot};
use evsim_ocpp::controller::DEFAULT_NOTIFICATION_TIMEOUT;
use evsim_ocpp::{ChargePointController, TransactionIds, Transport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("Unknown station {index}, expected 1..={count}")]
    UnknownStation { index: usize, count: usize },

    #[error(transparent)]
    OutOfRange(#[from] StationError),

    #[error("Fleet is shut down")]
    ShutDown,
}

/// Readings of every station taken by one sampler tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    /// 0 until the first tick
    pub tick: u64,
    pub stations: Vec<StationSnapshot>,
}

/// The simulated fleet: stations addressed by 1-based index, the sampler
/// that advances them, and the channel its snapshots are published on.
pub struct FleetEngine {
    stations: Vec<StationHandle>,
    transaction_ids: Arc<TransactionIds>,
    notification_timeout: Duration,
    tick: AtomicU64,
    snapshot_tx: watch::Sender<FleetSnapshot>,
    shutdown_tx: watch::Sender<bool>,
}

impl FleetEngine {
    pub fn new(configs: Vec<StationConfig>) -> Self {
        Self::from_stations(configs.into_iter().map(ChargeStation::new).collect())
    }

    /// Create a fleet whose sampled currents are reproducible.
    pub fn with_seed(configs: Vec<StationConfig>, seed: u64) -> Self {
        Self::from_stations(
            configs
                .into_iter()
                .enumerate()
                .map(|(i, config)| ChargeStation::with_seed(config, seed.wrapping_add(i as u64)))
                .collect(),
        )
    }

    fn from_stations(stations: Vec<ChargeStation>) -> Self {
        let stations: Vec<StationHandle> = stations.into_iter().map(StationHandle::new).collect();
        let initial = FleetSnapshot {
            tick: 0,
            stations: stations.iter().map(StationHandle::snapshot).collect(),
        };
        info!("Fleet created with {} station(s)", stations.len());

        FleetEngine {
            stations,
            transaction_ids: Arc::new(TransactionIds::default()),
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            tick: AtomicU64::new(0),
            snapshot_tx: watch::Sender::new(initial),
            shutdown_tx: watch::Sender::new(false),
        }
    }

    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn station(&self, index: usize) -> Result<&StationHandle, FleetError> {
        index
            .checked_sub(1)
            .and_then(|i| self.stations.get(i))
            .ok_or(FleetError::UnknownStation {
                index,
                count: self.stations.len(),
            })
    }

    /// Run `f` on station `index` unless the fleet has been shut down.
    ///
    /// The shutdown flag is checked under the station lock, so nothing can
    /// slip in after `shutdown` has cleared that station.
    fn with_live_station<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut ChargeStation) -> Result<R, StationError>,
    ) -> Result<R, FleetError> {
        let station = self.station(index)?;
        station.with(|station| {
            if self.is_shut_down() {
                return Err(FleetError::ShutDown);
            }
            Ok(f(station)?)
        })
    }

    pub fn set_current(&self, index: usize, amps: i64) -> Result<StationSnapshot, FleetError> {
        self.with_live_station(index, |station| {
            station.set_current(amps)?;
            Ok(station.snapshot())
        })
    }

    pub fn set_setpoint(&self, index: usize, amps: i64) -> Result<StationSnapshot, FleetError> {
        self.with_live_station(index, |station| {
            station.set_setpoint(amps)?;
            Ok(station.snapshot())
        })
    }

    /// Request charging; the status follows on the next tick.
    pub fn start(&self, index: usize) -> Result<StationSnapshot, FleetError> {
        self.with_live_station(index, |station| {
            station.request_start();
            Ok(station.snapshot())
        })
    }

    pub fn stop(&self, index: usize) -> Result<StationSnapshot, FleetError> {
        self.with_live_station(index, |station| {
            station.request_stop();
            Ok(station.snapshot())
        })
    }

    pub fn apply(&self, command: &Command) -> Result<StationSnapshot, FleetError> {
        debug!("Applying command: {}", command);
        match command.action {
            CommandAction::Set(amps) => self.set_current(command.station, amps),
            CommandAction::Setpoint(amps) => self.set_setpoint(command.station, amps),
            CommandAction::Start => self.start(command.station),
            CommandAction::Stop => self.stop(command.station),
        }
    }

    /// Live state of every station, without sampling.
    pub fn snapshot_all(&self) -> Vec<StationSnapshot> {
        self.stations.iter().map(StationHandle::snapshot).collect()
    }

    /// Sample every station once and publish the result.
    pub fn tick(&self) -> FleetSnapshot {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = FleetSnapshot {
            tick,
            stations: self
                .stations
                .iter()
                .map(|station| station.with(|station| station.sample()))
                .collect(),
        };
        debug!("Tick {} sampled {} station(s)", tick, snapshot.stations.len());
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Most recently published fleet snapshot
    pub fn latest(&self) -> FleetSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Turns true once `shutdown` has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn the periodic sampler. The first tick fires one interval after start.
    pub fn run_sampler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Sampler started, ticking every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sampler stopped");
        })
    }

    /// Build the OCPP controller for station `index`.
    ///
    /// Transaction ids are drawn from one counter shared by the whole fleet.
    /// The controller follows the fleet's shutdown signal.
    pub fn controller<T: Transport>(
        &self,
        index: usize,
        transport: Arc<T>,
    ) -> Result<ChargePointController<T>, FleetError> {
        let station = self.station(index)?.clone();
        if self.is_shut_down() {
            return Err(FleetError::ShutDown);
        }
        Ok(
            ChargePointController::new(station, transport, Arc::clone(&self.transaction_ids))
                .with_notification_timeout(self.notification_timeout)
                .with_shutdown_signal(self.shutdown_signal()),
        )
    }

    /// Halt the sampler, clear every charging request and refuse further commands.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        for station in &self.stations {
            station.with(|station| station.request_stop());
        }
        info!("Fleet shut down, {} station(s) stopped", self.stations.len());
    }
}
