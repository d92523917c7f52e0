//! Charge point side of the OCPP exchange for one simulated station

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use evsim_core::{ChargeStation, StationHandle, StationStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
use crate::transport::{PendingResponse, Transport, TransportError};
use crate::types::{
    IdTagInfo, StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StopTransactionRequest, StopTransactionResponse,
};

pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Could not build StatusNotification: {0}")]
    Encode(#[from] OcppError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Station {station_id} is shut down")]
    ShutDown { station_id: String },
}

/// Fleet-wide source of transaction ids, starting at 1.
///
/// Ids stay positive: after `i32::MAX` the counter wraps back to 1.
#[derive(Debug)]
pub struct TransactionIds {
    next: AtomicI32,
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl TransactionIds {
    pub fn starting_at(first: i32) -> Self {
        TransactionIds {
            next: AtomicI32::new(first.max(1)),
        }
    }

    pub fn next(&self) -> i32 {
        let advance = |id: i32| Some(id.checked_add(1).unwrap_or(1));
        match self.next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance) {
            Ok(id) | Err(id) => id,
        }
    }
}

/// OCPP action handlers bound to one station.
///
/// Handlers mutate the station under its lock, release it, and only then
/// hand the resulting StatusNotification to the transport. The response to
/// that notification is awaited on a detached task, so the reply to the
/// triggering call is never held up by it.
///
/// Once the shutdown signal turns true, transaction handlers refuse to touch
/// the station.
pub struct ChargePointController<T> {
    station: StationHandle,
    transport: Arc<T>,
    transaction_ids: Arc<TransactionIds>,
    notification_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<T: Transport> ChargePointController<T> {
    pub fn new(
        station: StationHandle,
        transport: Arc<T>,
        transaction_ids: Arc<TransactionIds>,
    ) -> Self {
        ChargePointController {
            station,
            transport,
            transaction_ids,
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            shutdown: None,
        }
    }

    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    pub fn with_shutdown_signal(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|shutdown| *shutdown.borrow())
    }

    pub fn station(&self) -> &StationHandle {
        &self.station
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Answer a CALL received from the central system.
    ///
    /// Unknown actions and malformed payloads are answered with a CALLERROR
    /// and leave the station untouched.
    pub fn handle_call(&self, call: &Call) -> OcppMessage {
        let action = match call.action() {
            Ok(action) => action,
            Err(_) => {
                warn!("Rejecting unknown action {}", call.action);
                return call_error(
                    call,
                    ErrorCode::NotImplemented,
                    format!("Action {} is not implemented", call.action),
                );
            }
        };

        match action {
            Action::StartTransaction => match call.parse_payload::<StartTransactionRequest>() {
                Ok(request) => match self.on_start_transaction(request) {
                    Ok(response) => respond(call, &response),
                    Err(e) => refused(call, e),
                },
                Err(e) => formation_violation(call, e),
            },
            Action::StopTransaction => match call.parse_payload::<StopTransactionRequest>() {
                Ok(request) => match self.on_stop_transaction(request) {
                    Ok(response) => respond(call, &response),
                    Err(e) => refused(call, e),
                },
                Err(e) => formation_violation(call, e),
            },
            Action::StatusNotification => call_error(
                call,
                ErrorCode::NotSupported,
                "StatusNotification is only sent by the charge point",
            ),
        }
    }

    /// Run `f` on the station unless shutdown has been signalled.
    ///
    /// The signal is read under the station lock, matching the order in
    /// which the fleet raises it and then stops each station.
    fn with_live_station<R>(
        &self,
        f: impl FnOnce(&mut ChargeStation) -> R,
    ) -> Result<R, HandlerError> {
        self.station.with(|station| {
            if self.is_shut_down() {
                return Err(HandlerError::ShutDown {
                    station_id: station.id().to_string(),
                });
            }
            Ok(f(station))
        })
    }

    pub fn on_start_transaction(
        &self,
        request: StartTransactionRequest,
    ) -> Result<StartTransactionResponse, HandlerError> {
        let (transaction_id, station_id, replaced, status) = self.with_live_station(|station| {
            let transaction_id = self.transaction_ids.next();
            let replaced = station.begin_transaction(transaction_id);
            (transaction_id, station.id().to_string(), replaced, station.status())
        })?;

        if let Some(replaced) = replaced {
            warn!(
                "Station {} replaced open transaction {} with {}",
                station_id, replaced, transaction_id
            );
        }
        info!(
            "StartTransaction accepted on station {} (idTag {}, connector {}, meterStart {}): transaction {}",
            station_id, request.id_tag, request.connector_id, request.meter_start, transaction_id
        );

        self.notify_status(&station_id, status);

        Ok(StartTransactionResponse {
            id_tag_info: IdTagInfo::accepted(),
            transaction_id,
        })
    }

    pub fn on_stop_transaction(
        &self,
        request: StopTransactionRequest,
    ) -> Result<StopTransactionResponse, HandlerError> {
        let (station_id, closed, status) = self.with_live_station(|station| {
            let closed = station.end_transaction();
            (station.id().to_string(), closed, station.status())
        })?;

        if closed != Some(request.transaction_id) {
            warn!(
                "StopTransaction for {} on station {}, open transaction was {:?}",
                request.transaction_id, station_id, closed
            );
        }
        info!(
            "StopTransaction accepted on station {} (meterStop {}, reason {:?})",
            station_id, request.meter_stop, request.reason
        );

        self.notify_status(&station_id, status);

        Ok(StopTransactionResponse {
            id_tag_info: Some(IdTagInfo::accepted()),
        })
    }

    /// Report the station's current status and wait for the acknowledgement.
    ///
    /// Failures are returned to the caller; the station is never touched.
    pub async fn send_status_notification(&self) -> Result<CallResult, NotificationError> {
        let status = self.station.with(|station| station.status());
        let pending = self.queue_status_notification(status)?;
        Ok(pending.wait(self.notification_timeout).await?)
    }

    fn queue_status_notification(
        &self,
        status: StationStatus,
    ) -> Result<PendingResponse, NotificationError> {
        let call = Call::new(
            Action::StatusNotification,
            StatusNotificationRequest::new(status),
        )?;
        debug!("Sending StatusNotification {} ({})", call.unique_id, status);
        Ok(self.transport.send_call(call)?)
    }

    /// Queue a notification now and await its response in the background.
    ///
    /// Without a runtime nothing could await the response, so nothing is sent.
    fn notify_status(&self, station_id: &str, status: StationStatus) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                "No runtime to await StatusNotification from station {}, not sending it",
                station_id
            );
            return;
        };

        let pending = match self.queue_status_notification(status) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("StatusNotification from station {} not sent: {}", station_id, e);
                return;
            }
        };

        let timeout = self.notification_timeout;
        let station_id = station_id.to_string();
        runtime.spawn(async move {
            match pending.wait(timeout).await {
                Ok(result) => debug!(
                    "StatusNotification {} acknowledged for station {}",
                    result.unique_id, station_id
                ),
                Err(e) => warn!("StatusNotification from station {} dropped: {}", station_id, e),
            }
        });
    }
}

fn respond(call: &Call, payload: &impl Serialize) -> OcppMessage {
    match CallResult::new(call.unique_id.clone(), payload) {
        Ok(result) => OcppMessage::CallResult(result),
        Err(e) => call_error(call, ErrorCode::InternalError, e.to_string()),
    }
}

fn refused(call: &Call, error: HandlerError) -> OcppMessage {
    warn!("Refusing {} call {}: {}", call.action, call.unique_id, error);
    call_error(call, ErrorCode::GenericError, error.to_string())
}

fn formation_violation(call: &Call, error: OcppError) -> OcppMessage {
    warn!("Malformed {} payload in call {}: {}", call.action, call.unique_id, error);
    call_error(call, ErrorCode::FormationViolation, error.to_string())
}

fn call_error(call: &Call, code: ErrorCode, description: impl Into<String>) -> OcppMessage {
    OcppMessage::CallError(CallError::new(call.unique_id.clone(), code, description))
}
