//! Call/response exchange with the central system
//!
//! Outbound calls are correlated with their responses through a pending
//! table keyed by unique id. A call is registered in the table before it is
//! queued, so a response can never race ahead of its registration.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::messages::{Call, CallResult, ErrorCode, OcppMessage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No response to call {unique_id} within {timeout:?}")]
    Timeout { unique_id: String, timeout: Duration },

    #[error("Connection to the central system is closed")]
    Disconnected,

    #[error("Central system rejected call {unique_id}: {code} - {description}")]
    Rejected {
        unique_id: String,
        code: ErrorCode,
        description: String,
    },

    #[error("A call with unique id {0} is already outstanding")]
    DuplicateId(String),
}

type ResponseSender = oneshot::Sender<Result<CallResult, TransportError>>;

/// Outstanding outbound calls awaiting their correlated response
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, ResponseSender>>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResponseSender>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(self: &Arc<Self>, unique_id: &str) -> Result<PendingResponse, TransportError> {
        let mut calls = self.calls();
        if calls.contains_key(unique_id) {
            return Err(TransportError::DuplicateId(unique_id.to_string()));
        }
        let (response_tx, response_rx) = oneshot::channel();
        calls.insert(unique_id.to_string(), response_tx);
        Ok(PendingResponse {
            unique_id: unique_id.to_string(),
            response_rx,
            table: Some(Arc::clone(self)),
        })
    }

    /// Hand a CALLRESULT or CALLERROR to the caller waiting on its id.
    ///
    /// Returns `false` when nothing was waiting, e.g. the call already timed out.
    pub fn resolve(&self, message: OcppMessage) -> bool {
        let (unique_id, result) = match message {
            OcppMessage::CallResult(result) => (result.unique_id.clone(), Ok(result)),
            OcppMessage::CallError(error) => (
                error.unique_id.clone(),
                Err(TransportError::Rejected {
                    unique_id: error.unique_id,
                    code: error.error_code,
                    description: error.error_description,
                }),
            ),
            OcppMessage::Call(call) => {
                warn!("Ignoring CALL {} passed as a response", call.unique_id);
                return false;
            }
        };

        match self.calls().remove(&unique_id) {
            Some(response_tx) => {
                // The waiter may have given up in the meantime
                let _ = response_tx.send(result);
                true
            }
            None => {
                debug!("No outstanding call for response {}", unique_id);
                false
            }
        }
    }

    pub fn forget(&self, unique_id: &str) {
        self.calls().remove(unique_id);
    }

    /// Drop every outstanding call; their waiters observe `Disconnected`.
    pub fn abandon_all(&self) -> usize {
        let mut calls = self.calls();
        let abandoned = calls.len();
        calls.clear();
        abandoned
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle on the response to one outbound call
#[derive(Debug)]
pub struct PendingResponse {
    unique_id: String,
    response_rx: oneshot::Receiver<Result<CallResult, TransportError>>,
    table: Option<Arc<PendingCalls>>,
}

impl PendingResponse {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Wait for the correlated response, giving up after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<CallResult, TransportError> {
        match tokio::time::timeout(timeout, self.response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                if let Some(table) = &self.table {
                    table.forget(&self.unique_id);
                }
                Err(TransportError::Timeout {
                    unique_id: self.unique_id,
                    timeout,
                })
            }
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Register `call` as outstanding and queue it for delivery.
    ///
    /// Queueing is synchronous, so calls leave in the order they were sent.
    fn send_call(&self, call: Call) -> Result<PendingResponse, TransportError>;
}

/// Channel-backed connection to a central system.
///
/// Frames to send come out of the receiver returned by [`Connection::new`];
/// frames received from the peer go in through [`Connection::deliver`].
#[derive(Debug)]
pub struct Connection {
    pending: Arc<PendingCalls>,
    outgoing_tx: mpsc::UnboundedSender<OcppMessage>,
    connected: AtomicBool,
}

impl Connection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OcppMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            pending: PendingCalls::new(),
            outgoing_tx,
            connected: AtomicBool::new(true),
        };
        (connection, outgoing_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Queue a response to a call received from the peer.
    pub fn send(&self, message: OcppMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outgoing_tx
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Route a response received from the peer to its waiting caller.
    pub fn deliver(&self, message: OcppMessage) -> bool {
        self.pending.resolve(message)
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    /// Mark the link as lost and abandon every outstanding call.
    pub fn disconnect(&self) -> usize {
        self.connected.store(false, Ordering::Release);
        let abandoned = self.pending.abandon_all();
        if abandoned > 0 {
            warn!("Connection lost, abandoned {} outstanding call(s)", abandoned);
        }
        abandoned
    }
}

impl Transport for Connection {
    fn send_call(&self, call: Call) -> Result<PendingResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let unique_id = call.unique_id.clone();
        let pending = self.pending.register(&unique_id)?;
        if self.outgoing_tx.send(OcppMessage::Call(call)).is_err() {
            self.pending.forget(&unique_id);
            return Err(TransportError::Disconnected);
        }
        Ok(pending)
    }
}

const LOOPBACK_HISTORY: usize = 256;

/// Transport for simulation-only runs: every call is acknowledged at once
/// with an empty CALLRESULT.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    sent: Mutex<VecDeque<Call>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent calls, oldest first.
    pub fn sent_calls(&self) -> Vec<Call> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn send_call(&self, call: Call) -> Result<PendingResponse, TransportError> {
        debug!("Loopback {} call {}", call.action, call.unique_id);
        let (response_tx, response_rx) = oneshot::channel();
        let _ = response_tx.send(Ok(CallResult {
            unique_id: call.unique_id.clone(),
            payload: json!({}),
        }));
        let unique_id = call.unique_id.clone();

        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        if sent.len() == LOOPBACK_HISTORY {
            sent.pop_front();
        }
        sent.push_back(call);

        Ok(PendingResponse {
            unique_id,
            response_rx,
            table: None,
        })
    }
}
