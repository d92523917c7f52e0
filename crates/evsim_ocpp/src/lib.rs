//! OCPP 1.6 charge point protocol layer for simulated stations

pub mod controller;
pub mod messages;
pub mod transport;
pub mod types;
pub mod ws;

pub use controller::{ChargePointController, HandlerError, NotificationError, TransactionIds};
pub use messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
pub use transport::{Connection, LoopbackTransport, PendingResponse, Transport, TransportError};
pub use ws::{WsClient, WsClientConfig};
