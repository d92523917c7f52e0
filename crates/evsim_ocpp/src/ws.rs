//! OCPP 1.6 WebSocket client
//!
//! One client per station. It keeps the link to the central system alive,
//! pumps queued frames out and routes received frames to the station's
//! controller.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header},
    },
};
use tracing::{debug, error, info, warn};

use crate::controller::ChargePointController;
use crate::messages::OcppMessage;
use crate::transport::Connection;

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Central system WebSocket URL; the station id is appended as last path segment
    pub central_system_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            central_system_url: "ws://localhost:9000/ocpp".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Invalid central system URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// How a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Build the full OCPP WebSocket URL for a station
pub fn station_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

pub struct WsClient {
    config: WsClientConfig,
    controller: Arc<ChargePointController<Connection>>,
    outgoing_rx: mpsc::UnboundedReceiver<OcppMessage>,
}

impl WsClient {
    /// `outgoing_rx` must be the receiver paired with the controller's connection.
    pub fn new(
        config: WsClientConfig,
        controller: Arc<ChargePointController<Connection>>,
        outgoing_rx: mpsc::UnboundedReceiver<OcppMessage>,
    ) -> Self {
        Self {
            config,
            controller,
            outgoing_rx,
        }
    }

    fn station_id(&self) -> String {
        self.controller.station().with(|station| station.id().to_string())
    }

    /// Run the connection loop until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let station_id = self.station_id();
        let url = station_url(&self.config.central_system_url, &station_id);
        let mut reconnect_delay = self.config.reconnect_delay;

        // Calls made before the first handshake fail fast instead of queueing
        self.controller.transport().disconnect();

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Connecting station {} to {}", station_id, url);
            match self.connect_and_run(&url, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Dropped) => {
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    error!("Station {} could not connect: {}", station_id, e);
                }
            }

            info!("Reconnecting station {} in {:?}", station_id, reconnect_delay);
            let stop = tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }

        info!("Station {} connection loop stopped", station_id);
    }

    async fn connect_and_run(
        &mut self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, WsError> {
        let mut request = url
            .into_client_request()
            .map_err(|source| WsError::InvalidUrl {
                url: url.to_string(),
                source,
            })?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let (ws_stream, response) = connect_async(request).await?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "Central system did not accept {}, got: {:?}",
                OCPP_SUBPROTOCOL, accepted_protocol
            );
        }
        info!("WebSocket connected to {}", url);

        // Replies queued for a previous session are meaningless now
        while self.outgoing_rx.try_recv().is_ok() {}
        let connection = Arc::clone(self.controller.transport());
        connection.connect();

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let end = loop {
            tokio::select! {
                outgoing = self.outgoing_rx.recv() => {
                    let Some(message) = outgoing else {
                        break SessionEnd::Shutdown;
                    };
                    let text = match message.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize message {}: {}", message.unique_id(), e);
                            continue;
                        }
                    };
                    debug!("Sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        error!("Failed to send WebSocket message: {}", e);
                        break SessionEnd::Dropped;
                    }
                }

                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received: {}", text);
                            self.handle_frame(&connection, &text);
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by central system");
                            break SessionEnd::Dropped;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break SessionEnd::Dropped;
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break SessionEnd::Dropped;
                        }
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        connection.disconnect();
        Ok(end)
    }

    fn handle_frame(&self, connection: &Connection, text: &str) {
        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => {
                let reply = self.controller.handle_call(&call);
                if let Err(e) = connection.send(reply) {
                    warn!("Could not answer call {}: {}", call.unique_id, e);
                }
            }
            Ok(response) => {
                let unique_id = response.unique_id().to_string();
                if !connection.deliver(response) {
                    debug!("Dropping unsolicited response {}", unique_id);
                }
            }
            Err(e) => warn!("Dropping malformed frame from central system: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TransactionIds;
    use crate::messages::{Action, CallResult};
    use evsim_core::{ChargeStation, StationConfig, StationHandle, StationStatus};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_station_url() {
        assert_eq!(
            station_url("ws://localhost:9000/ocpp", "charger-1"),
            "ws://localhost:9000/ocpp/charger-1"
        );
        assert_eq!(
            station_url("ws://localhost:9000/ocpp/", "charger-1"),
            "ws://localhost:9000/ocpp/charger-1"
        );
    }

    async fn next_message<S>(ws: &mut S) -> OcppMessage
    where
        S: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = frame {
                return OcppMessage::parse(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_client_answers_start_transaction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (connection, outgoing_rx) = Connection::new();
        let controller = Arc::new(ChargePointController::new(
            StationHandle::new(ChargeStation::with_seed(
                StationConfig::new("charger-1", 40),
                3,
            )),
            Arc::new(connection),
            Arc::new(TransactionIds::default()),
        ));
        let config = WsClientConfig {
            central_system_url: format!("ws://{}/ocpp", addr),
            ..WsClientConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = tokio::spawn(
            WsClient::new(config, Arc::clone(&controller), outgoing_rx).run(shutdown_rx),
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            assert_eq!(request.uri().path(), "/ocpp/charger-1");
            assert_eq!(
                request.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
                OCPP_SUBPROTOCOL
            );
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(OCPP_SUBPROTOCOL),
            );
            Ok(response)
        })
        .await
        .unwrap();

        ws.send(Message::Text(
            r#"[2,"cs-1","StartTransaction",{"connectorId":1,"idTag":"TAG-1"}]"#.to_string(),
        ))
        .await
        .unwrap();

        let mut notification_id = None;
        let mut reply = None;
        for _ in 0..2 {
            match next_message(&mut ws).await {
                OcppMessage::Call(call) => {
                    assert_eq!(call.action().unwrap(), Action::StatusNotification);
                    assert_eq!(call.payload["status"], "Charging");
                    notification_id = Some(call.unique_id);
                }
                OcppMessage::CallResult(result) => reply = Some(result),
                other => panic!("Unexpected frame {:?}", other),
            }
        }

        let reply = reply.expect("StartTransaction answered");
        assert_eq!(reply.unique_id, "cs-1");
        assert_eq!(reply.payload["idTagInfo"]["status"], "Accepted");
        assert_eq!(reply.payload["transactionId"], 1);
        assert_eq!(
            controller.station().snapshot().status,
            StationStatus::Charging
        );

        let notification_id = notification_id.expect("StatusNotification sent");
        let ack = CallResult::new(notification_id, json!({})).unwrap();
        ws.send(Message::Text(ack.to_text().unwrap())).await.unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .expect("client stops on shutdown")
            .unwrap();
        assert!(!controller.transport().is_connected());
    }

    #[tokio::test]
    async fn test_client_stops_while_waiting_to_reconnect() {
        // Nothing listens on this port once the listener is dropped
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (connection, outgoing_rx) = Connection::new();
        let controller = Arc::new(ChargePointController::new(
            StationHandle::new(ChargeStation::new(StationConfig::new("charger-2", 40))),
            Arc::new(connection),
            Arc::new(TransactionIds::default()),
        ));
        let config = WsClientConfig {
            central_system_url: format!("ws://{}", addr),
            ..WsClientConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = tokio::spawn(WsClient::new(config, controller, outgoing_rx).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), client)
            .await
            .expect("client stops during backoff")
            .unwrap();
    }
}
