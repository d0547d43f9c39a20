//! OCPP central system WebSocket endpoint
//!
//! Accepts charge point connections at `ws://<addr>/<prefix>/<stationId>` and
//! implements [`SessionRegistry`] on top of them. Handles:
//! - WebSocket upgrade with `ocpp1.6` subprotocol negotiation
//! - Session registry keyed by station id (a reconnect evicts the old socket)
//! - Request/response correlation for central system initiated calls
//! - Dispatch of charge point initiated calls to a [`ChargePointHandler`]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::engine::{ChargePointHandler, Session, SessionRegistry};
use super::messages::*;
use super::types::ChargePointRequest;

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Configuration for the central system endpoint
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: SocketAddr,
    /// How long a central system initiated call waits for its reply
    pub request_timeout: Duration,
    /// Maximum accepted WebSocket message size
    pub max_message_size: usize,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10800)),
            request_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
        }
    }
}

/// Central system call awaiting the charge point's reply
struct PendingRequest {
    action: Action,
    response_tx: oneshot::Sender<Result<CallResult, OcppError>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Registry entry for one live connection
struct Connection {
    id: u64,
    session: Session,
    outgoing_tx: mpsc::Sender<OcppMessage>,
    pending: PendingMap,
    evict_tx: oneshot::Sender<()>,
}

/// OCPP central system: WebSocket listener plus live session registry
pub struct CentralSystem {
    config: CentralSystemConfig,
    connections: RwLock<HashMap<String, Connection>>,
    next_connection_id: AtomicU64,
}

impl CentralSystem {
    /// Create a new central system
    pub fn new(config: CentralSystemConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Accept charge point connections until the listener fails
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn ChargePointHandler>,
    ) -> Result<(), std::io::Error> {
        info!("Central system listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let system = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        system.handle_connection(stream, peer, handler).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Run one charge point connection until it closes
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn ChargePointHandler>,
    ) {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..Default::default()
        };

        let mut upgrade: Option<(String, Option<String>)> = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let result = negotiate(req, response);
            if let Ok((_, ref station_id, ref host)) = result {
                upgrade = Some((station_id.clone(), host.clone()));
            }
            result.map(|(response, _, _)| response)
        };

        let ws_stream = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let Some((station_id, host)) = upgrade else {
            return;
        };

        let session = Session::new(
            station_id.clone(),
            host.unwrap_or_else(|| peer.ip().to_string()),
        );
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OcppMessage>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (evict_tx, mut evict_rx) = oneshot::channel::<()>();

        {
            let mut connections = self.connections.write().await;
            let replaced = connections.insert(
                station_id.clone(),
                Connection {
                    id: connection_id,
                    session: session.clone(),
                    outgoing_tx: outgoing_tx.clone(),
                    pending: pending.clone(),
                    evict_tx,
                },
            );
            if let Some(previous) = replaced {
                warn!(station = %station_id, "Station reconnected, closing previous connection");
                let _ = previous.evict_tx.send(());
            }
        }

        info!(station = %station_id, host = %session.host, "Charge point connected from {}", peer);
        handler.on_connect(&session).await;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let writer_station = station_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let bytes = match msg.to_bytes() {
                    Ok(b) => b,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                let text = String::from_utf8_lossy(&bytes).into_owned();
                debug!(station = %writer_station, "Sending: {}", text);

                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!(station = %writer_station, "Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                _ = &mut evict_rx => {
                    info!(station = %station_id, "Connection superseded by a newer one");
                    break;
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(station = %station_id, "Received: {}", text);
                    let reply = self
                        .handle_frame(&session, text.as_bytes(), &pending, handler.as_ref())
                        .await;
                    if let Some(reply) = reply {
                        if outgoing_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(station = %station_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(station = %station_id, "WebSocket closed by charge point");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(station = %station_id, "WebSocket error: {}", e);
                    break;
                }
            }
        }

        let removed = {
            let mut connections = self.connections.write().await;
            if connections.get(&station_id).map(|c| c.id) == Some(connection_id) {
                connections.remove(&station_id);
                true
            } else {
                false
            }
        };

        // Dropping the senders wakes every waiter with ConnectionClosed
        pending.lock().clear();
        writer.abort();

        // A superseded connection leaves the station connected
        if removed {
            info!(station = %station_id, "Charge point disconnected");
            handler.on_disconnect(&session).await;
        }
    }

    /// Process one inbound text frame, returning the frame to send back (if any)
    async fn handle_frame(
        &self,
        session: &Session,
        bytes: &[u8],
        pending: &PendingMap,
        handler: &dyn ChargePointHandler,
    ) -> Option<OcppMessage> {
        match OcppMessage::parse(bytes) {
            Ok(OcppMessage::Call(call)) => {
                let message_id = call.message_id.clone();
                let outcome = match ChargePointRequest::from_call(&call) {
                    Ok(request) => handler.handle(session, request).await,
                    Err(e) => Err(e),
                };

                let reply = outcome.and_then(|response| CallResult::new(message_id.clone(), response));
                Some(match reply {
                    Ok(result) => OcppMessage::CallResult(result),
                    Err(e) => {
                        warn!(station = %session.station_id, action = %call.action, "Rejecting request: {}", e);
                        OcppMessage::CallError(CallError::new(message_id, e.error_code(), e.to_string()))
                    }
                })
            }
            Ok(OcppMessage::CallResult(result)) => {
                let waiter = pending.lock().remove(&result.message_id);
                match waiter {
                    Some(req) => {
                        debug!(station = %session.station_id, "Reply to {}", req.action);
                        let _ = req.response_tx.send(Ok(result));
                    }
                    None => debug!(station = %session.station_id, "Unsolicited reply {}", result.message_id),
                }
                None
            }
            Ok(OcppMessage::CallError(error)) => {
                let waiter = pending.lock().remove(&error.message_id);
                if let Some(req) = waiter {
                    let _ = req.response_tx.send(Err(OcppError::RemoteError {
                        code: error.error_code,
                        description: error.error_description,
                        details: error.error_details,
                    }));
                } else {
                    warn!(
                        station = %session.station_id,
                        "CALLERROR {:?} for unknown request {}: {}",
                        error.error_code, error.message_id, error.error_description
                    );
                }
                None
            }
            Err(e) => {
                warn!(station = %session.station_id, "Failed to parse OCPP message: {}", e);
                call_message_id(bytes).map(|message_id| {
                    OcppMessage::CallError(CallError::new(message_id, e.error_code(), e.to_string()))
                })
            }
        }
    }

    /// Outgoing channel and pending map of the station's current connection
    async fn route(&self, station_id: &str) -> Result<(mpsc::Sender<OcppMessage>, PendingMap), OcppError> {
        let connections = self.connections.read().await;
        let connection = connections.get(station_id).ok_or(OcppError::ConnectionClosed)?;
        Ok((connection.outgoing_tx.clone(), connection.pending.clone()))
    }
}

#[async_trait]
impl SessionRegistry for CentralSystem {
    async fn resolve(&self, station_id: &str) -> Option<Session> {
        self.connections
            .read()
            .await
            .get(station_id)
            .map(|c| c.session.clone())
    }

    async fn send(&self, session: &Session, call: Call) -> Result<CallResult, OcppError> {
        let (outgoing_tx, pending) = self.route(&session.station_id).await?;
        let message_id = call.message_id.clone();
        let (response_tx, response_rx) = oneshot::channel();

        pending.lock().insert(
            message_id.clone(),
            PendingRequest {
                action: call.action,
                response_tx,
            },
        );

        if outgoing_tx.send(OcppMessage::Call(call)).await.is_err() {
            pending.lock().remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        match tokio::time::timeout(self.config.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                pending.lock().remove(&message_id);
                Err(OcppError::Timeout)
            }
        }
    }

    async fn cast(&self, session: &Session, call: Call) -> Result<(), OcppError> {
        let (outgoing_tx, _) = self.route(&session.station_id).await?;
        outgoing_tx
            .send(OcppMessage::Call(call))
            .await
            .map_err(|_| OcppError::ConnectionClosed)
    }
}

/// Validate the upgrade request: extract station id and host, echo the subprotocol
fn negotiate(
    req: &Request,
    mut response: Response,
) -> Result<(Response, String, Option<String>), ErrorResponse> {
    let Some(station_id) = station_id_from_path(req.uri().path()) else {
        let mut rejection = ErrorResponse::new(Some("Missing charge point id in path".to_string()));
        *rejection.status_mut() = StatusCode::BAD_REQUEST;
        return Err(rejection);
    };

    let offers_ocpp16 = req
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == OCPP_SUBPROTOCOL);

    if offers_ocpp16 {
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok((response, station_id, host))
}

/// The charge point id is the last non-empty path segment
pub fn station_id_from_path(path: &str) -> Option<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::{ChargePointRequest, ChargePointResponse};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Records lifecycle callbacks as `connect:<id>` / `disconnect:<id>`
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl ChargePointHandler for Recorder {
        async fn on_connect(&self, session: &Session) {
            self.seen.lock().push(format!("connect:{}", session.station_id));
        }

        async fn on_disconnect(&self, session: &Session) {
            self.seen.lock().push(format!("disconnect:{}", session.station_id));
        }

        async fn handle(
            &self,
            _session: &Session,
            _request: ChargePointRequest,
        ) -> Result<ChargePointResponse, OcppError> {
            Err(OcppError::UnknownAction("test".into()))
        }
    }

    async fn start(request_timeout: Duration) -> (Arc<CentralSystem>, Arc<Recorder>, SocketAddr) {
        let system = Arc::new(CentralSystem::new(CentralSystemConfig {
            request_timeout,
            ..Default::default()
        }));
        let recorder = Arc::new(Recorder::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(system.clone().serve(listener, recorder.clone()));
        (system, recorder, addr)
    }

    async fn dial(addr: SocketAddr, station: &str) -> Client {
        let request = format!("ws://{}/ocpp/{}", addr, station).into_client_request().unwrap();
        connect_async(request).await.unwrap().0
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn pending_len(system: &CentralSystem, station: &str) -> usize {
        system.connections.read().await[station].pending.lock().len()
    }

    #[tokio::test]
    async fn test_reconnect_evicts_previous_connection_without_disconnect() {
        let (system, recorder, addr) = start(Duration::from_secs(1)).await;

        let mut first = dial(addr, "CP1").await;
        wait_for(|| recorder.seen().len() == 1).await;
        let _second = dial(addr, "CP1").await;
        wait_for(|| recorder.seen().len() == 2).await;

        // The superseded socket is closed by the central system
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "old connection left open");
        drop(first);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.seen(), vec!["connect:CP1", "connect:CP1"]);
        assert!(system.resolve("CP1").await.is_some());
    }

    #[tokio::test]
    async fn test_close_of_current_connection_reports_disconnect() {
        let (system, recorder, addr) = start(Duration::from_secs(1)).await;

        let mut client = dial(addr, "CP2").await;
        wait_for(|| recorder.seen().len() == 1).await;
        client.close(None).await.unwrap();

        wait_for(|| recorder.seen().len() == 2).await;
        assert_eq!(recorder.seen(), vec!["connect:CP2", "disconnect:CP2"]);
        assert!(system.resolve("CP2").await.is_none());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out_and_is_forgotten() {
        let (system, recorder, addr) = start(Duration::from_millis(200)).await;

        let mut client = dial(addr, "CP3").await;
        wait_for(|| recorder.seen().len() == 1).await;
        let session = system.resolve("CP3").await.unwrap();

        let call = Call::new(
            Action::RemoteStartTransaction,
            serde_json::json!({"idTag": "RFID-1"}),
        )
        .unwrap();
        let message_id = call.message_id.clone();

        let outcome = tokio::time::timeout(Duration::from_secs(2), system.send(&session, call))
            .await
            .expect("send not bounded by the request timeout");
        assert!(matches!(outcome, Err(OcppError::Timeout)));

        // The charge point saw the call but never answered
        let frame = tokio::time::timeout(Duration::from_secs(1), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(frame.to_text().unwrap().contains(&message_id));
        assert_eq!(pending_len(&system, "CP3").await, 0);
    }

    #[test]
    fn test_station_id_from_path() {
        assert_eq!(station_id_from_path("/CP1").as_deref(), Some("CP1"));
        assert_eq!(station_id_from_path("/ocpp/CP-042/").as_deref(), Some("CP-042"));
        assert_eq!(station_id_from_path("/"), None);
        assert_eq!(station_id_from_path(""), None);
    }

    #[tokio::test]
    async fn test_unknown_station_is_unresolved() {
        let system = CentralSystem::new(CentralSystemConfig::default());
        assert!(system.resolve("CP1").await.is_none());

        let session = Session::new("CP1", "localhost");
        let call = Call::new(Action::ClearCache, serde_json::json!({})).unwrap();
        assert!(matches!(
            system.send(&session, call).await,
            Err(OcppError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_negotiate_echoes_subprotocol() {
        let req = Request::builder()
            .uri("/ocpp/CP7")
            .header(header::SEC_WEBSOCKET_PROTOCOL, "ocpp2.0.1, ocpp1.6")
            .header(header::HOST, "cs.example.com")
            .body(())
            .unwrap();

        let (response, station, host) = negotiate(&req, Response::new(())).unwrap();
        assert_eq!(station, "CP7");
        assert_eq!(host.as_deref(), Some("cs.example.com"));
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            OCPP_SUBPROTOCOL
        );
    }

    #[test]
    fn test_negotiate_rejects_missing_station() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let rejection = negotiate(&req, Response::new(())).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
    }
}
