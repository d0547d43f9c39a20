//! Backend command intake
//!
//! Two entry points feed the [`Dispatcher`]:
//! - `POST /command/`: synchronous, answers with the charge point's reply
//! - the command queue: asynchronous, forwards without waiting for a reply

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::Router;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::validator::validate;
use crate::backend::CommandSource;
use crate::domain::{CommandError, ErrorResponse, QueuedCommand, RemoteCommandRequest};

/// Build the HTTP command API
pub fn command_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/command/", any(command_handler))
        .route("/command", any(command_handler))
        .with_state(dispatcher)
}

fn reject(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { detail: detail.into() })).into_response()
}

/// POST /command/
async fn command_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return reject(StatusCode::METHOD_NOT_ALLOWED, format!("Invalid Method {}", method));
    }

    let req: RemoteCommandRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("Invalid request body: {}", String::from_utf8_lossy(&body));
            return reject(StatusCode::BAD_REQUEST, format!("Invalid request body {}", e));
        }
    };

    let outcome = match validate(&req) {
        Some(reason) => Err(CommandError::Validation(reason)),
        None => dispatcher.dispatch(&req).await,
    };

    match outcome {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            debug!(station = %req.cp_id, command = %req.command, "Command rejected: {}", e);
            reject(StatusCode::BAD_REQUEST, e.detail())
        }
    }
}

/// Consumer of the backend command queue
pub struct CommandQueue {
    source: Arc<dyn CommandSource>,
    dispatcher: Arc<Dispatcher>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl CommandQueue {
    pub fn new(source: Arc<dyn CommandSource>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            source,
            dispatcher,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Consume the queue until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Command queue consumer started");
        let mut backoff = self.initial_backoff;

        while !*shutdown.borrow() && shutdown.has_changed().is_ok() {
            // Not raced against shutdown: an item popped by an in-flight poll
            // is delivered before the flag is checked again. The poll itself
            // is bounded by the source's poll timeout.
            let next = self.source.next().await;

            match next {
                Ok(Some(raw)) => {
                    backoff = self.initial_backoff;
                    if let Err(e) = self.process(&raw).await {
                        warn!("Dropping queued command: {} ({})", e, raw);
                    }
                }
                Ok(None) => backoff = self.initial_backoff,
                Err(e) => {
                    warn!("Command queue unavailable, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }

        info!("Command queue consumer stopped");
    }

    /// Decode one queue item and forward it to its charge point
    pub async fn process(&self, raw: &str) -> Result<(), CommandError> {
        let item = QueuedCommand::from_json(raw.as_bytes())?;
        let call = item.to_call()?;
        self.dispatcher.forward(&item.cp_id, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelError, MemoryChannel};
    use crate::bridge::dispatcher::tests::StubRegistry;
    use crate::ocpp::Action;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri("/command/")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn app_with(registry: StubRegistry) -> (Router, Arc<StubRegistry>) {
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        (command_router(dispatcher), registry)
    }

    const REMOTE_START: &str =
        r#"{"cp_id": "CP1", "command": "remote_start_transaction", "data": {"tag": "RFID-12345", "connector_id": 1}}"#;

    #[tokio::test]
    async fn remote_start_against_connected_station() {
        let (app, registry) = app_with(StubRegistry::connected("CP1", json!({"status": "Accepted"})));

        let (status, body) = call(app, "POST", REMOTE_START).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Accepted");
        assert_eq!(body["detail"], "OK");
        assert_eq!(registry.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn remote_start_against_disconnected_station() {
        let (app, _) = app_with(StubRegistry::empty());

        let (status, body) = call(app, "POST", REMOTE_START).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"detail": "Charger not connected"}));
    }

    #[tokio::test]
    async fn validation_runs_before_lookup() {
        let (app, _) = app_with(StubRegistry::empty());

        let (status, body) = call(app.clone(), "POST", r#"{"cp_id": "CP1", "data": {}}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Command required");

        let (_, body) = call(app.clone(), "POST", r#"{"command": "get_configuration", "data": {}}"#).await;
        assert_eq!(body["detail"], "CpId required");

        let (_, body) = call(app, "POST", r#"{"cp_id": "CP1", "command": "get_configuration"}"#).await;
        assert_eq!(body["detail"], "Data required");
    }

    #[tokio::test]
    async fn malformed_body() {
        let (app, _) = app_with(StubRegistry::empty());

        let (status, body) = call(app, "POST", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().starts_with("Invalid request body "));
    }

    #[tokio::test]
    async fn wrong_method() {
        let (app, _) = app_with(StubRegistry::empty());

        let (status, body) = call(app, "GET", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["detail"], "Invalid Method GET");
    }

    #[tokio::test]
    async fn unsupported_command_and_bad_data() {
        let (app, _) = app_with(StubRegistry::connected("CP1", json!({"status": "Accepted"})));

        let (_, body) = call(app.clone(), "POST", r#"{"cp_id": "CP1", "command": "reboot", "data": {}}"#).await;
        assert_eq!(body["detail"], "Invalid command");

        let (_, body) = call(
            app,
            "POST",
            r#"{"cp_id": "CP1", "command": "remote_stop_transaction", "data": {"transaction_id": "x"}}"#,
        )
        .await;
        assert_eq!(body["detail"], "Invalid command data");
    }

    #[tokio::test]
    async fn route_without_trailing_slash() {
        let (app, _) = app_with(StubRegistry::connected("CP1", json!({"status": "Accepted"})));
        let req = Request::builder()
            .method("POST")
            .uri("/command")
            .body(Body::from(REMOTE_START))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    fn queue_with(registry: Arc<StubRegistry>, channel: Arc<MemoryChannel>) -> CommandQueue {
        CommandQueue::new(channel, Arc::new(Dispatcher::new(registry)))
    }

    #[tokio::test]
    async fn queue_survives_malformed_items() {
        let registry = Arc::new(StubRegistry::connected("CP1", json!({})));
        let channel = Arc::new(MemoryChannel::new().with_poll_timeout(Duration::from_millis(20)));
        channel.push_command("garbage");
        channel.push_command(r#"{"CpID": "CP9", "data": ["ClearCache", {}]}"#);
        channel.push_command(r#"{"CpID": "CP1", "data": ["Explode", {}]}"#);
        channel.push_command(r#"{"CpID": "CP1", "data": ["ClearCache", {}]}"#);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(queue_with(registry.clone(), channel).run(shutdown_rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.sent.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let sent = registry.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::ClearCache);
    }

    #[tokio::test]
    async fn queue_translates_object_items() {
        let registry = Arc::new(StubRegistry::connected("CP1", json!({})));
        let queue = queue_with(registry.clone(), Arc::new(MemoryChannel::new()));

        queue
            .process(r#"{"CpID": "CP1", "data": {"command": "change_configuration", "data": {"key": "K", "value": "V"}}}"#)
            .await
            .unwrap();

        let sent = registry.sent.lock();
        assert_eq!(sent[0].action, Action::ChangeConfiguration);
        assert_eq!(sent[0].payload, json!({"key": "K", "value": "V"}));
    }

    struct FlakySource {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CommandSource for FlakySource {
        async fn next(&self) -> Result<Option<String>, ChannelError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::Transport("connection reset".into()));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Some(r#"{"CpID": "CP1", "data": ["ClearCache", {}]}"#.to_string()))
        }
    }

    #[tokio::test]
    async fn queue_backs_off_and_resumes() {
        let registry = Arc::new(StubRegistry::connected("CP1", json!({})));
        let source = Arc::new(FlakySource { failures: AtomicUsize::new(3) });
        let queue = CommandQueue::new(source.clone(), Arc::new(Dispatcher::new(registry.clone())))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(queue.run(shutdown_rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.sent.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(source.failures.load(Ordering::SeqCst), 0);
        assert!(!registry.sent.lock().is_empty());
    }

    /// Pops one item only after a delay, signalling when the poll starts
    struct SlowSource {
        started: tokio::sync::Notify,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl CommandSource for SlowSource {
        async fn next(&self) -> Result<Option<String>, ChannelError> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.delivered.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(r#"{"CpID": "CP1", "data": ["ClearCache", {}]}"#.to_string()))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn shutdown_during_poll_delivers_popped_item() {
        let registry = Arc::new(StubRegistry::connected("CP1", json!({})));
        let source = Arc::new(SlowSource {
            started: tokio::sync::Notify::new(),
            delivered: AtomicUsize::new(0),
        });
        let queue = CommandQueue::new(source.clone(), Arc::new(Dispatcher::new(registry.clone())));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(queue.run(shutdown_rx));

        source.started.notified().await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(source.delivered.load(Ordering::SeqCst), 1);
        let sent = registry.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::ClearCache);
    }
}
