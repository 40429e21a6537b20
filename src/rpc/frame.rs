//! HTTP request dispatcher with path-prefix secret authentication
//!
//! Every worker serves `http://127.0.0.1:<port>/<secret>/<method>`. The
//! secret is a random token embedded in the URL handed to clients;
//! declared public paths skip authentication but never reach
//! state-mutating handlers. Dispatch is an explicit handler table keyed by
//! method path with longest-prefix fallback to `<prefix>/*` entries.
//!
//! `/<secret>/rpc` (or `/ws`) upgrades to a WebSocket carrying
//! newline-delimited JSON frames. Requests on one connection are processed
//! in arrival order, so responses for a `req_id` never reorder; pushed
//! notifications ride a bounded broadcast queue that drops the oldest
//! frame on overflow and counts the loss.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::wire::{Notification, RequestEnvelope};
use crate::errors::{ApiError, AppResult};

/// Notification frames buffered per connection before old ones drop
const NOTIFY_QUEUE_FRAMES: usize = 64;

/// Largest accepted HTTP request body
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Who is calling, as established by the path secret
#[derive(Debug, Clone)]
pub enum Caller {
    /// The worker's own secret: full access
    Owner,
    /// An access-grant bearer token
    Token(String),
    /// A declared public path; no capabilities at all
    Public,
}

/// One registered HTTP handler
pub type HttpHandler = Arc<
    dyn Fn(Caller, Value) -> Pin<Box<dyn Future<Output = AppResult<Value>> + Send>>
        + Send
        + Sync,
>;

/// Handler for WebSocket request frames
pub type WsHandler = Arc<
    dyn Fn(Caller, RequestEnvelope) -> Pin<Box<dyn Future<Output = Value> + Send>>
        + Send
        + Sync,
>;

/// Mint a fresh URL-safe worker secret (128 bits)
pub fn make_secret() -> String {
    use base64::Engine;
    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(entropy)
}

/// The per-worker RPC surface
pub struct RpcFrame {
    secret: String,
    public_paths: Vec<String>,
    public_prefixes: Vec<String>,
    handlers: HashMap<String, HttpHandler>,
    ws_handler: Option<WsHandler>,
    /// Resolves non-owner secrets (access tokens); None rejects them
    token_check: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    notify_tx: broadcast::Sender<String>,
    /// Notifications dropped due to slow consumers
    pub websocket_errors: AtomicU64,
}

impl RpcFrame {
    pub fn new(secret: String) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_QUEUE_FRAMES);
        Self {
            secret,
            public_paths: Vec::new(),
            public_prefixes: Vec::new(),
            handlers: HashMap::new(),
            ws_handler: None,
            token_check: None,
            notify_tx,
            websocket_errors: AtomicU64::new(0),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Declare a path that skips authentication (e.g. `/ping`)
    pub fn public_path(mut self, path: &str) -> Self {
        self.public_paths.push(path.to_owned());
        self
    }

    /// Declare a prefix whose subtree skips authentication
    pub fn public_prefix(mut self, prefix: &str) -> Self {
        self.public_prefixes.push(prefix.to_owned());
        self
    }

    /// Register a handler for a method path (use `foo/*` for a subtree)
    pub fn handle<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(Caller, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Value>> + Send + 'static,
    {
        self.handlers.insert(
            path.trim_matches('/').to_owned(),
            Arc::new(move |caller, body| Box::pin(handler(caller, body))),
        );
        self
    }

    /// Register the WebSocket frame handler
    pub fn handle_ws<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Caller, RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.ws_handler = Some(Arc::new(move |caller, envelope| {
            Box::pin(handler(caller, envelope))
        }));
        self
    }

    /// Install the access-token validator for non-owner secrets
    pub fn check_tokens(
        mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.token_check = Some(Arc::new(check));
        self
    }

    /// Push a notification frame to every connected WebSocket
    pub fn notify(&self, notification: &Notification) {
        // No receivers is fine; nobody is listening
        let _ = self.notify_tx.send(notification.to_frame());
    }

    /// Resolve a request path to `(caller, method)`
    ///
    /// # Errors
    ///
    /// `Denied` for a missing or wrong secret on a non-public path.
    fn authenticate(&self, path: &str) -> AppResult<(Caller, String)> {
        let clean = format!("/{}", path.trim_start_matches('/'));
        if self.public_paths.iter().any(|p| p == &clean)
            || self.public_prefixes.iter().any(|p| clean.starts_with(p.as_str()))
        {
            return Ok((Caller::Public, clean.trim_matches('/').to_owned()));
        }

        let mut parts = clean.trim_start_matches('/').splitn(2, '/');
        let secret = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default().trim_matches('/');
        if secret.is_empty() {
            return Err(ApiError::bad_secret());
        }
        if secret == self.secret {
            return Ok((Caller::Owner, method.to_owned()));
        }
        if let Some(check) = &self.token_check {
            if check(secret) {
                return Ok((Caller::Token(secret.to_owned()), method.to_owned()));
            }
        }
        Err(ApiError::bad_secret())
    }

    /// Longest-prefix handler lookup with `/*` fallbacks
    fn find_handler(&self, method: &str) -> Option<&HttpHandler> {
        if let Some(handler) = self.handlers.get(method) {
            return Some(handler);
        }
        let mut prefix = method;
        while let Some(pos) = prefix.rfind('/') {
            prefix = &prefix[..pos];
            if let Some(handler) = self.handlers.get(&format!("{prefix}/*")) {
                return Some(handler);
            }
        }
        self.handlers.get("*")
    }

    /// Build the axum router serving this frame
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }

    /// Bind a localhost listener and serve until the process ends
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> AppResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "worker RPC surface listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ApiError::Network(format!("RPC server failed: {e}")))
    }
}

fn error_response(err: &ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if matches!(err, ApiError::Denied { kind, .. } if kind == "bad-secret") {
        // Secret mismatches keep the terse classic body
        return (status, "Bad secret").into_response();
    }
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        err.to_wire().to_string(),
    )
        .into_response()
}

async fn dispatch(State(frame): State<Arc<RpcFrame>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_owned();

    let (caller, method) = match frame.authenticate(&path) {
        Ok(found) => found,
        Err(err) => {
            debug!(path, "rejected request");
            return error_response(&err);
        }
    };

    // WebSocket upgrade points
    if method == "rpc" || method == "ws" {
        if matches!(caller, Caller::Public) {
            return error_response(&ApiError::bad_secret());
        }
        if let Ok(upgrade) = WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            let frame = Arc::clone(&frame);
            return upgrade
                .on_upgrade(move |socket| websocket_session(frame, caller, socket));
        }
    }

    let Some(handler) = frame.find_handler(&method) else {
        return error_response(&ApiError::NotFound(format!("no handler for /{method}")));
    };

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(&ApiError::invalid(format!("unreadable body: {e}")));
        }
    };
    let request: Value = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                return error_response(&ApiError::invalid(format!("bad JSON body: {e}")));
            }
        }
    };

    match handler(caller, request).await {
        Ok(Value::String(text)) => (StatusCode::OK, text).into_response(),
        Ok(value) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// One WebSocket connection: sequential request processing plus the
/// notification fan-out
async fn websocket_session(frame: Arc<RpcFrame>, caller: Caller, socket: WebSocket) {
    let Some(handler) = frame.ws_handler.clone() else {
        return;
    };
    let (mut sink, mut stream) = socket.split();
    let mut notifications = frame.notify_tx.subscribe();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive failed");
                        break;
                    }
                };
                // One frame per line; requests on this connection are
                // handled in arrival order
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    let reply = match RequestEnvelope::parse(line) {
                        Ok(envelope) => {
                            let envelope = envelope.normalized();
                            handler(caller.clone(), envelope).await
                        }
                        Err(err) => err.to_wire(),
                    };
                    let mut framed = reply.to_string();
                    framed.push('\n');
                    if sink.send(Message::Text(framed.into())).await.is_err() {
                        return;
                    }
                }
            }
            pushed = notifications.recv() => {
                match pushed {
                    Ok(framed) => {
                        if sink.send(Message::Text(framed.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        // Backpressure: the oldest undelivered frames are gone
                        frame
                            .websocket_errors
                            .fetch_add(dropped, Ordering::Relaxed);
                        warn!(dropped, "notification queue overflowed");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};
    use tower::util::ServiceExt;

    use super::{RpcFrame, make_secret};
    use crate::errors::ApiError;

    fn test_frame() -> Arc<RpcFrame> {
        Arc::new(
            RpcFrame::new("sekrit".to_owned())
                .public_path("/ping")
                .handle("ping", |_caller, _body| async { Ok(json!("Pong")) })
                .handle("echo", |_caller, body: Value| async move {
                    Ok(json!({"echoed": body}))
                })
                .handle("locked", |_caller, _body| async {
                    Err::<Value, _>(ApiError::need_passphrase())
                })
                .handle("files/*", |_caller, _body| async {
                    Ok(json!({"subtree": true}))
                })
                .check_tokens(|token| token == "GOODTOKEN"),
        )
    }

    async fn post(frame: Arc<RpcFrame>, path: &str, body: &str) -> (u16, String) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .body(axum::body::Body::from(body.to_owned()))
            .expect("request builds");
        let response = frame.router().oneshot(request).await.expect("router runs");
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body reads");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn ping_skips_authentication() {
        let (status, body) = post(test_frame(), "/ping", "").await;
        assert_eq!(status, 200);
        assert_eq!(body, "Pong");
    }

    #[tokio::test]
    async fn secret_paths_dispatch_and_reject() {
        let frame = test_frame();
        let (status, body) = post(Arc::clone(&frame), "/sekrit/echo", r#"{"x": 1}"#).await;
        assert_eq!(status, 200);
        let value: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(value["echoed"]["x"], 1);

        let (status, body) = post(Arc::clone(&frame), "/wrong/echo", "{}").await;
        assert_eq!(status, 403);
        assert_eq!(body, "Bad secret");

        let (status, _) = post(frame, "/echo", "{}").await;
        assert_eq!(status, 403, "missing secret");
    }

    #[tokio::test]
    async fn access_tokens_authenticate_too() {
        let frame = test_frame();
        let (status, _) = post(Arc::clone(&frame), "/GOODTOKEN/echo", "{}").await;
        assert_eq!(status, 200);
        let (status, _) = post(frame, "/BADTOKEN/echo", "{}").await;
        assert_eq!(status, 403);
    }

    #[tokio::test]
    async fn prefix_fallback_handlers() {
        let frame = test_frame();
        let (status, body) =
            post(Arc::clone(&frame), "/sekrit/files/a/b/c", "{}").await;
        assert_eq!(status, 200);
        assert!(body.contains("subtree"));

        let (status, _) = post(frame, "/sekrit/missing", "{}").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn locked_handlers_return_the_structured_denial() {
        let (status, body) = post(test_frame(), "/sekrit/locked", "{}").await;
        assert_eq!(status, 403);
        let value: Value = serde_json::from_str(&body).expect("structured denial");
        assert_eq!(value["exception"], "AccessDenied");
        assert_eq!(value["exc_data"]["kind"], "need-passphrase");
    }

    #[test]
    fn secrets_are_long_and_url_safe() {
        let secret = make_secret();
        assert!(secret.len() >= 20);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(make_secret(), secret);
    }
}
