//! RPC clients: JSON over HTTP and streaming WebSocket
//!
//! Workers call each other (and the CLI calls workers) through the URL
//! published in `workers/<kind>.url`, which already embeds the secret.
//! HTTP errors carrying the structured wire form are re-raised as typed
//! errors. The WebSocket stream reconnects with bounded exponential
//! backoff when the connection drops.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::errors::{ApiError, AppResult};

/// Reconnect backoff bounds for WebSocket streams
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// JSON-over-HTTP client for one worker
pub struct RpcClient {
    /// `http://127.0.0.1:<port>/<secret>/` (trailing slash required)
    base_url: String,
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(base_url: &str) -> Self {
        let base_url = if base_url.ends_with('/') {
            base_url.to_owned()
        } else {
            format!("{base_url}/")
        };
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The WebSocket endpoint corresponding to this client
    pub fn websocket_url(&self) -> String {
        format!(
            "ws{}rpc",
            self.base_url.trim_start_matches("http")
        )
    }

    /// POST a method call; non-2xx responses become typed errors
    pub async fn call(&self, method: &str, body: &Value) -> AppResult<Value> {
        let url = format!("{}{}", self.base_url, method.trim_start_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("RPC call failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("RPC read failed: {e}")))?;

        if status.is_success() {
            let value =
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));
            // need-info travels as a 200 so clients treat it as a retry
            // request, not a failure; re-raise it typed anyway
            if value.get("exception").is_some() {
                return Err(ApiError::from_wire(&value));
            }
            return Ok(value);
        }
        if let Ok(wire) = serde_json::from_str::<Value>(&text) {
            if wire.get("exception").is_some() {
                return Err(ApiError::from_wire(&wire));
            }
        }
        if status.as_u16() == 403 {
            return Err(ApiError::bad_secret());
        }
        Err(ApiError::RemoteProtocol(format!(
            "HTTP {status}: {}",
            text.chars().take(120).collect::<String>()
        )))
    }

    /// Liveness probe
    pub async fn ping(&self) -> bool {
        matches!(
            self.call("ping", &Value::Null).await,
            Ok(Value::String(pong)) if pong.eq_ignore_ascii_case("pong")
        )
    }
}

/// A resilient WebSocket stream to a worker
///
/// Frames sent through [`WsBridge::sender`] go to the current connection;
/// frames received are delivered to the returned receiver. Disconnects
/// trigger reconnection with bounded exponential backoff, resetting after
/// a successful connect.
pub struct WsBridge {
    pub sender: mpsc::Sender<String>,
    pub receiver: mpsc::Receiver<String>,
}

impl WsBridge {
    /// Spawn the bridge task for a `ws://` URL
    pub fn spawn(url: String) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            let mut backoff = BACKOFF_START;
            loop {
                let socket = match connect_async(&url).await {
                    Ok((socket, _)) => {
                        debug!(url, "websocket connected");
                        backoff = BACKOFF_START;
                        socket
                    }
                    Err(err) => {
                        warn!(url, error = %err, "websocket connect failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        continue;
                    }
                };
                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => {
                            match outgoing {
                                Some(frame) => {
                                    if sink.send(Message::Text(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                                None => return,
                            }
                        }
                        incoming = stream.next() => {
                            match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                                        if in_tx.send(line.to_owned()).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    debug!(error = %err, "websocket stream failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        });

        Self {
            sender: out_tx,
            receiver: in_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RpcClient;

    #[test]
    fn websocket_url_derivation() {
        let client = RpcClient::new("http://127.0.0.1:8025/SECRET");
        assert_eq!(client.base_url(), "http://127.0.0.1:8025/SECRET/");
        assert_eq!(
            client.websocket_url(),
            "ws://127.0.0.1:8025/SECRET/rpc"
        );
    }
}
