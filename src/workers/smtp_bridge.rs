//! The SMTP bridge worker: queue-less relay to an upstream server
//!
//! Accepts `deliver` requests over the RPC frame and forwards the message
//! to the configured upstream submission server in one SMTP dialogue.
//! Nothing is ever written to disk; a delivery either completes or the
//! caller gets the error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{bind_localhost, publish_worker, unpublish_worker};
use crate::config::store::{Config, SMTP_BRIDGE};
use crate::errors::{ApiError, AppResult};
use crate::rpc::frame::{Caller, RpcFrame, make_secret};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One relayed message
#[derive(Debug, serde::Deserialize)]
pub struct DeliverRequest {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    /// Base64 of the raw RFC822 message
    pub data: String,
}

/// Shared state behind the bridge handlers
pub struct BridgeState {
    /// `host:port` of the upstream submission server
    upstream: Option<String>,
    shutdown: tokio::sync::Notify,
}

impl BridgeState {
    pub fn new(upstream: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            shutdown: tokio::sync::Notify::new(),
        })
    }

    pub fn from_config(config: &Config) -> AppResult<Arc<Self>> {
        let upstream = config.read(|store| store.get_text(SMTP_BRIDGE, "upstream"))?;
        Ok(Self::new(upstream))
    }
}

async fn read_reply(stream: &mut BufStream<TcpStream>) -> AppResult<(u16, String)> {
    let mut text = String::new();
    loop {
        let mut line = String::new();
        let read = timeout(SMTP_TIMEOUT, stream.read_line(&mut line))
            .await
            .map_err(|_| ApiError::Timeout("SMTP read timed out".to_owned()))?
            .map_err(|e| ApiError::Network(format!("SMTP read failed: {e}")))?;
        if read == 0 {
            return Err(ApiError::Network("SMTP server closed connection".to_owned()));
        }
        text.push_str(&line);
        // Multi-line replies continue with `NNN-`; the last line is `NNN `
        if line.len() >= 4 && line.as_bytes()[3] == b' ' {
            let code = line[..3]
                .parse()
                .map_err(|_| ApiError::RemoteProtocol(format!("bad SMTP reply: {line}")))?;
            return Ok((code, text));
        }
        if line.len() < 4 {
            return Err(ApiError::RemoteProtocol(format!("bad SMTP reply: {line}")));
        }
    }
}

async fn send_command(
    stream: &mut BufStream<TcpStream>,
    command: &str,
    accept: &[u16],
) -> AppResult<(u16, String)> {
    timeout(SMTP_TIMEOUT, async {
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await
    })
    .await
    .map_err(|_| ApiError::Timeout("SMTP write timed out".to_owned()))?
    .map_err(|e| ApiError::Network(format!("SMTP write failed: {e}")))?;

    let (code, text) = read_reply(stream).await?;
    if !accept.contains(&code) {
        return Err(ApiError::RemoteProtocol(format!(
            "SMTP rejected '{}': {code} {}",
            command.split_whitespace().next().unwrap_or(command),
            text.trim()
        )));
    }
    Ok((code, text))
}

/// Dot-stuff and terminate a message body per RFC 5321
fn encode_body(raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(raw.len() + 8);
    for line in raw.split_inclusive(|b| *b == b'\n') {
        if line.first() == Some(&b'.') {
            body.push(b'.');
        }
        body.extend_from_slice(line);
    }
    if !body.ends_with(b"\r\n") && !body.ends_with(b"\n") {
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b".\r\n");
    body
}

/// Relay one message to the upstream server
pub async fn deliver(upstream: &str, request: &DeliverRequest) -> AppResult<Value> {
    if request.rcpt_to.is_empty() {
        return Err(ApiError::invalid("no recipients"));
    }
    let raw = B64
        .decode(&request.data)
        .map_err(|e| ApiError::invalid(format!("bad message encoding: {e}")))?;

    debug!(upstream, recipients = request.rcpt_to.len(), "relaying message");
    let tcp = timeout(SMTP_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| ApiError::Timeout(format!("SMTP connect timeout to {upstream}")))?
        .map_err(|e| ApiError::Network(format!("SMTP connect failed: {e}")))?;
    let mut stream = BufStream::new(tcp);

    let (code, _) = read_reply(&mut stream).await?;
    if code != 220 {
        return Err(ApiError::RemoteProtocol(format!(
            "unexpected SMTP greeting: {code}"
        )));
    }

    send_command(&mut stream, "EHLO nestmail.bridge", &[250]).await?;
    send_command(
        &mut stream,
        &format!("MAIL FROM:<{}>", request.mail_from),
        &[250],
    )
    .await?;
    let mut accepted = 0usize;
    for rcpt in &request.rcpt_to {
        if send_command(&mut stream, &format!("RCPT TO:<{rcpt}>"), &[250, 251])
            .await
            .is_ok()
        {
            accepted += 1;
        }
    }
    if accepted == 0 {
        return Err(ApiError::RemoteProtocol(
            "every recipient was rejected".to_owned(),
        ));
    }
    send_command(&mut stream, "DATA", &[354]).await?;

    let body = encode_body(&raw);
    timeout(SMTP_TIMEOUT, async {
        stream.write_all(&body).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| ApiError::Timeout("SMTP data timed out".to_owned()))?
    .map_err(|e| ApiError::Network(format!("SMTP data failed: {e}")))?;

    let (code, text) = read_reply(&mut stream).await?;
    if code != 250 {
        return Err(ApiError::RemoteProtocol(format!(
            "message rejected: {code} {}",
            text.trim()
        )));
    }
    let _ = send_command(&mut stream, "QUIT", &[221]).await;

    Ok(json!({ "delivered": accepted, "rejected": request.rcpt_to.len() - accepted }))
}

/// Build the bridge worker's RPC frame
pub fn build_frame(state: Arc<BridgeState>, secret: String) -> Arc<RpcFrame> {
    let mut frame = RpcFrame::new(secret).public_path("/ping");
    frame = frame.handle("ping", |_caller, _body| async { Ok(json!("Pong")) });

    {
        let state = Arc::clone(&state);
        frame = frame.handle("deliver", move |caller, body| {
            let state = Arc::clone(&state);
            async move {
                if !matches!(caller, Caller::Owner) {
                    return Err(ApiError::bad_secret());
                }
                let request: DeliverRequest = serde_json::from_value(body)
                    .map_err(|e| ApiError::invalid(format!("bad deliver request: {e}")))?;
                let upstream = state.upstream.clone().ok_or_else(|| {
                    ApiError::NotFound("no upstream SMTP server configured".to_owned())
                })?;
                deliver(&upstream, &request).await
            }
        });
    }
    {
        let state = Arc::clone(&state);
        frame = frame.handle("quit", move |caller, _body| {
            let state = Arc::clone(&state);
            async move {
                if !matches!(caller, Caller::Owner) {
                    return Err(ApiError::bad_secret());
                }
                state.shutdown.notify_one();
                Ok(json!({ "quitting": true }))
            }
        });
    }

    Arc::new(frame)
}

/// Run the bridge worker until asked to quit
pub async fn run(profile_dir: &Path, port: u16) -> AppResult<()> {
    let config = Config::open(profile_dir)?;
    let state = BridgeState::from_config(&config)?;
    let frame = build_frame(Arc::clone(&state), make_secret());

    let (listener, bound) = bind_localhost(port).await?;
    publish_worker(profile_dir, "smtp_bridge", bound, frame.secret())?;
    info!(port = bound, "SMTP bridge running");

    let serving = Arc::clone(&frame).serve(listener);
    tokio::select! {
        result = serving => result,
        () = state.shutdown.notified() => {
            unpublish_worker(profile_dir, "smtp_bridge");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
    use tokio::net::TcpListener;

    use super::{DeliverRequest, deliver, encode_body};

    #[test]
    fn bodies_are_dot_stuffed_and_terminated() {
        let body = encode_body(b"hello\r\n.leading dot\r\nbye\r\n");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("\r\n..leading dot\r\n"));
        assert!(text.ends_with("\r\n.\r\n"));
    }

    async fn scripted_smtp(listener: TcpListener) {
        let (sock, _) = listener.accept().await.expect("client connects");
        let mut stream = BufStream::new(sock);
        stream.write_all(b"220 test ESMTP\r\n").await.expect("greeting");
        stream.flush().await.expect("flush");

        let mut in_data = false;
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let reply: &[u8] = if in_data {
                if line.trim_end() == "." {
                    in_data = false;
                    b"250 queued\r\n"
                } else {
                    continue;
                }
            } else if line.starts_with("EHLO") {
                b"250-test greets you\r\n250 OK\r\n"
            } else if line.starts_with("MAIL") || line.starts_with("RCPT TO:<good") {
                b"250 OK\r\n"
            } else if line.starts_with("RCPT") {
                b"550 no such user\r\n"
            } else if line.starts_with("DATA") {
                in_data = true;
                b"354 go ahead\r\n"
            } else if line.starts_with("QUIT") {
                let _ = stream.write_all(b"221 bye\r\n").await;
                let _ = stream.flush().await;
                return;
            } else {
                b"500 what\r\n"
            };
            stream.write_all(reply).await.expect("reply");
            stream.flush().await.expect("flush");
        }
    }

    #[tokio::test]
    async fn relays_to_accepted_recipients_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind succeeds");
        let addr = listener.local_addr().expect("addr available");
        tokio::spawn(scripted_smtp(listener));

        let request = DeliverRequest {
            mail_from: "bre@example.org".to_owned(),
            rcpt_to: vec!["good@example.org".to_owned(), "bad@example.org".to_owned()],
            data: base64::engine::general_purpose::STANDARD
                .encode(b"Subject: hi\r\n\r\nhello\r\n"),
        };
        let result = deliver(&format!("127.0.0.1:{}", addr.port()), &request)
            .await
            .expect("delivery succeeds");
        assert_eq!(result["delivered"], 1);
        assert_eq!(result["rejected"], 1);
    }
}
