//! The recovery protocol end to end, over the worker's HTTP surface

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use nestmail::rpc::frame::RpcFrame;
use nestmail::workers::recovery::{CodeSender, RecoveryState, build_frame};

struct Recorder(Arc<Mutex<Vec<String>>>);

impl CodeSender for Recorder {
    fn send_code(&self, _contact: &str, temp_code: &str) {
        self.0.lock().push(temp_code.to_owned());
    }
}

fn recovery_frame(name: &str) -> (Arc<RpcFrame>, Arc<Mutex<Vec<String>>>, PathBuf) {
    let mut dir = std::env::temp_dir();
    dir.push(format!("nestmail-recit-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let state = RecoveryState::new(&dir, Some(Box::new(Recorder(Arc::clone(&sent)))))
        .expect("state builds");
    (build_frame(state, "RSECRET".to_owned()), sent, dir)
}

async fn post(frame: &Arc<RpcFrame>, path: &str, body: Value) -> (u16, Value) {
    let request = axum::http::Request::builder()
        .method("POST")
        .uri(path)
        .body(axum::body::Body::from(body.to_string()))
        .expect("request builds");
    let response = Arc::clone(frame)
        .router()
        .oneshot(request)
        .await
        .expect("router runs");
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body reads");
    (
        status,
        serde_json::from_slice(&bytes).unwrap_or(Value::Null),
    )
}

#[tokio::test]
async fn landing_page_is_public() {
    let (frame, _sent, dir) = recovery_frame("landing");
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/")
        .body(axum::body::Body::empty())
        .expect("request builds");
    let response = Arc::clone(&frame)
        .router()
        .oneshot(request)
        .await
        .expect("router runs");
    assert_eq!(response.status().as_u16(), 200);
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body reads");
    assert!(String::from_utf8_lossy(&body).contains("Secret Recovery Service"));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn register_recover_code_over_http() {
    let (frame, sent, dir) = recovery_frame("flow");

    // The recovery endpoints are public paths (they carry their own secrets)
    let (status, registered) = post(
        &frame,
        "/recovery_svc/register",
        json!({"hint": "H", "passcode": "1111-22-3456", "contacts": ["a@x.tld"]}),
    )
    .await;
    assert_eq!(status, 200);
    let id = registered["id"].as_i64().expect("id present");
    let reset_code = registered["reset_code"].as_str().expect("code present").to_owned();
    assert_eq!(registered["expires"], id);

    // Nonexistent id -> 400
    let (status, _) = post(
        &frame,
        "/recovery_svc/recover",
        json!({"id": 42, "reset_code": reset_code}),
    )
    .await;
    assert_eq!(status, 400);

    // Wrong reset code -> 400
    let (status, _) = post(
        &frame,
        "/recovery_svc/recover",
        json!({"id": id, "reset_code": "9999-99-9999"}),
    )
    .await;
    assert_eq!(status, 400);

    // Correct recover masks the contact and sends the temp code
    let (status, recovered) = post(
        &frame,
        "/recovery_svc/recover",
        json!({"id": id, "reset_code": reset_code}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(recovered["sent_to"][0], "a*@*.tld");
    let temp_code = sent.lock()[0].clone();

    // Wrong temp code -> 400, right one releases passcode_b exactly once
    let (status, _) = post(
        &frame,
        "/recovery_svc/code",
        json!({"id": id, "reset_code": reset_code, "temporary_code": "000000"}),
    )
    .await;
    assert_eq!(status, 400);

    let (status, released) = post(
        &frame,
        "/recovery_svc/code",
        json!({"id": id, "reset_code": reset_code, "temporary_code": temp_code}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(released["passcode"], "1111-22-3456");

    let (status, _) = post(
        &frame,
        "/recovery_svc/recover",
        json!({"id": id, "reset_code": reset_code}),
    )
    .await;
    assert_eq!(status, 400, "records are single-use");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn register_validation_is_strict() {
    let (frame, _sent, dir) = recovery_frame("validation");
    for bad in [
        json!({"passcode": "letters", "contacts": ["a@x.tld"]}),
        json!({"passcode": "1111-22-3456", "contacts": ["not an address"]}),
        json!({"passcode": "1111-22-3456", "contacts": []}),
        json!({"passcode": "1111-22-3456", "contacts": ["a@x.tld", "b@x.tld", "c@x.tld", "d@x.tld"]}),
    ] {
        let (status, _) = post(&frame, "/recovery_svc/register", bad).await;
        assert_eq!(status, 400);
    }
    let _ = std::fs::remove_dir_all(dir);
}
