//! End-to-end scenarios against the app worker's RPC surface
//!
//! Drives the real router (auth, dispatch, handlers) in process via
//! `tower::ServiceExt::oneshot`, with a fresh work directory per test.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tower::util::ServiceExt;

use nestmail::config::store::Config;
use nestmail::rpc::frame::RpcFrame;
use nestmail::workers::app::{AppState, build_frame};

fn temp_profile(name: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("nestmail-it-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn make_maildir(dir: &PathBuf, count: usize) {
    for sub in ["cur", "new", "tmp"] {
        std::fs::create_dir_all(dir.join(sub)).expect("maildir subdirs");
    }
    for i in 0..count {
        std::fs::write(
            dir.join("new").join(format!("m{i}")),
            format!(
                "Message-Id: <m{i}@example.org>\r\nFrom: Bjarni <bre@example.org>\r\n\
                 Subject: bjarni test {i}\r\nDate: Wed, 1 Sep 2021 00:03:0{i} GMT\r\n\r\n\
                 body {i}\r\n"
            ),
        )
        .expect("message written");
    }
}

fn app_frame(profile: &PathBuf) -> Arc<RpcFrame> {
    let config = Config::open(profile).expect("config opens");
    let state = AppState::new(profile, config).expect("state builds");
    build_frame(state, "TESTSECRET".to_owned())
}

async fn post(frame: &Arc<RpcFrame>, path: &str, body: Value) -> (u16, Value, String) {
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
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let value = serde_json::from_str(&text).unwrap_or(Value::Null);
    (status, value, text)
}

#[tokio::test]
async fn fresh_worker_answers_ping() {
    let profile = temp_profile("ping");
    let frame = app_frame(&profile);

    // Secret-authenticated ping
    let (status, _, text) = post(&frame, "/TESTSECRET/ping", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(text, "Pong");

    // The declared public path works without any secret
    let (status, _, text) = post(&frame, "/ping", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(text, "Pong");

    let _ = std::fs::remove_dir_all(profile);
}

#[tokio::test]
async fn wrong_secret_is_rejected_with_bad_secret() {
    let profile = temp_profile("badsecret");
    let frame = app_frame(&profile);
    let (status, _, text) = post(&frame, "/WRONG/search", json!({"terms": "x"})).await;
    assert_eq!(status, 403);
    assert_eq!(text, "Bad secret");
    let _ = std::fs::remove_dir_all(profile);
}

#[tokio::test]
async fn locked_search_returns_need_passphrase() {
    let profile = temp_profile("locked");
    let frame = app_frame(&profile);
    let (status, value, _) =
        post(&frame, "/TESTSECRET/search", json!({"terms": "bjarni"})).await;
    assert_eq!(status, 403);
    assert_eq!(value["exception"], "AccessDenied");
    assert_eq!(value["exc_data"]["kind"], "need-passphrase");
    let _ = std::fs::remove_dir_all(profile);
}

#[tokio::test]
async fn unlock_index_and_count_three_messages() {
    let profile = temp_profile("count");
    let maildir = temp_profile("count-mail");
    make_maildir(&maildir, 3);
    let frame = app_frame(&profile);

    let (status, value, _) = post(
        &frame,
        "/TESTSECRET/unlock",
        json!({"passphrase": "integration test"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(value["unlocked"], true);

    let (status, value, _) = post(
        &frame,
        "/TESTSECRET/add_to_index",
        json!({"search": maildir.display().to_string(), "tags": ["inbox"]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(value["indexed"], 3);

    let (status, value, _) = post(&frame, "/TESTSECRET/count", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(value["*"], 3);

    let (status, value, _) = post(
        &frame,
        "/TESTSECRET/search",
        json!({"terms": "bjarni"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(value["total"], 3);

    let _ = std::fs::remove_dir_all(profile);
    let _ = std::fs::remove_dir_all(maildir);
}

#[tokio::test]
async fn contexts_listing_includes_the_default_context() {
    let profile = temp_profile("contexts");
    let frame = app_frame(&profile);
    let (status, value, _) = post(&frame, "/TESTSECRET/contexts", json!({})).await;
    assert_eq!(status, 200);
    let contexts = value["contexts"].as_array().expect("contexts listed");
    assert!(
        contexts
            .iter()
            .any(|c| c["key"] == "Context 0" && c["name"] == "My Mail")
    );
    let _ = std::fs::remove_dir_all(profile);
}

#[tokio::test]
async fn access_tokens_enforce_roles() {
    let profile = temp_profile("roles");
    let config = Config::open(&profile).expect("config opens");

    // Mint a token through the built-in local-access grant
    let token = config
        .with(|store| store.local_access_token())
        .expect("token minted");

    let state = AppState::new(&profile, config).expect("state builds");
    let frame = build_frame(state, "TESTSECRET".to_owned());

    // The bearer token authenticates in place of the worker secret
    let (status, value, _) = post(
        &frame,
        &format!("/{token}/search"),
        json!({"terms": "anything"}),
    )
    .await;
    assert_eq!(status, 403, "still locked, but authenticated");
    assert_eq!(value["exc_data"]["kind"], "need-passphrase");

    let (status, _, text) = post(&frame, "/EXPIREDTOKEN/search", json!({})).await;
    assert_eq!(status, 403);
    assert_eq!(text, "Bad secret");
    let _ = std::fs::remove_dir_all(profile);
}
