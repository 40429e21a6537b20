//! The app worker: search/index/tag API and peer supervision
//!
//! Owns the configuration and the metadata store, serves the main RPC
//! surface (HTTP and WebSocket), launches the peer workers, and fans
//! notifications out to connected clients. Every state-requiring
//! operation checks the unlock state first and answers with the
//! `need-passphrase` denial while locked.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Supervisor, bind_localhost, publish_worker, unpublish_worker};
use crate::config::access::Grant;
use crate::config::schema::ContextInfo;
use crate::config::store::{CONTEXT_ZERO, Config};
use crate::crypto::aes::derive_aes_key;
use crate::errors::{ApiError, AppResult};
use crate::filters::{AutoTagger, FilterContext, FilterEngine};
use crate::rpc::frame::{Caller, RpcFrame, make_secret};
use crate::rpc::wire::{
    Notification, RequestAddToIndex, RequestChangePassphrase, RequestCounts, RequestEmail,
    RequestEnvelope, RequestMailbox, RequestSearch, RequestUnlock,
};
use crate::storage::mailbox::{import_mailbox, load_raw};
use crate::storage::metadata::MetadataStore;

/// Shared state behind every app-worker handler
pub struct AppState {
    pub profile_dir: PathBuf,
    pub config: Config,
    /// Present once unlocked; all index operations go through here
    metadata: Mutex<Option<MetadataStore>>,
    autotaggers: Mutex<std::collections::BTreeMap<String, AutoTagger>>,
    filter: Mutex<FilterEngine>,
    frame: OnceLock<Arc<RpcFrame>>,
    shutdown: tokio::sync::Notify,
}

impl AppState {
    pub fn new(profile_dir: &Path, config: Config) -> AppResult<Arc<Self>> {
        Ok(Arc::new(Self {
            profile_dir: profile_dir.to_owned(),
            config,
            metadata: Mutex::new(None),
            autotaggers: Mutex::new(Default::default()),
            filter: Mutex::new(FilterEngine::compile(None)?),
            frame: OnceLock::new(),
            shutdown: tokio::sync::Notify::new(),
        }))
    }

    fn notify(&self, message: &str, data: Value) {
        if let Some(frame) = self.frame.get() {
            frame.notify(&Notification::new(message, data));
        }
    }

    /// Open the metadata store if the config is unlocked
    ///
    /// # Errors
    ///
    /// `Denied` with kind `need-passphrase` while locked.
    async fn require_unlocked(&self) -> AppResult<()> {
        let mut metadata = self.metadata.lock().await;
        if metadata.is_some() {
            return Ok(());
        }
        let keys = self.config.with(|store| {
            if !store.is_unlocked() {
                return Err(ApiError::need_passphrase());
            }
            if !store.has_crypto_enabled() {
                store.generate_master_key("")?;
            }
            store.get_aes_keys()
        })?;
        let dir = self.profile_dir.join("metadata");
        let derived: Vec<[u8; 32]> = keys
            .iter()
            .map(|key| derive_aes_key(b"metadata", key))
            .collect();
        let store = tokio::task::spawn_blocking(move || {
            MetadataStore::open(&dir, "metadata", derived)
        })
        .await
        .map_err(|e| ApiError::internal(format!("metadata open task failed: {e}")))??;
        *metadata = Some(store);
        Ok(())
    }

    /// Resolve the caller's grant in a context
    ///
    /// The worker's own secret has every capability; bearer tokens go
    /// through role enforcement. Public callers never reach here.
    fn grant_for(&self, caller: &Caller, context: &str, caps: &str) -> AppResult<Grant> {
        let context = if context.is_empty() {
            CONTEXT_ZERO.to_owned()
        } else {
            context.to_owned()
        };
        match caller {
            Caller::Owner => Ok(Grant {
                role: "A".to_owned(),
                tag_namespace: None,
                allowed_tags: Vec::new(),
            }),
            Caller::Token(token) => self.config.with(|store| {
                let access = store.access_from_token(token)?;
                let ctx = store
                    .find_context(&context)?
                    .ok_or_else(|| ApiError::NotFound(format!("no context '{context}'")))?;
                access.grants(store, &ctx.section, caps)?.ok_or_else(|| {
                    ApiError::Denied {
                        kind: "no-access".to_owned(),
                        message: format!("No access to {context}"),
                    }
                })
            }),
            Caller::Public => Err(ApiError::bad_secret()),
        }
    }
}

// -- operation implementations --------------------------------------------

async fn op_search(state: &AppState, caller: &Caller, req: RequestSearch) -> AppResult<Value> {
    let grant = state.grant_for(caller, &req.context, "r")?;
    state.require_unlocked().await?;
    let metadata = state.metadata.lock().await;
    let store = metadata
        .as_ref()
        .ok_or_else(ApiError::need_passphrase)?;
    let results = store.search(&req.terms, &grant.allowed_tags, req.limit, req.skip)?;
    Ok(json!({
        "terms": req.terms,
        "total": results.len(),
        "results": results,
    }))
}

async fn op_counts(state: &AppState, caller: &Caller, req: RequestCounts) -> AppResult<Value> {
    let grant = state.grant_for(caller, &req.context, "r")?;
    state.require_unlocked().await?;
    let metadata = state.metadata.lock().await;
    let store = metadata
        .as_ref()
        .ok_or_else(ApiError::need_passphrase)?;
    let terms = if req.terms_list.is_empty() {
        vec!["*".to_owned()]
    } else {
        req.terms_list
    };
    Ok(serde_json::to_value(store.counts(&terms, &grant.allowed_tags))?)
}

async fn op_mailbox(state: &AppState, caller: &Caller, req: RequestMailbox) -> AppResult<Value> {
    state.grant_for(caller, &req.context, "r")?;
    state.require_unlocked().await?;
    let metadata = state.metadata.lock().await;
    let store = metadata
        .as_ref()
        .ok_or_else(ApiError::need_passphrase)?;
    let results = store.in_mailbox(&req.mailbox, req.limit, req.skip)?;
    Ok(json!({
        "mailbox": req.mailbox,
        "total": results.len(),
        "results": results,
    }))
}

async fn op_email(state: &AppState, caller: &Caller, req: RequestEmail) -> AppResult<Value> {
    state.grant_for(caller, "", "r")?;
    state.require_unlocked().await?;
    let metadata = state.metadata.lock().await;
    let store = metadata
        .as_ref()
        .ok_or_else(ApiError::need_passphrase)?;
    let meta = store
        .get(&req.metadata)?
        .ok_or_else(|| ApiError::NotFound(format!("no message {}", req.metadata)))?;

    let mut response = json!({ "metadata": meta });
    if req.text || req.data {
        let keys = state.config.read(|store| store.get_aes_keys())?;
        let raw = meta
            .pointers
            .iter()
            .find_map(|pointer| load_raw(pointer, &keys).ok())
            .ok_or_else(|| ApiError::NotFound("no readable copy on disk".to_owned()))?;
        if req.data {
            use base64::Engine;
            response["data"] =
                json!(base64::engine::general_purpose::STANDARD.encode(&raw));
        }
        if req.text {
            response["text"] = json!(String::from_utf8_lossy(&raw).into_owned());
        }
    }
    Ok(response)
}

async fn op_contexts(state: &AppState, caller: &Caller) -> AppResult<Value> {
    state.grant_for(caller, "", "r")?;
    state.config.with(|store| {
        let mut contexts = Vec::new();
        for ctx in store.contexts()? {
            contexts.push(ctx.as_json(store)?);
        }
        Ok(json!({ "contexts": contexts }))
    })
}

async fn op_add_to_index(
    state: &AppState,
    caller: &Caller,
    req: RequestAddToIndex,
) -> AppResult<Value> {
    state.grant_for(caller, &req.context, "F")?;
    state.require_unlocked().await?;
    let keys = state.config.read(|store| store.get_aes_keys())?;

    let mut metadata = state.metadata.lock().await;
    let store = metadata
        .as_mut()
        .ok_or_else(ApiError::need_passphrase)?;

    let path = PathBuf::from(&req.search);
    let indexed = import_mailbox(store, &path, &req.tags, &keys)?;

    // Run the filter script over every newly indexed message
    let filter = state.filter.lock().await;
    let autotaggers = state.autotaggers.lock().await;
    let mut filtered = 0usize;
    for key in &indexed {
        let Some(meta) = store.get(key)? else { continue };
        let mut keywords: BTreeSet<String> = meta.tags.clone();
        let ctx = FilterContext {
            metadata: &meta,
            headers: "",
            now: chrono::Utc::now().timestamp(),
            autotaggers: &autotaggers,
        };
        match filter.filter(&mut keywords, &ctx) {
            Ok(()) => {
                store.set_tags(key, keywords)?;
                filtered += 1;
            }
            Err(err) => {
                // Runtime failures skip the message but are logged
                warn!(key, error = %err, "filter script failed for message");
            }
        }
    }
    drop(autotaggers);
    drop(filter);

    state.notify(
        &format!("Indexed {} messages from {}", indexed.len(), req.search),
        json!({ "indexed": indexed.len(), "filtered": filtered }),
    );
    Ok(json!({ "indexed": indexed.len(), "keys": indexed }))
}

async fn op_unlock(state: &AppState, req: RequestUnlock) -> AppResult<Value> {
    // Passphrase stretching is deliberately slow; keep it off the loop
    let config = state.config.clone();
    tokio::task::spawn_blocking(move || {
        config.with(|store| {
            store.provide_passphrase(&req.passphrase)?;
            if !store.has_crypto_enabled() {
                store.generate_master_key("")?;
            }
            Ok(())
        })
    })
    .await
    .map_err(|e| ApiError::internal(format!("unlock task failed: {e}")))??;
    state.require_unlocked().await?;

    // Hand the OpenPGP worker its derived key generations, if it is up
    let keys = state.config.read(|store| store.get_aes_keys())?;
    let profile = state.profile_dir.clone();
    tokio::spawn(async move {
        use base64::Engine;
        let Ok(client) = super::worker_client(&profile, "openpgp").await else {
            return;
        };
        let derived: Vec<String> = keys
            .iter()
            .map(|key| {
                base64::engine::general_purpose::STANDARD
                    .encode(derive_aes_key(b"openpgp", key))
            })
            .collect();
        if let Err(err) = client.call("unlock", &json!({ "keys": derived })).await {
            warn!(error = %err, "could not unlock the OpenPGP worker");
        }
    });

    state.notify("Unlocked", json!({}));
    Ok(json!({ "unlocked": true }))
}

async fn op_change_passphrase(
    state: &AppState,
    req: RequestChangePassphrase,
) -> AppResult<Value> {
    let config = state.config.clone();
    tokio::task::spawn_blocking(move || {
        config.with(|store| {
            store.provide_passphrase(&req.old_passphrase)?;
            store.change_config_key(&req.new_passphrase)
        })
    })
    .await
    .map_err(|e| ApiError::internal(format!("rekey task failed: {e}")))??;
    Ok(json!({ "changed": true }))
}

/// Dispatch one decoded request; shared by HTTP handlers and WebSocket
pub async fn dispatch(state: &AppState, caller: &Caller, envelope: &RequestEnvelope) -> AppResult<Value> {
    match envelope.req_type.as_str() {
        "ping" => Ok(json!({ "pong": true, "ts": chrono::Utc::now().timestamp() })),
        "search" => op_search(state, caller, envelope.decode()?).await,
        "counts" | "count" => op_counts(state, caller, envelope.decode()?).await,
        "mailbox" => op_mailbox(state, caller, envelope.decode()?).await,
        "email" => op_email(state, caller, envelope.decode()?).await,
        "contexts" => op_contexts(state, caller).await,
        "add_to_index" => op_add_to_index(state, caller, envelope.decode()?).await,
        "unlock" => op_unlock(state, envelope.decode()?).await,
        "change_passphrase" => op_change_passphrase(state, envelope.decode()?).await,
        other => Err(ApiError::NotFound(format!("unknown operation '{other}'"))),
    }
}

fn http_envelope(method: &'static str, body: Value) -> RequestEnvelope {
    let fields = match body {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    RequestEnvelope {
        req_type: method.to_owned(),
        req_id: Value::Null,
        fields,
    }
}

/// Build the app worker's RPC frame over shared state
pub fn build_frame(state: Arc<AppState>, secret: String) -> Arc<RpcFrame> {
    let mut frame = RpcFrame::new(secret).public_path("/ping");

    frame = frame.handle("ping", |_caller, _body| async { Ok(json!("Pong")) });

    for method in [
        "search",
        "counts",
        "count",
        "mailbox",
        "email",
        "contexts",
        "add_to_index",
        "unlock",
        "change_passphrase",
    ] {
        let state = Arc::clone(&state);
        frame = frame.handle(method, move |caller, body| {
            let state = Arc::clone(&state);
            async move {
                let envelope = http_envelope(method, body);
                dispatch(&state, &caller, &envelope).await
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

    {
        let state = Arc::clone(&state);
        frame = frame.handle_ws(move |caller, envelope| {
            let state = Arc::clone(&state);
            async move {
                match dispatch(&state, &caller, &envelope).await {
                    Ok(body) => envelope.response(body),
                    Err(err) => envelope.error_response(&err),
                }
            }
        });
    }

    {
        let config = state.config.clone();
        frame = frame.check_tokens(move |token| {
            config.with(|store| Ok(store.access_from_token(token).is_ok())).unwrap_or(false)
        });
    }

    let frame = Arc::new(frame);
    let _ = state.frame.set(Arc::clone(&frame));
    frame
}

/// Run the app worker until asked to quit
pub async fn run(profile_dir: &Path, port: u16, supervise_peers: bool) -> AppResult<()> {
    let config = Config::open(profile_dir)?;
    let state = AppState::new(profile_dir, config)?;
    let frame = build_frame(Arc::clone(&state), make_secret());

    let (listener, bound) = bind_localhost(port).await?;
    publish_worker(profile_dir, "app", bound, frame.secret())?;

    let supervisor = Supervisor::new(profile_dir);
    if supervise_peers {
        for kind in super::PEER_WORKERS {
            supervisor.supervise(kind);
        }
    }

    // Default context + identities may have IMAP accounts worth a fetch
    // pass at startup; that loop lives with the account sync service and
    // only runs once credentials are available.
    info!(port = bound, "app worker running");
    let serving = Arc::clone(&frame).serve(listener);
    tokio::select! {
        result = serving => result,
        () = state.shutdown.notified() => {
            info!("app worker shutting down");
            supervisor.shutdown();
            unpublish_worker(profile_dir, "app");
            Ok(())
        }
    }
}

/// Context listing used by the CLI without going through HTTP
pub fn list_contexts(config: &Config) -> AppResult<Vec<ContextInfo>> {
    config.with(|store| store.contexts())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::{AppState, build_frame, dispatch};
    use crate::config::store::Config;
    use crate::rpc::frame::Caller;
    use crate::rpc::wire::RequestEnvelope;

    fn temp_profile(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-appw-{}-{name}", std::process::id()));
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

    async fn call(state: &Arc<AppState>, frame: &str) -> Value {
        let envelope = RequestEnvelope::parse(frame).expect("frame parses").normalized();
        match dispatch(state, &Caller::Owner, &envelope).await {
            Ok(body) => envelope.response(body),
            Err(err) => envelope.error_response(&err),
        }
    }

    #[tokio::test]
    async fn locked_search_asks_for_the_passphrase() {
        let dir = temp_profile("locked");
        let config = Config::open(&dir).expect("config opens");
        let state = AppState::new(&dir, config).expect("state builds");
        let _frame = build_frame(Arc::clone(&state), "S".to_owned());

        let reply = call(&state, r#"{"req_type":"search","req_id":2,"terms":"bjarni"}"#).await;
        assert_eq!(reply["req_id"], 2);
        assert_eq!(reply["error"]["exc_data"]["kind"], "need-passphrase");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unlock_index_count_search_round_trip() {
        let dir = temp_profile("e2e");
        let maildir = temp_profile("e2e-mail");
        make_maildir(&maildir, 3);
        let config = Config::open(&dir).expect("config opens");
        let state = AppState::new(&dir, config).expect("state builds");
        let _frame = build_frame(Arc::clone(&state), "S".to_owned());

        let reply = call(
            &state,
            r#"{"req_type":"unlock","req_id":1,"passphrase":"test pass"}"#,
        )
        .await;
        assert_eq!(reply["unlocked"], true);

        let reply = call(
            &state,
            &format!(
                r#"{{"req_type":"add_to_index","req_id":2,"search":{},"tags":["inbox"]}}"#,
                json!(maildir.display().to_string())
            ),
        )
        .await;
        assert_eq!(reply["indexed"], 3);

        // The cli:count bridge shape from the terminal client
        let reply = call(&state, r#"{"req_type":"cli:count","req_id":3,"args":[]}"#).await;
        assert_eq!(reply["req_id"], 3);
        assert_eq!(reply["*"], 3);

        let reply = call(
            &state,
            r#"{"req_type":"search","req_id":4,"terms":"bjarni"}"#,
        )
        .await;
        assert_eq!(reply["total"], 3);

        // Messages got the default filter's tags
        let reply = call(
            &state,
            r#"{"req_type":"search","req_id":5,"terms":"in:unread"}"#,
        )
        .await;
        assert_eq!(reply["total"], 3);

        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(maildir);
    }

    #[tokio::test]
    async fn email_fetch_returns_text() {
        let dir = temp_profile("email");
        let maildir = temp_profile("email-mail");
        make_maildir(&maildir, 1);
        let config = Config::open(&dir).expect("config opens");
        let state = AppState::new(&dir, config).expect("state builds");
        let _frame = build_frame(Arc::clone(&state), "S".to_owned());

        call(&state, r#"{"req_type":"unlock","req_id":1,"passphrase":"pw"}"#).await;
        let indexed = call(
            &state,
            &format!(
                r#"{{"req_type":"add_to_index","req_id":2,"search":{}}}"#,
                json!(maildir.display().to_string())
            ),
        )
        .await;
        let key = indexed["keys"][0].as_str().expect("one key").to_owned();

        let reply = call(
            &state,
            &format!(r#"{{"req_type":"email","req_id":3,"metadata":{},"text":true}}"#, json!(key)),
        )
        .await;
        assert!(reply["text"].as_str().expect("text present").contains("body 0"));
        assert_eq!(reply["metadata"]["subject"], "bjarni test 0");
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(maildir);
    }

    #[tokio::test]
    async fn passphrase_change_survives_operations() {
        let dir = temp_profile("rekey");
        let config = Config::open(&dir).expect("config opens");
        let state = AppState::new(&dir, config).expect("state builds");
        let _frame = build_frame(Arc::clone(&state), "S".to_owned());

        call(&state, r#"{"req_type":"unlock","req_id":1,"passphrase":"old"}"#).await;
        let reply = call(
            &state,
            r#"{"req_type":"change_passphrase","req_id":2,"old_passphrase":"old","new_passphrase":"new"}"#,
        )
        .await;
        assert_eq!(reply["changed"], true);
        let _ = std::fs::remove_dir_all(dir);
    }
}
