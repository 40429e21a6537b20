//! The OpenPGP worker: stateless OP operations plus the key-store cascade
//!
//! Runs in its own process. Encrypt/decrypt/sign/verify shell out to a
//! configured SOP implementation (the `sop` CLI by default); key material
//! in arguments may be given as `@CERT:<fingerprint>` or `@PKEY:<address>`
//! placeholders which are expanded to real key bytes through the cascade,
//! with per-session caching. The worker starts locked and receives its
//! derived encryption keys from the app worker over localhost IPC.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{bind_localhost, publish_worker, unpublish_worker};
use crate::crypto::keystore::autocrypt::{AutocryptHeader, AutocryptKeyStore, IncomingMessage, ProcessOutcome};
use crate::crypto::keystore::{
    DEFAULT_KEYSTORES, KeyStoreRegistry, PrioritizedKeyStores, StoreResources,
};
use crate::errors::{ApiError, AppResult};
use crate::rpc::frame::{Caller, RpcFrame, make_secret};

/// Placeholder prefixes expanded by the key cache
const CERT_PREFIX: &str = "@CERT:";
const PKEY_PREFIX: &str = "@PKEY:";

/// Per-session cache of resolved key material
///
/// Lives until `drop_caches`; lookups that miss go through the cascade.
pub struct CachingKeyManager {
    certs: Mutex<HashMap<String, Vec<u8>>>,
    private_keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl CachingKeyManager {
    pub fn new() -> Self {
        Self {
            certs: Mutex::new(HashMap::new()),
            private_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn drop_caches(&self) {
        self.certs.lock().clear();
        self.private_keys.lock().clear();
    }

    /// Expand one argument if it is a key placeholder
    pub fn filter_arg(
        &self,
        stores: &PrioritizedKeyStores,
        arg: &str,
    ) -> AppResult<Vec<u8>> {
        if let Some(fingerprint) = arg.strip_prefix(CERT_PREFIX) {
            if let Some(cert) = self.certs.lock().get(fingerprint) {
                return Ok(cert.clone());
            }
            let cert = stores.get_cert(fingerprint, None)?;
            self.certs
                .lock()
                .insert(fingerprint.to_owned(), cert.clone());
            return Ok(cert);
        }
        if let Some(address) = arg.strip_prefix(PKEY_PREFIX) {
            if let Some(key) = self.private_keys.lock().get(address) {
                return Ok(key.clone());
            }
            let key = stores
                .find_private_keys(address, Some(1), None)
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::NotFound(format!("no private key for {address}")))?;
            self.private_keys
                .lock()
                .insert(address.to_owned(), key.clone());
            return Ok(key);
        }
        Ok(arg.as_bytes().to_vec())
    }
}

impl Default for CachingKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for a Stateless OpenPGP (SOP) command-line implementation
pub struct SopClient {
    command: String,
}

impl SopClient {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(|| "sop".to_owned()),
        }
    }

    /// Run one SOP operation with key material as indirect file arguments
    ///
    /// Key bytes never appear on the command line: each resolved key is
    /// written to a private temp file and passed by path.
    pub async fn run(
        &self,
        operation: &str,
        key_args: &[Vec<u8>],
        flags: &[String],
        stdin: &[u8],
    ) -> AppResult<Vec<u8>> {
        let workdir = std::env::temp_dir().join(format!(
            "nestmail-sop-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&workdir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&workdir, std::fs::Permissions::from_mode(0o700))?;
        }

        let mut command = tokio::process::Command::new(&self.command);
        command.arg(operation);
        for flag in flags {
            command.arg(flag);
        }
        for (i, key) in key_args.iter().enumerate() {
            let path = workdir.join(format!("key-{i}"));
            std::fs::write(&path, key)?;
            command.arg(path);
        }

        let result = async {
            let mut child = command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    ApiError::internal(format!("cannot run SOP backend '{}': {e}", self.command))
                })?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(stdin).await?;
            }
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| ApiError::internal(format!("SOP backend failed: {e}")))?;
            if !output.status.success() {
                return Err(ApiError::RemoteProtocol(format!(
                    "SOP {operation} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(output.stdout)
        }
        .await;

        let _ = std::fs::remove_dir_all(&workdir);
        result
    }
}

/// Shared state behind the OpenPGP worker's handlers
pub struct OpenPgpState {
    /// Built on `unlock`, once encryption keys arrive from the app worker
    stores: Mutex<Option<Arc<PrioritizedKeyStores>>>,
    /// Direct handle to the Autocrypt member of the cascade
    autocrypt: Mutex<Option<Arc<AutocryptKeyStore>>>,
    cache: CachingKeyManager,
    sop: SopClient,
    resources_template: StoreResources,
    keystore_config: String,
    shutdown: tokio::sync::Notify,
}

impl OpenPgpState {
    pub fn new(profile_dir: &Path, keystore_config: Option<String>, sop: SopClient) -> Arc<Self> {
        Arc::new(Self {
            stores: Mutex::new(None),
            autocrypt: Mutex::new(None),
            cache: CachingKeyManager::new(),
            sop,
            resources_template: StoreResources {
                data_dir: profile_dir.to_owned(),
                file_namespace: "openpgp".to_owned(),
                tag_namespace: None,
                encryption_keys: Vec::new(),
            },
            keystore_config: keystore_config.unwrap_or_else(|| DEFAULT_KEYSTORES.to_owned()),
            shutdown: tokio::sync::Notify::new(),
        })
    }

    /// Build the cascade with the provided key generations
    ///
    /// The Autocrypt store is constructed once and shared between the
    /// cascade and the state-machine handlers.
    pub fn unlock(&self, keys: Vec<[u8; 32]>) -> AppResult<()> {
        let mut resources = self.resources_template.clone();
        resources.encryption_keys = keys;

        let autocrypt = Arc::new(AutocryptKeyStore::open(None, &resources)?);
        let mut registry = KeyStoreRegistry::with_builtins();
        {
            let autocrypt = Arc::clone(&autocrypt);
            registry.register("autocrypt", move |_which, _res| {
                Ok(Arc::clone(&autocrypt) as Arc<dyn crate::crypto::keystore::KeyStore>)
            });
        }
        let stores =
            PrioritizedKeyStores::from_config(&self.keystore_config, &registry, &resources)?;
        *self.stores.lock() = Some(Arc::new(stores));
        *self.autocrypt.lock() = Some(autocrypt);
        info!("OpenPGP keystore cascade ready");
        Ok(())
    }

    fn stores(&self) -> AppResult<Arc<PrioritizedKeyStores>> {
        self.stores
            .lock()
            .clone()
            .ok_or_else(ApiError::need_passphrase)
    }

    fn autocrypt(&self) -> AppResult<Arc<AutocryptKeyStore>> {
        self.autocrypt
            .lock()
            .clone()
            .ok_or_else(ApiError::need_passphrase)
    }

    fn deadline_from(&self, body: &Value) -> Option<Instant> {
        body.get("deadline_ms")
            .and_then(Value::as_u64)
            .map(|ms| Instant::now() + Duration::from_millis(ms))
    }
}

/// Handle one OpenPGP worker request
pub async fn dispatch(state: &Arc<OpenPgpState>, method: &str, body: Value) -> AppResult<Value> {
    match method {
        "unlock" => {
            let keys: Vec<String> = serde_json::from_value(
                body.get("keys").cloned().unwrap_or_default(),
            )
            .map_err(|e| ApiError::invalid(format!("bad unlock request: {e}")))?;
            let mut decoded = Vec::with_capacity(keys.len());
            for key in keys {
                let bytes = B64
                    .decode(&key)
                    .map_err(|e| ApiError::invalid(format!("bad key encoding: {e}")))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ApiError::invalid("keys must be 32 bytes"))?;
                decoded.push(key);
            }
            state.unlock(decoded)?;
            Ok(json!({ "unlocked": true }))
        }
        "drop_caches" => {
            state.cache.drop_caches();
            Ok(json!({ "dropped": true }))
        }
        "get_cert" => {
            let fingerprint = required_str(&body, "fingerprint")?;
            let stores = state.stores()?;
            let deadline = state.deadline_from(&body);
            let cert = tokio::task::spawn_blocking(move || {
                stores.get_cert(&fingerprint, deadline)
            })
            .await
            .map_err(|e| ApiError::internal(format!("lookup task failed: {e}")))??;
            Ok(json!({ "cert": B64.encode(cert) }))
        }
        "find_certs" | "list_certs" => {
            let terms = required_str(&body, "terms")?;
            let max_results = body.get("max_results").and_then(Value::as_u64);
            let stores = state.stores()?;
            let deadline = state.deadline_from(&body);
            let listing = method == "list_certs";
            let found = tokio::task::spawn_blocking(move || {
                if listing {
                    let infos = stores.list_certs(&terms, max_results.map(|m| m as usize), deadline);
                    json!({
                        "keyinfo": infos
                            .iter()
                            .map(|info| json!({
                                "fingerprint": info.fingerprint,
                                "user_ids": info.user_ids,
                                "created": info.created,
                            }))
                            .collect::<Vec<_>>(),
                    })
                } else {
                    let certs = stores.find_certs(&terms, max_results.map(|m| m as usize), deadline);
                    json!({
                        "certs": certs.iter().map(|c| B64.encode(c)).collect::<Vec<_>>(),
                    })
                }
            })
            .await
            .map_err(|e| ApiError::internal(format!("search task failed: {e}")))?;
            Ok(found)
        }
        "save_cert" => {
            let cert = B64
                .decode(required_str(&body, "cert")?)
                .map_err(|e| ApiError::invalid(format!("bad cert encoding: {e}")))?;
            let which = body.get("which").and_then(Value::as_str).map(str::to_owned);
            let stores = state.stores()?;
            tokio::task::spawn_blocking(move || stores.save_cert(&cert, which.as_deref()))
                .await
                .map_err(|e| ApiError::internal(format!("save task failed: {e}")))??;
            Ok(json!({ "saved": true }))
        }
        "delete_cert" => {
            let fingerprint = required_str(&body, "fingerprint")?;
            let which = body.get("which").and_then(Value::as_str).map(str::to_owned);
            let stores = state.stores()?;
            let removed = tokio::task::spawn_blocking(move || {
                stores.delete_cert(&fingerprint, which.as_deref())
            })
            .await
            .map_err(|e| ApiError::internal(format!("delete task failed: {e}")))??;
            Ok(json!({ "deleted": removed }))
        }
        "process_email" => {
            let message = decode_incoming(&body)?;
            let now = body
                .get("now")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp());
            let autocrypt = state.autocrypt()?;
            let outcome = tokio::task::spawn_blocking(move || {
                autocrypt.process_email(&message, now)
            })
            .await
            .map_err(|e| ApiError::internal(format!("autocrypt task failed: {e}")))??;
            Ok(json!({
                "outcome": match outcome {
                    ProcessOutcome::Changed => "changed",
                    ProcessOutcome::Unchanged => "unchanged",
                    ProcessOutcome::Ignored => "ignored",
                }
            }))
        }
        "recommend" => {
            let addr = required_str(&body, "addr")?;
            let autocrypt = state.autocrypt()?;
            let recommendation = tokio::task::spawn_blocking(move || {
                Ok::<_, ApiError>(match autocrypt.get_peer(&addr)? {
                    Some(peer) => peer.recommendation(),
                    None => "unavailable",
                })
            })
            .await
            .map_err(|e| ApiError::internal(format!("autocrypt task failed: {e}")))??;
            Ok(json!({ "recommendation": recommendation }))
        }
        "encrypt" | "decrypt" | "sign" | "verify" => {
            let data = B64
                .decode(required_str(&body, "data")?)
                .map_err(|e| ApiError::invalid(format!("bad data encoding: {e}")))?;
            let args: Vec<String> = body
                .get("args")
                .cloned()
                .map(|a| serde_json::from_value(a))
                .transpose()
                .map_err(|e| ApiError::invalid(format!("bad args: {e}")))?
                .unwrap_or_default();
            let flags: Vec<String> = body
                .get("flags")
                .cloned()
                .map(|f| serde_json::from_value(f))
                .transpose()
                .map_err(|e| ApiError::invalid(format!("bad flags: {e}")))?
                .unwrap_or_default();

            // Expand @CERT:/@PKEY: placeholders through the cache
            let stores = state.stores()?;
            let mut key_args = Vec::with_capacity(args.len());
            for arg in &args {
                key_args.push(state.cache.filter_arg(&stores, arg)?);
            }
            let output = state.sop.run(method, &key_args, &flags, &data).await?;
            Ok(json!({ "output": B64.encode(output) }))
        }
        "ping" => Ok(json!({ "pong": true })),
        other => Err(ApiError::NotFound(format!("unknown operation '{other}'"))),
    }
}

fn required_str(body: &Value, field: &str) -> AppResult<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ApiError::invalid(format!("missing field '{field}'")))
}

fn decode_incoming(body: &Value) -> AppResult<IncomingMessage> {
    let message = body
        .get("message")
        .ok_or_else(|| ApiError::invalid("missing field 'message'"))?;
    let headers = message
        .get("autocrypt")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(AutocryptHeader::parse)
                .collect()
        })
        .unwrap_or_default();
    Ok(IncomingMessage {
        content_type: message
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("text/plain")
            .to_owned(),
        date_ts: message.get("date_ts").and_then(Value::as_i64).unwrap_or(0),
        from_addr: required_str(message, "from_addr")?,
        message_id: message
            .get("message_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned(),
        autocrypt: headers,
    })
}

/// Build the OpenPGP worker's RPC frame
pub fn build_frame(state: Arc<OpenPgpState>, secret: String) -> Arc<RpcFrame> {
    let mut frame = RpcFrame::new(secret).public_path("/ping");
    frame = frame.handle("ping", |_caller, _body| async { Ok(json!("Pong")) });

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
        frame = frame.handle("*", move |_caller, body| {
            let state = Arc::clone(&state);
            async move {
                let method = body
                    .get("method")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                match method {
                    Some(method) => dispatch(&state, &method, body).await,
                    None => Err(ApiError::invalid("missing field 'method'")),
                }
            }
        });
    }

    // Named routes for the common operations
    for method in [
        "unlock",
        "drop_caches",
        "get_cert",
        "find_certs",
        "list_certs",
        "save_cert",
        "delete_cert",
        "process_email",
        "recommend",
        "encrypt",
        "decrypt",
        "sign",
        "verify",
    ] {
        let state = Arc::clone(&state);
        frame = frame.handle(method, move |_caller, body| {
            let state = Arc::clone(&state);
            async move { dispatch(&state, method, body).await }
        });
    }

    Arc::new(frame)
}

/// Run the OpenPGP worker until asked to quit
pub async fn run(profile_dir: &Path, port: u16) -> AppResult<()> {
    let state = OpenPgpState::new(profile_dir, None, SopClient::new(None));
    let frame = build_frame(Arc::clone(&state), make_secret());

    let (listener, bound) = bind_localhost(port).await?;
    publish_worker(profile_dir, "openpgp", bound, frame.secret())?;
    debug!(port = bound, "OpenPGP worker running");

    let serving = Arc::clone(&frame).serve(listener);
    tokio::select! {
        result = serving => result,
        () = state.shutdown.notified() => {
            unpublish_worker(profile_dir, "openpgp");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{OpenPgpState, SopClient, dispatch};

    fn temp_state(name: &str) -> (Arc<OpenPgpState>, std::path::PathBuf) {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-pgpw-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("temp dir created");
        (
            OpenPgpState::new(&dir, Some("local:shared, autocrypt".to_owned()), SopClient::new(None)),
            dir,
        )
    }

    const TEST_KEY_B64: &str = "\
mDMEXEcE6RYJKwYBBAHaRw8BAQdArjWwk3FAqyiFbFBKT4TzXcVBqPTB3gmzlC/Ub7O1u\
120JkFsaWNlIExvdmVsYWNlIDxhbGljZUBvcGVucGdwLmV4YW1wbGU+iJAEExYIADgCGwMFCwkIBwI\
GFQoJCAsCBBYCAwECHgECF4AWIQTrhbtfozp14V6UTmPyMVUMT0fjjgUCXaWfOgAKCRDyMVUMT0fjj\
ukrAPoDnHBSogOmsHOsd9qGsiZpgRnOdypvbm+QtXZqth9rvwD9HcDC0tC+PHAsO7OTh1S1TC9RiJs\
vawAfCPaQZoed8gK4OARcRwTpEgorBgEEAZdVAQUBAQdAQv8GIa2rSTzgqbXCpDDYMiKRVitCsy203\
x3sE9+eviIDAQgHiHgEGBYIACAWIQTrhbtfozp14V6UTmPyMVUMT0fjjgUCXEcE6QIbDAAKCRDyMVU\
MT0fjjlnQAQDFHUs6TIcxrNTtEZFjUFm1M0PJ1Dng/cDW4xN80fsn0QEA22Kr7VkCjeAEC08VSTeV+\
QFsmz55/lntWkwYWhmvOgE=";

    #[tokio::test]
    async fn locked_worker_demands_keys_first() {
        let (state, dir) = temp_state("locked");
        let err = dispatch(&state, "get_cert", json!({"fingerprint": "ABCD"}))
            .await
            .expect_err("locked lookup fails");
        assert_eq!(err.kind(), "permission-denied");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unlock_save_and_lookup_cycle() {
        let (state, dir) = temp_state("cycle");
        let keys = json!({ "keys": [base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD, [7u8; 32])] });
        dispatch(&state, "unlock", keys).await.expect("unlock succeeds");

        dispatch(&state, "save_cert", json!({ "cert": TEST_KEY_B64 }))
            .await
            .expect("save succeeds");

        let found = dispatch(
            &state,
            "find_certs",
            json!({ "terms": "alice@openpgp.example" }),
        )
        .await
        .expect("search succeeds");
        assert_eq!(found["certs"].as_array().map(Vec::len), Some(1));

        let listed = dispatch(
            &state,
            "list_certs",
            json!({ "terms": "alice@openpgp.example" }),
        )
        .await
        .expect("listing succeeds");
        assert_eq!(
            listed["keyinfo"][0]["fingerprint"],
            "EB85BB5FA33A75E15E944E63F231550C4F47E38E"
        );

        let autocrypt = dispatch(
            &state,
            "process_email",
            json!({
                "message": {
                    "from_addr": "alice@openpgp.example",
                    "date_ts": 1_681_919_824i64,
                    "message_id": "<hello>",
                    "autocrypt": [format!(
                        "addr=alice@openpgp.example; prefer-encrypt=mutual; keydata={TEST_KEY_B64}"
                    )],
                },
                "now": 1_681_919_900i64,
            }),
        )
        .await
        .expect("autocrypt processing succeeds");
        assert_eq!(autocrypt["outcome"], "changed");

        let rec = dispatch(&state, "recommend", json!({"addr": "alice@openpgp.example"}))
            .await
            .expect("recommendation succeeds");
        assert_eq!(rec["recommendation"], "encrypt");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn cache_dropping_is_idempotent() {
        let (state, dir) = temp_state("caches");
        dispatch(&state, "drop_caches", json!({})).await.expect("drop succeeds");
        dispatch(&state, "drop_caches", json!({})).await.expect("drop succeeds");
        let _ = std::fs::remove_dir_all(dir);
    }
}
