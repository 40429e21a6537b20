//! The recovery service worker
//!
//! Implements the three-endpoint shared-secret recovery protocol. A
//! registered record stores `{hint, passcode_b, contacts}` encrypted under
//! a key derived from a fresh random reset code; the service never sees
//! the combined passcode. Releasing `passcode_b` requires both the reset
//! code and a short-lived temp code delivered out of band to one of the
//! registered contacts.
//!
//! The register/recover/code endpoints are public paths on this worker
//! (they carry their own secrets); everything else needs the worker
//! secret.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{bind_localhost, publish_worker, unpublish_worker};
use crate::crypto::aes::make_aes_key;
use crate::crypto::recovery::{
    VALID_CODE_RE, VALID_EMAIL_RE, generate_recovery_code, generate_temp_code, mask_contact,
};
use crate::errors::{ApiError, AppResult};
use crate::rpc::frame::{Caller, RpcFrame, make_secret};
use crate::storage::records::RecordStore;

/// Records live this long before they expire
const EXPIRATION_SECS: i64 = 2 * 365 * 24 * 3600;
/// Temp codes are valid for twenty minutes
const TEMP_CODE_SECS: i64 = 20 * 60;
/// At most this many contacts per record
const MAX_CONTACTS: usize = 3;

const LANDING_PAGE: &str = r#"<html><head>
  <title>Secret Recovery Service</title>
  <style type="text/css">
    body {background: #eef; color: #111;}
    .content {margin: 0 auto 1em auto; max-width: 600px;}
  </style>
</head><body><div class=content>
  <h1>Secret Recovery Service</h1>
  <p>This service assists with privacy-preserving password recovery.
     It stores one half of a recovery passcode, encrypted under a reset
     code it does not keep, and releases it only after out-of-band
     verification. See the client documentation for the protocol.</p>
</div></body></html>
"#;

/// Sends temp codes over a contact's out-of-band channel
///
/// The production sender hands messages to the SMTP bridge; tests swap in
/// a recorder.
pub trait CodeSender: Send + Sync {
    fn send_code(&self, contact: &str, temp_code: &str);
}

/// Default sender: logs that a delivery is due (wired to the SMTP bridge
/// by deployment configuration)
struct LogSender;

impl CodeSender for LogSender {
    fn send_code(&self, contact: &str, _temp_code: &str) {
        info!(contact = %mask_contact(contact), "temp code delivery due");
    }
}

/// Shared state behind the recovery endpoints
pub struct RecoveryState {
    records: RecordStore,
    /// temp_code -> (record id, expiry)
    codes: Mutex<HashMap<String, (i64, i64)>>,
    /// Record ids are strictly monotonic expiration timestamps
    last_expiration: Mutex<i64>,
    sender: Box<dyn CodeSender>,
    shutdown: tokio::sync::Notify,
}

impl RecoveryState {
    pub fn new(profile_dir: &Path, sender: Option<Box<dyn CodeSender>>) -> AppResult<Arc<Self>> {
        let dir = profile_dir.join("recovery");
        Ok(Arc::new(Self {
            records: RecordStore::open(&dir, "recovery", Vec::new())?,
            codes: Mutex::new(HashMap::new()),
            last_expiration: Mutex::new(0),
            sender: sender.unwrap_or_else(|| Box::new(LogSender)),
            shutdown: tokio::sync::Notify::new(),
        }))
    }

    /// Pick a fresh record id: a strictly monotonic expiration timestamp
    fn next_expiration(&self, now: i64) -> i64 {
        let mut last = self.last_expiration.lock();
        let mut expiration = now + EXPIRATION_SECS;
        if expiration <= *last {
            expiration = *last + 1;
        }
        *last = expiration;
        expiration
    }

    fn record_key(id: i64) -> String {
        format!("expire:{id:x}")
    }

    /// `register` endpoint
    pub fn register(&self, body: &Value, now: i64) -> AppResult<Value> {
        let hint = body.get("hint").and_then(Value::as_str).unwrap_or("");
        let passcode = body
            .get("passcode")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let contacts: Vec<String> = body
            .get("contacts")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if !VALID_CODE_RE.is_match(passcode) {
            return Err(ApiError::invalid("Bad request"));
        }
        if contacts.is_empty() || contacts.len() > MAX_CONTACTS {
            return Err(ApiError::invalid("Bad request"));
        }
        for contact in &contacts {
            if !VALID_EMAIL_RE.is_match(contact) {
                return Err(ApiError::invalid("Bad request"));
            }
        }

        let id = self.next_expiration(now);
        let reset_code = generate_recovery_code();
        let record_aes = make_aes_key(reset_code.as_bytes());
        self.records.set(
            &Self::record_key(id),
            &json!({
                "hint": hint,
                "passcode": passcode,
                "contacts": contacts,
            }),
            Some(&record_aes),
        )?;
        debug!(id, "recovery record registered");

        Ok(json!({
            "id": id,
            "expires": id,
            "reset_code": reset_code,
        }))
    }

    fn load_record(&self, body: &Value) -> AppResult<(i64, String, Value)> {
        let id = body.get("id").and_then(Value::as_i64).unwrap_or(0);
        let reset_code = body
            .get("reset_code")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if id == 0 || !VALID_CODE_RE.is_match(reset_code) {
            return Err(ApiError::invalid("Bad request"));
        }
        let record_aes = make_aes_key(reset_code.as_bytes());
        // Unknown ids and wrong reset codes fail identically
        let info = self
            .records
            .get(&Self::record_key(id), Some(&record_aes))
            .map_err(|_| ApiError::invalid("Bad request"))?
            .ok_or_else(|| ApiError::invalid("Bad request"))?;
        Ok((id, reset_code.to_owned(), info))
    }

    /// `recover` endpoint: verify the reset code, send out temp codes
    pub fn recover(&self, body: &Value, now: i64) -> AppResult<Value> {
        let (id, _reset_code, info) = self.load_record(body)?;
        if id < now {
            return Err(ApiError::invalid("Bad request"));
        }

        let temp_code = generate_temp_code();
        let expires = now + TEMP_CODE_SECS;
        self.codes.lock().insert(temp_code.clone(), (id, expires));

        let contacts: Vec<String> = info
            .get("contacts")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        for contact in &contacts {
            self.sender.send_code(contact, &temp_code);
        }

        Ok(json!({
            "expires": expires,
            "sent_to": contacts.iter().map(|c| mask_contact(c)).collect::<Vec<_>>(),
        }))
    }

    /// `code` endpoint: release passcode_b after 2-factor verification
    ///
    /// Success is single-use: the record and temp code are deleted.
    pub fn code(&self, body: &Value, now: i64) -> AppResult<Value> {
        let (id, _reset_code, info) = self.load_record(body)?;
        let temp_code = body
            .get("temporary_code")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let valid = {
            let mut codes = self.codes.lock();
            codes.retain(|_, (_, expires)| *expires > now);
            codes
                .get(temp_code)
                .is_some_and(|(code_id, _)| *code_id == id)
        };
        if !valid {
            return Err(ApiError::invalid("Bad request"));
        }

        self.codes.lock().remove(temp_code);
        self.records.remove(&Self::record_key(id))?;
        Ok(json!({
            "passcode": info.get("passcode").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Build the recovery worker's RPC frame
pub fn build_frame(state: Arc<RecoveryState>, secret: String) -> Arc<RpcFrame> {
    let mut frame = RpcFrame::new(secret)
        .public_path("/")
        .public_path("/ping")
        .public_prefix("/recovery_svc");

    frame = frame.handle("ping", |_caller, _body| async { Ok(json!("Pong")) });
    frame = frame.handle("", |_caller, _body| async {
        Ok(Value::String(LANDING_PAGE.to_owned()))
    });

    {
        let state = Arc::clone(&state);
        frame = frame.handle("recovery_svc/register", move |_caller, body| {
            let state = Arc::clone(&state);
            async move { state.register(&body, chrono::Utc::now().timestamp()) }
        });
    }
    {
        let state = Arc::clone(&state);
        frame = frame.handle("recovery_svc/recover", move |_caller, body| {
            let state = Arc::clone(&state);
            async move { state.recover(&body, chrono::Utc::now().timestamp()) }
        });
    }
    {
        let state = Arc::clone(&state);
        frame = frame.handle("recovery_svc/code", move |_caller, body| {
            let state = Arc::clone(&state);
            async move { state.code(&body, chrono::Utc::now().timestamp()) }
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

/// Run the recovery worker until asked to quit
pub async fn run(profile_dir: &Path, port: u16) -> AppResult<()> {
    let state = RecoveryState::new(profile_dir, None)?;
    let frame = build_frame(Arc::clone(&state), make_secret());

    let (listener, bound) = bind_localhost(port).await?;
    publish_worker(profile_dir, "recovery", bound, frame.secret())?;
    info!(port = bound, "recovery worker running");

    let serving = Arc::clone(&frame).serve(listener);
    tokio::select! {
        result = serving => result,
        () = state.shutdown.notified() => {
            unpublish_worker(profile_dir, "recovery");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::{CodeSender, RecoveryState};
    use crate::crypto::recovery::combine_recovery_codes;

    struct Recorder(Arc<Mutex<Vec<(String, String)>>>);

    impl CodeSender for Recorder {
        fn send_code(&self, contact: &str, temp_code: &str) {
            self.0.lock().push((contact.to_owned(), temp_code.to_owned()));
        }
    }

    fn temp_state(name: &str) -> (Arc<RecoveryState>, Arc<Mutex<Vec<(String, String)>>>, PathBuf) {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-recw-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let state = RecoveryState::new(&dir, Some(Box::new(Recorder(Arc::clone(&sent)))))
            .expect("state builds");
        (state, sent, dir)
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn register_validates_inputs() {
        let (state, _sent, dir) = temp_state("validate");
        // Bad passcode shape
        assert!(state
            .register(
                &json!({"passcode": "not-digits", "contacts": ["a@x.tld"]}),
                NOW
            )
            .is_err());
        // Bad contact
        assert!(state
            .register(
                &json!({"passcode": "1111-22-3456", "contacts": ["not an address"]}),
                NOW
            )
            .is_err());
        // No contacts at all
        assert!(state
            .register(&json!({"passcode": "1111-22-3456", "contacts": []}), NOW)
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn record_ids_are_strictly_monotonic() {
        let (state, _sent, dir) = temp_state("monotonic");
        let body = json!({"hint": "H", "passcode": "1111-22-3456", "contacts": ["a@x.tld"]});
        let a = state.register(&body, NOW).expect("register succeeds");
        let b = state.register(&body, NOW).expect("register succeeds");
        assert!(b["id"].as_i64() > a["id"].as_i64());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn full_recovery_flow() {
        let (state, sent, dir) = temp_state("flow");
        let registered = state
            .register(
                &json!({"hint": "H", "passcode": "1111-22-3456", "contacts": ["a@x.tld"]}),
                NOW,
            )
            .expect("register succeeds");
        let id = registered["id"].as_i64().expect("id present");
        let reset_code = registered["reset_code"].as_str().expect("code present");

        // Unknown id
        assert!(state
            .recover(&json!({"id": 12345, "reset_code": reset_code}), NOW)
            .is_err());
        // Wrong reset code
        assert!(state
            .recover(&json!({"id": id, "reset_code": "9999-99-9999"}), NOW)
            .is_err());

        // Correct recover sends a temp code to a masked contact
        let recovered = state
            .recover(&json!({"id": id, "reset_code": reset_code}), NOW)
            .expect("recover succeeds");
        assert_eq!(recovered["sent_to"][0], "a*@*.tld");
        let (contact, temp_code) = sent.lock()[0].clone();
        assert_eq!(contact, "a@x.tld");

        // Wrong temp code is rejected; the right one releases passcode_b
        assert!(state
            .code(
                &json!({"id": id, "reset_code": reset_code, "temporary_code": "000000"}),
                NOW
            )
            .is_err());
        let released = state
            .code(
                &json!({"id": id, "reset_code": reset_code, "temporary_code": temp_code}),
                NOW,
            )
            .expect("code succeeds");
        assert_eq!(released["passcode"], "1111-22-3456");

        // Single use: the record is gone now
        assert!(state
            .recover(&json!({"id": id, "reset_code": reset_code}), NOW)
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn temp_codes_expire() {
        let (state, sent, dir) = temp_state("expiry");
        let registered = state
            .register(
                &json!({"hint": "H", "passcode": "1111-22-3456", "contacts": ["a@x.tld"]}),
                NOW,
            )
            .expect("register succeeds");
        let id = registered["id"].as_i64().expect("id present");
        let reset_code = registered["reset_code"].as_str().expect("code present");
        state
            .recover(&json!({"id": id, "reset_code": reset_code}), NOW)
            .expect("recover succeeds");
        let temp_code = sent.lock()[0].1.clone();

        let too_late = NOW + 21 * 60;
        assert!(state
            .code(
                &json!({"id": id, "reset_code": reset_code, "temporary_code": temp_code}),
                too_late
            )
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn client_side_combination_recovers_the_passcode() {
        // The released share combines with the locally held share
        let combined = combine_recovery_codes("1111-22-3456", "4444-11-5555")
            .expect("shapes match");
        assert_eq!(combined, "5555-33-8901");
    }
}
