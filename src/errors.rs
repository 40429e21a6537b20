//! Application error model with RPC wire mapping
//!
//! Defines a single typed error hierarchy using `thiserror` and maps each
//! variant to the structured JSON form carried over the RPC surface
//! (`{exception, exc_args, exc_data}`). Clients can reconstruct the typed
//! error from that JSON, so a worker boundary never loses the error kind.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// A single field the caller is asked to collect and retry with
///
/// Carried by [`ApiError::NeedInfo`]. The `datatype` is a UI hint
/// (`text`, `password`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPrompt {
    /// Human-readable label shown next to the input
    pub label: String,
    /// Field name expected in the retried request
    pub field: String,
    /// Input widget hint (`text`, `password`, `number`, ...)
    pub datatype: String,
}

impl FieldPrompt {
    /// Text prompt with the default `text` datatype
    pub fn text(label: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            field: field.into(),
            datatype: "text".to_owned(),
        }
    }

    /// Password prompt (UIs should mask input)
    pub fn password(label: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            field: field.into(),
            datatype: "password".to_owned(),
        }
    }
}

/// Application error type
///
/// Covers every error kind the worker backend reports. Leaf components
/// (key stores, IMAP, storage) raise these directly; the RPC dispatcher
/// converts them to the wire form with [`ApiError::to_wire`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// Capability or authentication failure; `kind` narrows the reason
    /// (e.g. `need-passphrase`, `bad-secret`, `no-access`)
    #[error("permission denied: {message}")]
    Denied { kind: String, message: String },
    /// More input is required; not a failure, the caller retries with the
    /// requested fields populated
    #[error("need more information")]
    NeedInfo {
        message: String,
        need: Vec<FieldPrompt>,
    },
    /// Resource does not exist (mailbox, record, key, worker)
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation deadline or socket timeout expired
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Network-level failure (connect, read, write)
    #[error("network error: {0}")]
    Network(String),
    /// TLS negotiation or certificate failure; never silently downgraded
    #[error("TLS error: {0}")]
    Tls(String),
    /// The remote peer violated its protocol (IMAP, SMTP, recovery)
    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),
    /// Decryption or digest mismatch; fatal for the value, never for
    /// sibling values
    #[error("integrity failure: {0}")]
    Integrity(String),
    /// Filter script compile or runtime failure
    #[error("filter script error: {0}")]
    FilterScript(String),
    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Convenience constructor for `InvalidArgument`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Convenience constructor for `Internal`
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Denial that asks the UI to pop the unlock dialog
    pub fn need_passphrase() -> Self {
        Self::Denied {
            kind: "need-passphrase".to_owned(),
            message: "Please unlock the app first".to_owned(),
        }
    }

    /// Denial for a missing or wrong RPC secret
    pub fn bad_secret() -> Self {
        Self::Denied {
            kind: "bad-secret".to_owned(),
            message: "Bad secret".to_owned(),
        }
    }

    /// Ask the caller to collect credentials for a resource and retry
    ///
    /// Used by the IMAP layer when a server reports `AUTHENTICATIONFAILED`:
    /// the UI re-prompts and the operation is retried with the fields set.
    pub fn please_unlock(resource: &str, need_username: bool, need_password: bool) -> Self {
        let mut need = Vec::new();
        if need_username {
            need.push(FieldPrompt::text("Username", "username"));
        }
        if need_password {
            need.push(FieldPrompt::password("Password", "password"));
        }
        Self::NeedInfo {
            message: format!("Credentials required for {resource}"),
            need,
        }
    }

    /// Stable kind tag used on the wire and in HTTP error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "permission-denied",
            Self::NeedInfo { .. } => "need-info",
            Self::NotFound(_) => "not-found",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Tls(_) => "tls",
            Self::RemoteProtocol(_) => "remote-protocol",
            Self::Integrity(_) => "integrity",
            Self::FilterScript(_) => "filter-script",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status this error maps to at the RPC boundary
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Denied { .. } => 403,
            Self::NeedInfo { .. } => 200,
            Self::NotFound(_) => 404,
            Self::InvalidArgument(_) | Self::FilterScript(_) => 400,
            Self::Timeout(_) => 504,
            Self::Network(_) | Self::Tls(_) | Self::RemoteProtocol(_) => 502,
            Self::Integrity(_) | Self::Internal(_) => 500,
        }
    }

    /// Serialize to the structured JSON wire form
    ///
    /// The shape is `{exception, exc_args, exc_data}` where `exception` is a
    /// stable type name, `exc_args` the human-readable arguments and
    /// `exc_data` variant-specific structure (e.g. the `need` prompt list).
    pub fn to_wire(&self) -> Value {
        let (exception, args, data) = match self {
            Self::Denied { kind, message } => (
                "AccessDenied",
                vec![message.clone()],
                json!({ "kind": kind }),
            ),
            Self::NeedInfo { message, need } => {
                ("NeedInfo", vec![message.clone()], json!({ "need": need }))
            }
            Self::NotFound(m) => ("NotFound", vec![m.clone()], json!({})),
            Self::InvalidArgument(m) => ("InvalidArgument", vec![m.clone()], json!({})),
            Self::Timeout(m) => ("Timeout", vec![m.clone()], json!({})),
            Self::Network(m) => ("NetworkError", vec![m.clone()], json!({})),
            Self::Tls(m) => ("TlsError", vec![m.clone()], json!({})),
            Self::RemoteProtocol(m) => ("RemoteProtocolError", vec![m.clone()], json!({})),
            Self::Integrity(m) => ("IntegrityError", vec![m.clone()], json!({})),
            Self::FilterScript(m) => ("FilterError", vec![m.clone()], json!({})),
            Self::Internal(m) => ("InternalError", vec![m.clone()], json!({})),
        };
        json!({
            "exception": exception,
            "exc_args": args,
            "exc_data": data,
        })
    }

    /// Reconstruct a typed error from its wire form
    ///
    /// Unknown exception names map to `Internal` so a newer worker never
    /// crashes an older client.
    pub fn from_wire(value: &Value) -> Self {
        let exception = value
            .get("exception")
            .and_then(Value::as_str)
            .unwrap_or("InternalError");
        let message = value
            .get("exc_args")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_owned();
        let data = value.get("exc_data").cloned().unwrap_or_else(|| json!({}));

        match exception {
            "AccessDenied" => Self::Denied {
                kind: data
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("denied")
                    .to_owned(),
                message,
            },
            "NeedInfo" => Self::NeedInfo {
                message,
                need: data
                    .get("need")
                    .cloned()
                    .and_then(|n| serde_json::from_value(n).ok())
                    .unwrap_or_default(),
            },
            "NotFound" => Self::NotFound(message),
            "InvalidArgument" => Self::InvalidArgument(message),
            "Timeout" => Self::Timeout(message),
            "NetworkError" => Self::Network(message),
            "TlsError" => Self::Tls(message),
            "RemoteProtocolError" => Self::RemoteProtocol(message),
            "IntegrityError" => Self::Integrity(message),
            "FilterError" => Self::FilterScript(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Denied {
                kind: "filesystem".to_owned(),
                message: err.to_string(),
            },
            _ => Self::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failure: {err}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::{ApiError, FieldPrompt};

    #[test]
    fn wire_round_trip_preserves_need_info_prompts() {
        let err = ApiError::NeedInfo {
            message: "Need more info!".to_owned(),
            need: vec![
                FieldPrompt::text("Username", "username"),
                FieldPrompt::password("Password", "password"),
            ],
        };
        let wire = err.to_wire();
        let back = ApiError::from_wire(&wire);
        match back {
            ApiError::NeedInfo { need, .. } => {
                assert_eq!(need.len(), 2);
                assert_eq!(need[0].label, "Username");
                assert_eq!(need[0].datatype, "text");
                assert_eq!(need[1].datatype, "password");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn wire_round_trip_preserves_denial_kind() {
        let wire = ApiError::need_passphrase().to_wire();
        assert_eq!(wire["exception"], "AccessDenied");
        assert_eq!(wire["exc_data"]["kind"], "need-passphrase");
        match ApiError::from_wire(&wire) {
            ApiError::Denied { kind, .. } => assert_eq!(kind, "need-passphrase"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_exception_names_map_to_internal() {
        let wire = serde_json::json!({
            "exception": "SomethingNew",
            "exc_args": ["boom"],
            "exc_data": {},
        });
        assert!(matches!(ApiError::from_wire(&wire), ApiError::Internal(_)));
    }

    #[test]
    fn need_info_is_not_an_http_failure() {
        let err = ApiError::NeedInfo {
            message: "more".to_owned(),
            need: vec![],
        };
        assert_eq!(err.http_status(), 200);
        assert_eq!(err.kind(), "need-info");
    }
}
