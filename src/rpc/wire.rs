//! Wire shapes for the RPC surface
//!
//! Requests are JSON objects with a `req_type` selecting the operation and
//! an optional `req_id` the response echoes back. The CLI bridges its
//! commands as `cli:<command>` request types with an `args` array. The
//! server may push notification frames at any time; they carry a
//! `prototype` of `notification` and never a `req_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::{ApiError, AppResult};

/// Incoming request envelope, before operation-specific decoding
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub req_type: String,
    #[serde(default)]
    pub req_id: Value,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RequestEnvelope {
    /// Decode a newline-framed JSON request
    pub fn parse(line: &str) -> AppResult<Self> {
        serde_json::from_str(line)
            .map_err(|e| ApiError::invalid(format!("bad request frame: {e}")))
    }

    /// Normalize `cli:<command>` bridge requests into core operations
    ///
    /// `cli:count` becomes `counts` with its `args` as the terms list;
    /// other `cli:` types map to the operation of the same name.
    pub fn normalized(mut self) -> Self {
        if let Some(command) = self.req_type.strip_prefix("cli:") {
            let args: Vec<Value> = self
                .fields
                .remove("args")
                .and_then(|a| serde_json::from_value(a).ok())
                .unwrap_or_default();
            match command {
                "count" => {
                    let terms: Vec<Value> = if args.is_empty() {
                        vec![json!("*")]
                    } else {
                        args
                    };
                    self.req_type = "counts".to_owned();
                    self.fields.insert("terms_list".to_owned(), json!(terms));
                }
                "search" => {
                    self.req_type = "search".to_owned();
                    let terms = args
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" ");
                    self.fields.insert("terms".to_owned(), json!(terms));
                }
                other => {
                    self.req_type = other.to_owned();
                }
            }
        }
        self
    }

    /// Successful response frame echoing this request's `req_id`
    pub fn response(&self, mut body: Value) -> Value {
        if let Some(object) = body.as_object_mut() {
            object.insert("req_type".to_owned(), json!(self.req_type));
            object.insert("req_id".to_owned(), self.req_id.clone());
            return body;
        }
        json!({
            "req_type": self.req_type,
            "req_id": self.req_id,
            "result": body,
        })
    }

    /// Error response frame for this request
    pub fn error_response(&self, err: &ApiError) -> Value {
        json!({
            "req_type": self.req_type,
            "req_id": self.req_id,
            "error": err.to_wire(),
        })
    }

    /// Decode the operation-specific fields into a typed request
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| ApiError::invalid(format!("bad {} request: {e}", self.req_type)))
    }
}

fn default_limit() -> usize {
    50
}

/// Search the metadata index
#[derive(Debug, Clone, Deserialize)]
pub struct RequestSearch {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub terms: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

/// Count matches for each term string
#[derive(Debug, Clone, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub terms_list: Vec<String>,
}

/// Page through a mailbox's messages
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMailbox {
    #[serde(default)]
    pub context: String,
    pub mailbox: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

/// Load one message's metadata (and optionally text/raw data)
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEmail {
    /// Metadata store key
    pub metadata: String,
    #[serde(default)]
    pub text: bool,
    #[serde(default)]
    pub data: bool,
}

/// Index a local mailbox
#[derive(Debug, Clone, Deserialize)]
pub struct RequestAddToIndex {
    #[serde(default)]
    pub context: String,
    /// Path of the mailbox container
    pub search: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

/// Provide the passphrase
#[derive(Debug, Clone, Deserialize)]
pub struct RequestUnlock {
    pub passphrase: String,
}

/// Rotate the passphrase
#[derive(Debug, Clone, Deserialize)]
pub struct RequestChangePassphrase {
    pub old_passphrase: String,
    pub new_passphrase: String,
}

/// Server-pushed notification frame
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub prototype: &'static str,
    /// Unix timestamp of the event
    pub ts: i64,
    pub message: String,
    pub data: Value,
}

impl Notification {
    pub fn new(message: impl Into<String>, data: Value) -> Self {
        Self {
            prototype: "notification",
            ts: chrono::Utc::now().timestamp(),
            message: message.into(),
            data,
        }
    }

    /// The newline-terminated frame put on the socket
    pub fn to_frame(&self) -> String {
        let mut frame = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned());
        frame.push('\n');
        frame
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RequestCounts, RequestEnvelope, RequestSearch};

    #[test]
    fn cli_count_normalizes_to_counts() {
        let envelope = RequestEnvelope::parse(
            r#"{"req_type": "cli:count", "req_id": 1, "args": []}"#,
        )
        .expect("frame parses")
        .normalized();
        assert_eq!(envelope.req_type, "counts");
        let req: RequestCounts = envelope.decode().expect("decodes");
        assert_eq!(req.terms_list, vec!["*"]);

        let response = envelope.response(json!({"counts": {"*": 3}}));
        assert_eq!(response["req_id"], 1);
        assert_eq!(response["counts"]["*"], 3);
    }

    #[test]
    fn cli_search_joins_args_into_terms() {
        let envelope = RequestEnvelope::parse(
            r#"{"req_type": "cli:search", "req_id": "a", "args": ["in:inbox", "bjarni"]}"#,
        )
        .expect("frame parses")
        .normalized();
        let req: RequestSearch = envelope.decode().expect("decodes");
        assert_eq!(req.terms, "in:inbox bjarni");
        assert_eq!(req.limit, 50);
    }

    #[test]
    fn error_responses_carry_the_wire_error() {
        let envelope = RequestEnvelope::parse(r#"{"req_type": "search", "req_id": 7}"#)
            .expect("frame parses");
        let response = envelope.error_response(&crate::errors::ApiError::need_passphrase());
        assert_eq!(response["req_id"], 7);
        assert_eq!(response["error"]["exception"], "AccessDenied");
        assert_eq!(response["error"]["exc_data"]["kind"], "need-passphrase");
    }

    #[test]
    fn malformed_frames_are_invalid_argument() {
        assert!(RequestEnvelope::parse("{not json").is_err());
        assert!(RequestEnvelope::parse(r#"{"no_req_type": 1}"#).is_err());
    }
}
