//! The composer plan engine
//!
//! Derives a send plan from a message being replied to (or nothing, for a
//! fresh draft) and the active context: which identity to send as, the
//! quoted body, the signature, a fresh message-id and a send-after
//! timestamp. Stateless; drafts and queues live elsewhere.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Serialize;

use crate::config::schema::{ContextInfo, IdentityInfo};
use crate::errors::{ApiError, AppResult};
use crate::storage::metadata::Metadata;

/// Default delay before a composed message actually leaves
const DEFAULT_POSTPONE_SECS: i64 = 2 * 60;

/// Features every plan starts with
const DEFAULT_FEATURES: [&str; 3] = ["postpone:2m", "inline-quote", "reflow"];

/// A derived plan for sending one message
#[derive(Debug, Clone, Serialize)]
pub struct SendPlan {
    /// Identity section the message sends as
    pub identity: String,
    /// The sending address
    pub from_address: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// `> `-quoted original text, when replying
    pub quoted_body: String,
    pub signature: Option<String>,
    /// Fresh random message-id for the outgoing message
    pub message_id: String,
    /// References header value linking the thread
    pub references: Option<String>,
    /// Unix timestamp before which the message must not leave
    pub send_after: i64,
    pub features: Vec<String>,
}

/// Generate a fresh random message-id
pub fn make_message_id() -> String {
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy);
    format!("<{}@nestmail>", URL_SAFE_NO_PAD.encode(entropy))
}

/// Prefix every line of the original text with `> `
fn quote_text(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.starts_with('>') {
                format!(">{line}")
            } else {
                format!("> {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip a display-name address down to the bare address
fn bare_address(addr: &str) -> String {
    match (addr.find('<'), addr.find('>')) {
        (Some(open), Some(close)) if open < close => addr[open + 1..close].to_owned(),
        _ => addr.trim().to_owned(),
    }
    .to_lowercase()
}

/// Choose the identity to send as
///
/// Prefers the identity whose address appears among the original
/// recipients, then the context default, then the first identity.
fn pick_identity<'a>(
    identities: &'a [IdentityInfo],
    context: &ContextInfo,
    original: Option<&Metadata>,
) -> AppResult<&'a IdentityInfo> {
    if let Some(original) = original {
        let recipients: Vec<String> = original
            .to
            .iter()
            .chain(original.cc.iter())
            .map(|a| bare_address(a))
            .collect();
        if let Some(matched) = identities
            .iter()
            .find(|id| recipients.contains(&id.address.to_lowercase()))
        {
            return Ok(matched);
        }
    }
    if let Some(default) = &context.default_identity {
        if let Some(matched) = identities
            .iter()
            .find(|id| &id.section == default || &id.address == default)
        {
            return Ok(matched);
        }
    }
    identities
        .first()
        .ok_or_else(|| ApiError::invalid("context has no identities"))
}

/// Reply subject: prefix `Re: ` unless already present
fn reply_subject(subject: &str) -> String {
    if subject.trim_start().to_ascii_lowercase().starts_with("re:") {
        subject.trim().to_owned()
    } else {
        format!("Re: {}", subject.trim())
    }
}

/// Derive a send plan
///
/// `original` and `original_text` are present when replying; `now` is the
/// wall clock the send-after delay counts from.
pub fn plan(
    context: &ContextInfo,
    identities: &[IdentityInfo],
    original: Option<&Metadata>,
    original_text: Option<&str>,
    now: i64,
) -> AppResult<SendPlan> {
    let identity = pick_identity(identities, context, original)?;

    let (to, cc, subject, references) = match original {
        Some(original) => {
            // Reply goes to the sender; other recipients drop to Cc,
            // excluding our own address
            let own = identity.address.to_lowercase();
            let to = vec![original.from.clone()];
            let cc: Vec<String> = original
                .to
                .iter()
                .chain(original.cc.iter())
                .filter(|a| bare_address(a) != own)
                .cloned()
                .collect();
            (
                to,
                cc,
                reply_subject(&original.subject),
                Some(original.message_id.clone()),
            )
        }
        None => (Vec::new(), Vec::new(), String::new(), None),
    };

    Ok(SendPlan {
        identity: identity.section.clone(),
        from_address: identity.address.clone(),
        to,
        cc,
        subject,
        quoted_body: original_text.map(quote_text).unwrap_or_default(),
        signature: identity.signature.clone(),
        message_id: make_message_id(),
        references,
        send_after: now + DEFAULT_POSTPONE_SECS,
        features: DEFAULT_FEATURES.iter().map(|f| (*f).to_owned()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::{make_message_id, plan, quote_text};
    use crate::config::schema::{ContextInfo, IdentityInfo};
    use crate::storage::metadata::Metadata;

    fn identity(section: &str, address: &str) -> IdentityInfo {
        IdentityInfo {
            section: section.to_owned(),
            name: section.to_owned(),
            address: address.to_owned(),
            signature: Some("-- \nBjarni".to_owned()),
        }
    }

    fn original() -> Metadata {
        Metadata {
            message_id: "<orig@example.org>".to_owned(),
            from: "Alice <alice@example.org>".to_owned(),
            to: vec!["Bjarni <bre@example.org>".to_owned()],
            cc: vec!["carol@example.org".to_owned()],
            subject: "Hello world".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn message_ids_are_unique_and_bracketed() {
        let a = make_message_id();
        let b = make_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.ends_with("@nestmail>"));
    }

    #[test]
    fn quoting_nests_properly() {
        assert_eq!(quote_text("hi\n> old"), "> hi\n>> old");
    }

    #[test]
    fn reply_plan_picks_the_addressed_identity() {
        let context = ContextInfo {
            section: "Context 0".to_owned(),
            default_identity: Some("Identity 2".to_owned()),
            ..Default::default()
        };
        let identities = vec![
            identity("Identity 1", "other@example.org"),
            identity("Identity 2", "fallback@example.org"),
            identity("Identity 3", "bre@example.org"),
        ];
        let now = 1_700_000_000;
        let plan = plan(
            &context,
            &identities,
            Some(&original()),
            Some("original text"),
            now,
        )
        .expect("plan derives");

        // Identity 3 was the addressed one, despite the default
        assert_eq!(plan.identity, "Identity 3");
        assert_eq!(plan.to, vec!["Alice <alice@example.org>"]);
        // Our own address is not Cc'd back
        assert_eq!(plan.cc, vec!["carol@example.org"]);
        assert_eq!(plan.subject, "Re: Hello world");
        assert_eq!(plan.quoted_body, "> original text");
        assert_eq!(plan.references.as_deref(), Some("<orig@example.org>"));
        assert_eq!(plan.send_after, now + 120);
        assert!(plan.features.iter().any(|f| f == "inline-quote"));
    }

    #[test]
    fn fresh_draft_uses_the_default_identity() {
        let context = ContextInfo {
            section: "Context 0".to_owned(),
            default_identity: Some("Identity 2".to_owned()),
            ..Default::default()
        };
        let identities = vec![
            identity("Identity 1", "other@example.org"),
            identity("Identity 2", "fallback@example.org"),
        ];
        let plan = plan(&context, &identities, None, None, 0).expect("plan derives");
        assert_eq!(plan.identity, "Identity 2");
        assert!(plan.to.is_empty());
        assert!(plan.quoted_body.is_empty());
    }

    #[test]
    fn re_prefix_is_not_duplicated() {
        let mut orig = original();
        orig.subject = "Re: Hello world".to_owned();
        let context = ContextInfo::default();
        let identities = vec![identity("Identity 1", "bre@example.org")];
        let plan =
            plan(&context, &identities, Some(&orig), None, 0).expect("plan derives");
        assert_eq!(plan.subject, "Re: Hello world");
    }

    #[test]
    fn contexts_without_identities_cannot_plan() {
        let context = ContextInfo::default();
        assert!(plan(&context, &[], None, None, 0).is_err());
    }
}
