//! IMAP client layer
//!
//! - [`parser`]: shift-reduce tokenizer for IMAP server responses
//! - [`session`]: connection broker, command sequencer, mailbox
//!   enumerator and incremental metadata fetcher
//!
//! This module also converts fetched header batches into canonical
//! metadata records with `imap` pointers, which is what the account sync
//! path feeds into the index.

pub mod parser;
pub mod session;

use std::collections::BTreeSet;

use tracing::warn;

use crate::errors::AppResult;
use crate::storage::metadata::{MailboxPointer, Metadata};
use session::{FetchedMetadata, ImapProtocol, ImapSession, ImapTimeouts, with_retries};

/// Mailbox names we avoid downloading by default
pub const BLACKLISTED_MAILBOXES: [&str; 6] = [
    "drafts",
    "chats",
    "[gmail]/all mail",
    "[gmail]/important",
    "[gmail]/starred",
    "openpgp_keys",
];

/// True for mailboxes the incremental fetcher skips by default
pub fn is_blacklisted(mailbox: &str) -> bool {
    let lowered = mailbox.to_lowercase();
    BLACKLISTED_MAILBOXES.iter().any(|b| *b == lowered)
}

/// Convert one fetched message into a canonical metadata record
///
/// The raw headers carry everything the record needs except size and
/// flags, which the fetch response supplies directly. A `\Seen` flag
/// becomes the `status:o` keyword the default filter script looks at.
pub fn metadata_from_fetch(
    container: &str,
    uid_validity: Option<u32>,
    fetched: &FetchedMetadata,
) -> AppResult<Metadata> {
    let pointer = MailboxPointer {
        storage: "imap".to_owned(),
        container: container.to_owned(),
        offset: match uid_validity {
            Some(validity) => format!("{validity}:{}", fetched.seq),
            None => fetched.seq.to_string(),
        },
    };
    let mut meta = crate::storage::mailbox::parse_message(&fetched.raw_headers, pointer)?;
    meta.size = fetched.size;

    let mut tags = BTreeSet::new();
    if fetched.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen")) {
        tags.insert("status:o".to_owned());
    }
    if fetched.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Flagged")) {
        tags.insert("status:f".to_owned());
    }
    meta.tags = tags;
    Ok(meta)
}

/// Fetch metadata records for every non-blacklisted mailbox of an account
///
/// Connects (with the bounded transient-retry policy), enumerates
/// selectable mailboxes, and turns each header batch into metadata
/// records. Mailboxes that fail to fetch are skipped with a warning; the
/// caller gets everything that worked.
pub async fn sync_account_metadata(
    host_port: &str,
    protocol: ImapProtocol,
    username: &str,
    password: &str,
    timeouts: ImapTimeouts,
) -> AppResult<Vec<Metadata>> {
    let mut session = with_retries(|| async {
        let mut session = ImapSession::connect(host_port, protocol, timeouts).await?;
        session.login(username, password).await?;
        Ok(session)
    })
    .await?;

    let container = session.resource_id();
    let mut records = Vec::new();
    let mailboxes = session.mailboxes(1000).await?;
    for mailbox in mailboxes {
        if is_blacklisted(&mailbox.name) {
            continue;
        }
        let ids = match session.uids(&mailbox.name).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(mailbox = mailbox.name, error = %err, "mailbox listing failed");
                continue;
            }
        };
        let uid_validity = session.selected.as_ref().and_then(|s| s.uid_validity);
        let fetched = match session.fetch_metadata(&mailbox.name, &ids).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(mailbox = mailbox.name, error = %err, "metadata fetch failed");
                continue;
            }
        };
        let mailbox_container = format!("{container}/{}", mailbox.name);
        for item in &fetched {
            match metadata_from_fetch(&mailbox_container, uid_validity, item) {
                Ok(meta) => records.push(meta),
                Err(err) => warn!(seq = item.seq, error = %err, "unparsable message headers"),
            }
        }
    }
    session.shutdown().await;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::session::FetchedMetadata;
    use super::{is_blacklisted, metadata_from_fetch};

    #[test]
    fn blacklist_matches_case_insensitively() {
        assert!(is_blacklisted("Drafts"));
        assert!(is_blacklisted("[Gmail]/All Mail"));
        assert!(!is_blacklisted("INBOX"));
    }

    #[test]
    fn fetched_headers_become_metadata_with_imap_pointers() {
        let fetched = FetchedMetadata {
            seq: 7,
            size: 420,
            flags: vec!["\\Seen".to_owned()],
            raw_headers: b"Message-Id: <x@y>\r\nSubject: Hi there\r\n\
                           From: Bjarni <bre@example.org>\r\n\
                           Date: Wed, 1 Sep 2021 00:03:01 GMT\r\n\r\n"
                .to_vec(),
        };
        let meta = metadata_from_fetch("imap://bre%40example.org@mail.example.org/INBOX", Some(9999), &fetched)
            .expect("conversion succeeds");
        assert_eq!(meta.size, 420);
        assert_eq!(meta.subject, "Hi there");
        assert_eq!(meta.pointers[0].storage, "imap");
        assert_eq!(meta.pointers[0].offset, "9999:7");
        assert!(meta.tags.contains("status:o"), "Seen flag maps to status:o");
    }
}
