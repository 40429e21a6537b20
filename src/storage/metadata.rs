//! Canonical parsed-message metadata and its store
//!
//! Every ingested message becomes one [`Metadata`] record keyed by a
//! content-addressed hash of its normalized `Message-Id` (base64url SHA-1,
//! unpadded). Re-indexing the same message is idempotent: tag sets union,
//! pointer lists extend (deduplicated), newest scalar fields win.
//!
//! The store keeps records in the append-only encrypted log and maintains
//! an in-memory keyword index for search and counting.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::records::RecordStore;
use crate::errors::{ApiError, AppResult};

/// Hash a `Message-Id` into the store key
///
/// Normalization: trim surrounding whitespace, take the substring between
/// the first `<` and its matching `>` if present, wrap bare IDs in angle
/// brackets. The key is base64url SHA-1 without padding.
pub fn msgid_hash(message_id: &str) -> String {
    let trimmed = message_id.trim();
    let inner = match (trimmed.find('<'), trimmed.find('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    let normalized = format!("<{inner}>");
    URL_SAFE_NO_PAD.encode(Sha1::digest(normalized.as_bytes()))
}

/// Where an on-disk (or remote) copy of a message lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxPointer {
    /// Storage-format tag: `md`, `mbox`, `wervd`, `mailzip`, `imap`
    pub storage: String,
    /// Container path (directory, file or imap URL)
    pub container: String,
    /// Intra-container position: file name, byte offset or UID
    pub offset: String,
}

/// Canonical per-message metadata record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Original Message-Id header (normalized form is hashed for the key)
    pub message_id: String,
    /// Thread root message-id hash (from References/In-Reply-To)
    pub thread_id: String,
    /// Date header as Unix timestamp
    pub timestamp: i64,
    /// Message size in bytes
    pub size: u64,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// Short body excerpt for result lists
    pub snippet: String,
    /// Keyword tokens; tags carry the `in:` prefix
    pub tags: BTreeSet<String>,
    /// Every known on-disk copy of this message
    pub pointers: Vec<MailboxPointer>,
}

impl Metadata {
    /// The store key for this record
    pub fn key(&self) -> String {
        msgid_hash(&self.message_id)
    }

    /// Search tokens derived from this record's headers and snippet
    fn index_tokens(&self) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        for source in [&self.subject, &self.from, &self.snippet] {
            for word in source
                .split(|c: char| !c.is_alphanumeric() && c != '@' && c != '.' && c != '-')
            {
                let word = word.trim_matches('.').to_lowercase();
                if word.len() > 1 {
                    tokens.insert(word);
                }
            }
        }
        for addr in self.to.iter().chain(self.cc.iter()) {
            let addr = addr.trim().to_lowercase();
            if !addr.is_empty() {
                tokens.insert(addr);
            }
        }
        tokens.extend(self.tags.iter().cloned());
        tokens
    }

    /// Merge a re-indexed record into this one
    ///
    /// Tags union, pointers extend (deduplicated by the full pointer
    /// triple), scalar fields take the newer value.
    fn merge_from(&mut self, newer: Metadata) {
        let Metadata {
            message_id,
            thread_id,
            timestamp,
            size,
            from,
            to,
            cc,
            subject,
            snippet,
            tags,
            pointers,
        } = newer;
        self.message_id = message_id;
        self.thread_id = thread_id;
        self.timestamp = timestamp;
        self.size = size;
        self.from = from;
        self.to = to;
        self.cc = cc;
        self.subject = subject;
        self.snippet = snippet;
        self.tags.extend(tags);
        for pointer in pointers {
            if !self.pointers.contains(&pointer) {
                self.pointers.push(pointer);
            }
        }
    }
}

/// Metadata store: record log plus in-memory keyword index
pub struct MetadataStore {
    records: RecordStore,
    /// token -> keys of records containing it
    keywords: HashMap<String, BTreeSet<String>>,
}

impl MetadataStore {
    /// Open the store under `<dir>/<namespace>.log` and build the index
    pub fn open(dir: &Path, namespace: &str, keys: Vec<[u8; 32]>) -> AppResult<Self> {
        let records = RecordStore::open(dir, namespace, keys)?;
        let mut store = Self {
            records,
            keywords: HashMap::new(),
        };
        for key in store.records.keys() {
            if let Some(meta) = store.load(&key)? {
                store.index_record(&key, &meta);
            }
        }
        debug!(records = store.records.len(), "metadata store ready");
        Ok(store)
    }

    fn load(&self, key: &str) -> AppResult<Option<Metadata>> {
        match self.records.get(key, None)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn index_record(&mut self, key: &str, meta: &Metadata) {
        for token in meta.index_tokens() {
            self.keywords
                .entry(token)
                .or_default()
                .insert(key.to_owned());
        }
    }

    /// Number of indexed messages
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add (or merge) a record, returning its key
    pub fn add(&mut self, meta: Metadata) -> AppResult<String> {
        if meta.message_id.trim().is_empty() {
            return Err(ApiError::invalid("metadata without a message-id"));
        }
        let key = meta.key();
        let merged = match self.load(&key)? {
            Some(mut existing) => {
                existing.merge_from(meta);
                existing
            }
            None => meta,
        };
        self.records
            .set(&key, &serde_json::to_value(&merged)?, None)?;
        self.index_record(&key, &merged);
        Ok(key)
    }

    /// Fetch one record by key
    pub fn get(&self, key: &str) -> AppResult<Option<Metadata>> {
        self.load(key)
    }

    /// Replace a record's tag set (after filter evaluation)
    pub fn set_tags(&mut self, key: &str, tags: BTreeSet<String>) -> AppResult<()> {
        let mut meta = self
            .load(key)?
            .ok_or_else(|| ApiError::NotFound(format!("no metadata for {key}")))?;
        meta.tags = tags;
        self.records.set(key, &serde_json::to_value(&meta)?, None)?;
        self.index_record(key, &meta);
        Ok(())
    }

    /// Keys matching a space-separated term string
    ///
    /// Terms AND together. `in:tag` terms match the tag set, bare words
    /// match the keyword index, `*` (or an empty string) matches all.
    /// When `allowed_tags` is non-empty, `in:` terms outside it match
    /// nothing (tag-restricted contexts).
    pub fn search_keys(&self, terms: &str, allowed_tags: &[String]) -> BTreeSet<String> {
        let mut result: Option<BTreeSet<String>> = None;
        let mut all_terms = terms.split_whitespace().peekable();
        if all_terms.peek().is_none() {
            return self.records.keys().into_iter().collect();
        }
        for term in all_terms {
            let term = term.to_lowercase();
            let matches: BTreeSet<String> = if term == "*" {
                self.records.keys().into_iter().collect()
            } else {
                if let Some(tag) = term.strip_prefix("in:") {
                    if !allowed_tags.is_empty()
                        && !allowed_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
                    {
                        return BTreeSet::new();
                    }
                }
                self.keywords.get(&term).cloned().unwrap_or_default()
            };
            result = Some(match result {
                Some(acc) => acc.intersection(&matches).cloned().collect(),
                None => matches,
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        result.unwrap_or_default()
    }

    /// Full records for a search, newest first
    pub fn search(
        &self,
        terms: &str,
        allowed_tags: &[String],
        limit: usize,
        skip: usize,
    ) -> AppResult<Vec<Metadata>> {
        let mut found = Vec::new();
        for key in self.search_keys(terms, allowed_tags) {
            if let Some(meta) = self.load(&key)? {
                found.push(meta);
            }
        }
        found.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }

    /// Records whose pointers reference a mailbox container, newest first
    pub fn in_mailbox(
        &self,
        container: &str,
        limit: usize,
        skip: usize,
    ) -> AppResult<Vec<Metadata>> {
        let mut found = Vec::new();
        for key in self.records.keys() {
            if let Some(meta) = self.load(&key)? {
                if meta.pointers.iter().any(|p| p.container == container) {
                    found.push(meta);
                }
            }
        }
        found.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }

    /// Counts for a list of term strings; `*` counts everything
    pub fn counts(&self, terms_list: &[String], allowed_tags: &[String]) -> BTreeMap<String, usize> {
        terms_list
            .iter()
            .map(|terms| {
                (
                    terms.clone(),
                    self.search_keys(terms, allowed_tags).len(),
                )
            })
            .collect()
    }

    /// Drop shadowed log records
    pub fn compact(&self) -> AppResult<u64> {
        self.records.compact()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::{MailboxPointer, Metadata, MetadataStore, msgid_hash};

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-meta-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn sample(tag: &str, pointer_offset: &str) -> Metadata {
        Metadata {
            message_id: "<hello@example.org>".to_owned(),
            thread_id: String::new(),
            timestamp: 1_630_454_581,
            size: 420,
            from: "Bjarni <bre@example.org>".to_owned(),
            to: vec!["someone@example.org".to_owned()],
            cc: Vec::new(),
            subject: "Hello world".to_owned(),
            snippet: "this is great".to_owned(),
            tags: BTreeSet::from([format!("in:{tag}")]),
            pointers: vec![MailboxPointer {
                storage: "md".to_owned(),
                container: "/mail/test".to_owned(),
                offset: pointer_offset.to_owned(),
            }],
        }
    }

    #[test]
    fn msgid_normalization_is_idempotent() {
        let bare = msgid_hash("hello@example.org");
        assert_eq!(bare, msgid_hash("<hello@example.org>"));
        assert_eq!(bare, msgid_hash("  <hello@example.org>  "));
        assert_eq!(bare, msgid_hash("Id: <hello@example.org> (comment)"));
        assert_ne!(bare, msgid_hash("<other@example.org>"));
        assert!(!bare.contains('='));
    }

    #[test]
    fn reindexing_merges_instead_of_duplicating() {
        let dir = temp_dir("merge");
        let mut store = MetadataStore::open(&dir, "metadata", Vec::new()).expect("open succeeds");

        let k1 = store.add(sample("inbox", "cur/1")).expect("add succeeds");
        let k2 = store.add(sample("unread", "cur/1")).expect("add succeeds");
        let k3 = store.add(sample("inbox", "new/2")).expect("add succeeds");
        assert_eq!(k1, k2);
        assert_eq!(k1, k3);
        assert_eq!(store.len(), 1);

        let meta = store.get(&k1).expect("read succeeds").expect("record exists");
        assert!(meta.tags.contains("in:inbox"));
        assert!(meta.tags.contains("in:unread"));
        assert_eq!(meta.pointers.len(), 2, "pointer dedup by full triple");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn tag_union_is_commutative() {
        let dir_a = temp_dir("union-a");
        let dir_b = temp_dir("union-b");
        let mut a = MetadataStore::open(&dir_a, "metadata", Vec::new()).expect("open succeeds");
        let mut b = MetadataStore::open(&dir_b, "metadata", Vec::new()).expect("open succeeds");

        let key = a.add(sample("inbox", "cur/1")).expect("add succeeds");
        a.add(sample("unread", "cur/1")).expect("add succeeds");
        b.add(sample("unread", "cur/1")).expect("add succeeds");
        b.add(sample("inbox", "cur/1")).expect("add succeeds");

        let tags_a = a.get(&key).expect("read").expect("exists").tags;
        let tags_b = b.get(&key).expect("read").expect("exists").tags;
        assert_eq!(tags_a, tags_b);

        let _ = std::fs::remove_dir_all(dir_a);
        let _ = std::fs::remove_dir_all(dir_b);
    }

    #[test]
    fn search_and_counts() {
        let dir = temp_dir("search");
        let mut store = MetadataStore::open(&dir, "metadata", Vec::new()).expect("open succeeds");
        store.add(sample("inbox", "cur/1")).expect("add succeeds");

        let mut other = sample("spam", "cur/2");
        other.message_id = "<spam@example.org>".to_owned();
        other.from = "Spammer <junk@spam.example>".to_owned();
        other.subject = "Buy things".to_owned();
        store.add(other).expect("add succeeds");

        assert_eq!(store.search_keys("bjarni", &[]).len(), 1);
        assert_eq!(store.search_keys("in:inbox", &[]).len(), 1);
        assert_eq!(store.search_keys("bjarni in:spam", &[]).len(), 0);
        assert_eq!(store.search_keys("*", &[]).len(), 2);

        let counts = store.counts(&["*".to_owned(), "in:spam".to_owned()], &[]);
        assert_eq!(counts["*"], 2);
        assert_eq!(counts["in:spam"], 1);

        // Tag-restricted context hides unlisted tags
        let allowed = vec!["inbox".to_owned()];
        assert_eq!(store.search_keys("in:spam", &allowed).len(), 0);
        assert_eq!(store.search_keys("in:inbox", &allowed).len(), 1);

        let results = store.search("*", &[], 10, 0).expect("search succeeds");
        assert_eq!(results.len(), 2);

        let _ = std::fs::remove_dir_all(dir);
    }
}
