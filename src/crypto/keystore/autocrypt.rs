//! Autocrypt peer database and state machine
//!
//! One row per peer address, stored in the encrypted SQLite container
//! `autocrypt.<namespace>.sqz`. Incoming messages drive the state machine:
//! a valid Autocrypt header refreshes the peer's key material, a message
//! without one erodes confidence (and eventually evicts the peer). The
//! stored `autocrypt_timestamp` never moves backward.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use super::{KeyStore, StoreResources};
use crate::crypto::keyinfo::get_keyinfo;
use crate::errors::{ApiError, AppResult};
use crate::storage::sqlite_zip::SqliteZip;

/// Largest accepted Autocrypt keydata after base64 decoding
const MAX_KEYDATA_BYTES: usize = 64 * 1024;

/// Peers decay out of the database 90 days after their last header
const EXPIRE_SECS: i64 = 90 * 24 * 3600;

/// A key this much older than the peer's latest mail discourages encryption
const DISCOURAGE_SECS: i64 = 35 * 24 * 3600;

/// One parsed `Autocrypt:` header
#[derive(Debug, Clone, Default)]
pub struct AutocryptHeader {
    pub addr: String,
    pub prefer_encrypt: Option<String>,
    /// Base64 keydata as it appeared in the header
    pub keydata: String,
    /// Non-underscore attributes we do not know; any makes the header invalid
    pub unknown_attrs: Vec<String>,
}

impl AutocryptHeader {
    /// Parse the `attr=value; attr=value` header syntax
    ///
    /// Whitespace inside `keydata` (folding) is stripped. Underscore-prefixed
    /// attributes are ignored per the Autocrypt spec; other unknown
    /// attributes are recorded and invalidate the header downstream.
    pub fn parse(raw: &str) -> Self {
        let mut header = Self::default();
        for part in raw.split(';') {
            let Some((attr, value)) = part.split_once('=') else {
                continue;
            };
            let attr = attr.trim();
            let value = value.trim();
            match attr {
                "addr" => header.addr = value.to_ascii_lowercase(),
                "prefer-encrypt" => header.prefer_encrypt = Some(value.to_owned()),
                "keydata" => {
                    header.keydata = value.split_whitespace().collect::<String>();
                }
                _ if attr.starts_with('_') => {}
                other => header.unknown_attrs.push(other.to_owned()),
            }
        }
        header
    }
}

/// The slice of a parsed message the state machine consumes
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub content_type: String,
    /// Message Date header as a Unix timestamp
    pub date_ts: i64,
    /// Sender address, lowercased
    pub from_addr: String,
    pub message_id: String,
    pub autocrypt: Vec<AutocryptHeader>,
}

/// What processing one message did to the peer's stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Peer state was created or updated
    Changed,
    /// Peer exists but this message did not move it
    Unchanged,
    /// Peer is not (or no longer) in the database
    Ignored,
}

/// Stored per-peer Autocrypt state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub addr: String,
    pub last_seen: i64,
    pub prefer_encrypt: Option<String>,
    pub autocrypt_timestamp: i64,
    pub autocrypt_count: i64,
    pub public_key_fingerprint: Option<String>,
    /// Base64 keydata
    pub public_key: Option<String>,
    /// Where the key came from (message-id)
    pub public_key_source: Option<String>,
    pub gossip_timestamp: Option<i64>,
    pub gossip_key_fingerprint: Option<String>,
    pub gossip_key: Option<String>,
    pub gossip_key_source: Option<String>,
}

impl PeerRecord {
    /// Encryption recommendation for composing to this peer
    ///
    /// `unavailable` without a key; `discourage` when the key is much older
    /// than the peer's latest mail; `encrypt` when the peer asked for
    /// mutual encryption; `available` otherwise.
    pub fn recommendation(&self) -> &'static str {
        if self.public_key.is_none() && self.gossip_key.is_none() {
            "unavailable"
        } else if self.autocrypt_timestamp <= self.last_seen - DISCOURAGE_SECS {
            "discourage"
        } else if self.prefer_encrypt.as_deref() == Some("mutual") {
            "encrypt"
        } else {
            "available"
        }
    }
}

pub struct AutocryptKeyStore {
    db: Arc<SqliteZip>,
}

impl AutocryptKeyStore {
    /// Open the peer database for a namespace (or an explicit path)
    pub fn open(which: Option<&str>, resources: &StoreResources) -> AppResult<Self> {
        let db = match which {
            Some(path) => SqliteZip::open(Path::new(path), &resources.encryption_keys)?,
            None => {
                let ext = if resources.encryption_keys.is_empty() {
                    "sq3"
                } else {
                    "sqz"
                };
                let path = resources
                    .data_dir
                    .join(format!("autocrypt.{}.{ext}", resources.file_namespace));
                SqliteZip::open(&path, &resources.encryption_keys)?
            }
        };
        let store = Self { db: Arc::new(db) };
        store.configure_db()?;
        Ok(store)
    }

    /// Container handle, for background saving and shutdown
    pub fn database(&self) -> Arc<SqliteZip> {
        Arc::clone(&self.db)
    }

    fn configure_db(&self) -> AppResult<()> {
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS autocrypt_peers(
                addr                   TEXT PRIMARY KEY,
                last_seen              INTEGER,
                prefer_encrypt         TEXT,
                autocrypt_timestamp    INTEGER,
                autocrypt_count        INTEGER,
                public_key_fingerprint TEXT,
                public_key             TEXT,
                public_key_source      TEXT,
                gossip_timestamp       INTEGER,
                gossip_key_fingerprint TEXT,
                gossip_key             TEXT,
                gossip_key_source      TEXT)",
            &[],
        )?;
        Ok(())
    }

    fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRecord> {
        Ok(PeerRecord {
            addr: row.get(0)?,
            last_seen: row.get(1)?,
            prefer_encrypt: row.get(2)?,
            autocrypt_timestamp: row.get(3)?,
            autocrypt_count: row.get(4)?,
            public_key_fingerprint: row.get(5)?,
            public_key: row.get(6)?,
            public_key_source: row.get(7)?,
            gossip_timestamp: row.get(8)?,
            gossip_key_fingerprint: row.get(9)?,
            gossip_key: row.get(10)?,
            gossip_key_source: row.get(11)?,
        })
    }

    const ALL_COLUMNS: &'static str = "addr, last_seen, prefer_encrypt, \
        autocrypt_timestamp, autocrypt_count, \
        public_key_fingerprint, public_key, public_key_source, \
        gossip_timestamp, gossip_key_fingerprint, gossip_key, gossip_key_source";

    /// Load one peer's stored state
    pub fn get_peer(&self, addr: &str) -> AppResult<Option<PeerRecord>> {
        let rows = self.db.query(
            &format!(
                "SELECT {} FROM autocrypt_peers WHERE addr = ?1",
                Self::ALL_COLUMNS
            ),
            &[&addr.to_ascii_lowercase()],
            Self::row_to_peer,
        )?;
        Ok(rows.into_iter().next())
    }

    /// Drive the state machine with one incoming message
    ///
    /// `now` is the wall clock; the effective date is `min(now, Date:)` so
    /// forged future dates cannot pin a stale key.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when header keydata exceeds 64 KiB (before any
    /// state is touched). Other malformed headers are skipped silently.
    pub fn process_email(&self, msg: &IncomingMessage, now: i64) -> AppResult<ProcessOutcome> {
        // Read receipts and their kin say nothing about the sender's keys
        if msg.content_type.eq_ignore_ascii_case("multipart/report") {
            return Ok(ProcessOutcome::Unchanged);
        }

        let effective_date = now.min(msg.date_ts);
        let peer_addr = msg.from_addr.to_ascii_lowercase();
        let current = self.get_peer(&peer_addr)?;

        for header in &msg.autocrypt {
            if header.keydata.len() > (MAX_KEYDATA_BYTES / 3) * 4 + 4 {
                return Err(ApiError::invalid("Autocrypt keydata exceeds 64KiB"));
            }
            if !header.unknown_attrs.is_empty()
                || header.addr != peer_addr
                || header.keydata.is_empty()
            {
                continue;
            }
            let Ok(key_bytes) = B64.decode(&header.keydata) else {
                continue;
            };
            if key_bytes.len() > MAX_KEYDATA_BYTES {
                return Err(ApiError::invalid("Autocrypt keydata exceeds 64KiB"));
            }
            let Ok(info) = get_keyinfo(&key_bytes) else {
                continue;
            };

            if let Some(current) = &current {
                // Timestamps only move forward
                if effective_date <= current.autocrypt_timestamp {
                    return Ok(ProcessOutcome::Unchanged);
                }
                self.db.execute(
                    "UPDATE autocrypt_peers
                        SET autocrypt_count = autocrypt_count + 1,
                            autocrypt_timestamp = ?1,
                            last_seen = ?2,
                            public_key_fingerprint = ?3,
                            public_key = ?4,
                            public_key_source = ?5,
                            prefer_encrypt = ?6
                      WHERE addr = ?7",
                    &[
                        &effective_date,
                        &effective_date,
                        &info.fingerprint,
                        &header.keydata,
                        &msg.message_id,
                        &header.prefer_encrypt,
                        &peer_addr,
                    ],
                )?;
            } else {
                self.db.execute(
                    "INSERT INTO autocrypt_peers(
                        addr, prefer_encrypt,
                        autocrypt_timestamp, autocrypt_count, last_seen,
                        public_key_fingerprint, public_key, public_key_source)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)",
                    &[
                        &peer_addr,
                        &header.prefer_encrypt,
                        &effective_date,
                        &effective_date,
                        &info.fingerprint,
                        &header.keydata,
                        &msg.message_id,
                    ],
                )?;
            }
            return Ok(ProcessOutcome::Changed);
        }

        // No usable Autocrypt header on this message
        let Some(current) = current else {
            return Ok(ProcessOutcome::Ignored);
        };

        // Headerless mail has outnumbered Autocrypt mail and the last
        // header is ancient: forget the peer entirely.
        if current.autocrypt_count < 1 && current.autocrypt_timestamp < now - EXPIRE_SECS {
            self.db.execute(
                "DELETE FROM autocrypt_peers WHERE addr = ?1",
                &[&peer_addr],
            )?;
            return Ok(ProcessOutcome::Ignored);
        }

        if effective_date > current.last_seen {
            self.db.execute(
                "UPDATE autocrypt_peers
                    SET autocrypt_count = autocrypt_count - 1,
                        last_seen = ?1
                  WHERE addr = ?2",
                &[&effective_date, &peer_addr],
            )?;
            return Ok(ProcessOutcome::Changed);
        }

        Ok(ProcessOutcome::Unchanged)
    }

    /// Query peers with the compact search syntax
    ///
    /// `addr` matches one peer; `addr=mutual` additionally requires mutual
    /// preference with a current key; `addr>N` requires the header count to
    /// exceed N.
    fn select_peers(&self, search_terms: &str) -> AppResult<Vec<PeerRecord>> {
        let mut terms = search_terms.to_owned();
        let mut min_count: Option<i64> = None;
        if let Some((addr, count)) = terms.split_once('>') {
            min_count = count.trim().parse().ok();
            terms = addr.to_owned();
        }
        let mutual = if let Some(addr) = terms.strip_suffix("=mutual") {
            terms = addr.to_owned();
            true
        } else {
            false
        };

        let mut sql = format!(
            "SELECT {} FROM autocrypt_peers WHERE addr = ?1",
            Self::ALL_COLUMNS
        );
        if mutual {
            sql.push_str(
                " AND prefer_encrypt = 'mutual' AND autocrypt_timestamp = last_seen",
            );
        }
        if let Some(min) = min_count {
            sql.push_str(&format!(" AND autocrypt_count > {min}"));
        }
        self.db
            .query(&sql, &[&terms.to_ascii_lowercase()], Self::row_to_peer)
    }
}

impl KeyStore for AutocryptKeyStore {
    fn name(&self) -> &str {
        "autocrypt"
    }

    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        for column in ["public_key_fingerprint", "gossip_key_fingerprint"] {
            let rows = self.db.query(
                &format!(
                    "SELECT public_key FROM autocrypt_peers WHERE {column} = ?1"
                ),
                &[&fingerprint.to_ascii_uppercase()],
                |row| row.get::<_, Option<String>>(0),
            )?;
            if let Some(Some(keydata)) = rows.into_iter().next() {
                return B64
                    .decode(&keydata)
                    .map_err(|e| ApiError::Integrity(format!("bad stored keydata: {e}")));
            }
        }
        Err(ApiError::NotFound(format!("autocrypt: {fingerprint}")))
    }

    fn find_certs(&self, search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        let mut certs = Vec::new();
        for peer in self.select_peers(search_terms)? {
            for keydata in [peer.public_key.as_ref(), peer.gossip_key.as_ref()]
                .into_iter()
                .flatten()
            {
                if let Ok(bytes) = B64.decode(keydata) {
                    certs.push(bytes);
                }
            }
        }
        Ok(certs)
    }
}
