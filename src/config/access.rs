//! Access grants, role strings and bearer tokens
//!
//! An access grant maps bearer tokens to role strings across contexts.
//! Roles are strings of single-character capability flags; `A` grants
//! everything. Tokens carry 80 bits of CSPRNG entropy, expire after seven
//! days, and are the sole means of RPC authorization.

use std::collections::BTreeMap;

use base64::Engine;
use rand::RngCore;

use super::store::{ACCESS_PREFIX, CONTEXT_PREFIX, ConfigStore, ConfigValue};
use crate::config::schema::ContextInfo;
use crate::errors::{ApiError, AppResult};

/// Capability letters
pub const GRANT_ALL: char = 'A'; // Everything
pub const GRANT_ACCESS: char = 'a'; // Add/remove access controls
pub const GRANT_FS: char = 'F'; // Local files, including mailboxes
pub const GRANT_NETWORK: char = 'N'; // Network resources; remote mailboxes
pub const GRANT_TAG_X: char = 'T'; // Edit/add/remove tags
pub const GRANT_TAG_RW: char = 't'; // Tag/untag operations
pub const GRANT_CONTACT_WX: char = 'P'; // Edit/add/remove contacts
pub const GRANT_CONTACT_R: char = 'p'; // View contacts
pub const GRANT_CALENDAR_WX: char = 'E'; // Edit/add/remove calendar events
pub const GRANT_CALENDAR_R: char = 'e'; // View calendar events
pub const GRANT_SEND: char = 'x'; // Send messages
pub const GRANT_COMPOSE: char = 'w'; // Compose messages
pub const GRANT_READ: char = 'r'; // Read messages

/// Named role presets offered by the admin surface
pub const GRANT_ROLES: [(&str, &str, &str); 4] = [
    ("owner", "A", "Unlimited access"),
    ("admin", "aPpEeTtrwx", "Context admin"),
    ("user", "PpEeTtrwx", "Normal user, can read/write e-mail and data"),
    ("guest", "rp", "Guest access, read-only"),
];

/// Tokens expire this many seconds after minting
pub const MAX_TOKEN_AGE: i64 = 7 * 24 * 3600;

/// What a grant yields for one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The raw role string
    pub role: String,
    /// Tag namespace of the context
    pub tag_namespace: Option<String>,
    /// Tags search may expose; empty means unrestricted
    pub allowed_tags: Vec<String>,
}

/// One access grant, loaded from an `Access N` section
#[derive(Debug, Clone)]
pub struct AccessInfo {
    /// Config section this grant lives in
    pub section: String,
    pub name: String,
    pub username: Option<String>,
    /// context section name -> role string
    pub roles: BTreeMap<String, String>,
    /// token -> mint timestamp
    pub tokens: BTreeMap<String, i64>,
}

impl AccessInfo {
    /// Parse the comma-joined `key:value` map syntax used on disk
    fn parse_map(raw: &str) -> BTreeMap<String, String> {
        raw.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                // Context names contain spaces and colons come last
                entry
                    .rsplit_once(':')
                    .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            })
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    fn encode_map<V: std::fmt::Display>(map: &BTreeMap<String, V>) -> String {
        map.iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Load a grant from its config section
    pub fn load(store: &ConfigStore, section: &str) -> AppResult<Self> {
        let name = store
            .get_text(section, "name")?
            .unwrap_or_else(|| section.to_owned());
        let roles = store
            .get_text(section, "roles")?
            .map(|raw| Self::parse_map(&raw))
            .unwrap_or_default();
        let tokens = store
            .get_text(section, "tokens")?
            .map(|raw| {
                Self::parse_map(&raw)
                    .into_iter()
                    .filter_map(|(t, ts)| ts.parse().ok().map(|ts| (t, ts)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            section: section.to_owned(),
            name,
            username: store.get_text(section, "username")?,
            roles,
            tokens,
        })
    }

    /// Write roles and tokens back to the config section
    pub fn save(&self, store: &mut ConfigStore) -> AppResult<()> {
        store.set(
            &self.section,
            "roles",
            ConfigValue::Text(Self::encode_map(&self.roles)),
        )?;
        store.set(
            &self.section,
            "tokens",
            ConfigValue::Text(Self::encode_map(&self.tokens)),
        )?;
        Ok(())
    }

    /// Drop tokens older than `max_age` seconds
    pub fn expire_tokens(&mut self, now: i64, max_age: i64) {
        let oldest = now - max_age;
        self.tokens.retain(|_, minted| *minted >= oldest);
    }

    /// Mint a fresh token: 80 bits of CSPRNG entropy, base32-encoded
    pub fn new_token(&mut self, now: i64) -> String {
        let mut entropy = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut entropy);
        let token = base32_encode(&entropy);
        self.tokens.insert(token.clone(), now);
        token
    }

    /// Newest unexpired token, minting a replacement past half-life
    pub fn fresh_token(&mut self, now: i64) -> (String, i64) {
        let newest = self
            .tokens
            .iter()
            .max_by_key(|(_, ts)| **ts)
            .map(|(t, ts)| (t.clone(), *ts));
        match newest {
            Some((token, minted)) if minted + MAX_TOKEN_AGE / 2 > now => (token, minted),
            _ => {
                let token = self.new_token(now);
                (token, now)
            }
        }
    }

    /// Capabilities this grant yields in a context, if any
    ///
    /// `None` when the grant names no role for the context, the context
    /// does not exist, or a required capability letter is missing (absent
    /// the `A` wildcard).
    pub fn grants(
        &self,
        store: &ConfigStore,
        context: &str,
        required: &str,
    ) -> AppResult<Option<Grant>> {
        let Some(role) = self.roles.get(context) else {
            return Ok(None);
        };
        if !store.section_names().iter().any(|s| s == context) {
            return Ok(None);
        }
        if !role.contains(GRANT_ALL) {
            for cap in required.chars() {
                if !role.contains(cap) {
                    return Ok(None);
                }
            }
        }
        let ctx = ContextInfo::load(store, context)?;
        let allowed_tags = if ctx.tag_required { ctx.tags } else { Vec::new() };
        Ok(Some(Grant {
            role: role.clone(),
            tag_namespace: ctx.tag_namespace,
            allowed_tags,
        }))
    }
}

/// RFC 4648 base32, no padding (tokens are URL- and shell-safe)
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for byte in data {
        buffer = (buffer << 8) | u64::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

impl ConfigStore {
    /// Every access grant, keyed by section name
    pub fn all_access(&self) -> AppResult<Vec<AccessInfo>> {
        let mut grants = Vec::new();
        for section in self.section_names() {
            if section.starts_with(ACCESS_PREFIX) {
                grants.push(AccessInfo::load(self, &section)?);
            }
        }
        Ok(grants)
    }

    /// Resolve a bearer token to its access grant
    ///
    /// Expired tokens are pruned on the way. The token -> section cache is
    /// dropped whenever the config saves.
    pub fn access_from_token(&mut self, token: &str) -> AppResult<AccessInfo> {
        let now = chrono::Utc::now().timestamp();
        if self.token_cache_ref().is_none() {
            let mut cache = std::collections::HashMap::new();
            for mut access in self.all_access()? {
                access.expire_tokens(now, MAX_TOKEN_AGE);
                access.save(self)?;
                for tok in access.tokens.keys() {
                    cache.insert(tok.clone(), access.section.clone());
                }
            }
            self.set_token_cache(cache);
        }
        let section = self
            .token_cache_ref()
            .and_then(|c| c.get(token).cloned())
            .ok_or_else(|| ApiError::Denied {
                kind: "no-access".to_owned(),
                message: "No access granted".to_owned(),
            })?;
        AccessInfo::load(self, &section)
    }

    /// Convenience: the built-in local-access grant with a fresh token
    pub fn local_access_token(&mut self) -> AppResult<String> {
        let now = chrono::Utc::now().timestamp();
        let section = format!("{ACCESS_PREFIX}0");
        let mut access = AccessInfo::load(self, &section)?;
        // Local access always covers every context
        for ctx in self.section_names() {
            if ctx.starts_with(CONTEXT_PREFIX) {
                access
                    .roles
                    .entry(ctx)
                    .or_insert_with(|| GRANT_ALL.to_string());
            }
        }
        let (token, _) = access.fresh_token(now);
        access.save(self)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{AccessInfo, MAX_TOKEN_AGE, base32_encode};
    use crate::config::store::{CONTEXT_ZERO, Config, ConfigValue};

    fn temp_profile(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-acl-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn base32_tokens_are_sixteen_chars() {
        assert_eq!(base32_encode(&[0; 10]).len(), 16);
        assert_eq!(base32_encode(b"\xffconsistent"), base32_encode(b"\xffconsistent"));
    }

    #[test]
    fn role_letters_gate_capabilities() {
        let dir = temp_profile("grants");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.set("Context 1", "name", ConfigValue::Text("Work".to_owned()))?;
                store.set(
                    "Access 1",
                    "name",
                    ConfigValue::Text("Test access".to_owned()),
                )?;
                store.set(
                    "Access 1",
                    "roles",
                    ConfigValue::Text("Context 1:A, Context 2:r".to_owned()),
                )
            })
            .expect("setup succeeds");

        config.read(|store| {
            let access = AccessInfo::load(store, "Access 1").expect("grant loads");
            // A grants everything
            assert!(access
                .grants(store, "Context 1", "rwTt")
                .expect("lookup succeeds")
                .is_some());
            // Unknown context: denial even with a role entry
            assert!(access
                .grants(store, "Context 2", "r")
                .expect("lookup succeeds")
                .is_none());
            // No role entry for Context 0 at all
            assert!(access
                .grants(store, CONTEXT_ZERO, "r")
                .expect("lookup succeeds")
                .is_none());
        });
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_letters_deny() {
        let dir = temp_profile("deny");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.set(
                    "Access 1",
                    "roles",
                    ConfigValue::Text(format!("{CONTEXT_ZERO}:rp")),
                )
            })
            .expect("setup succeeds");
        config.read(|store| {
            let access = AccessInfo::load(store, "Access 1").expect("grant loads");
            assert!(access
                .grants(store, CONTEXT_ZERO, "r")
                .expect("lookup succeeds")
                .is_some());
            for caps in ["w", "rw", "T", "rA"] {
                assert!(
                    access
                        .grants(store, CONTEXT_ZERO, caps)
                        .expect("lookup succeeds")
                        .is_none(),
                    "role rp must not grant {caps}"
                );
            }
        });
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn token_lifecycle() {
        let now = 1_700_000_000;
        let mut access = AccessInfo {
            section: "Access 1".to_owned(),
            name: "t".to_owned(),
            username: None,
            roles: Default::default(),
            tokens: Default::default(),
        };

        let tok = access.new_token(now);
        assert_eq!(access.tokens[&tok], now);

        // Fresh token reuses a young token, replaces an old one
        let (same, _) = access.fresh_token(now + 10);
        assert_eq!(same, tok);
        let (minted, ts) = access.fresh_token(now + MAX_TOKEN_AGE / 2 + 1);
        assert_ne!(minted, tok);
        assert_eq!(ts, now + MAX_TOKEN_AGE / 2 + 1);

        // Expiry prunes the stale token
        access.expire_tokens(now + MAX_TOKEN_AGE + 10, MAX_TOKEN_AGE);
        assert!(!access.tokens.contains_key(&tok));
        assert!(access.tokens.contains_key(&minted));
    }

    #[test]
    fn token_resolution_and_expiry_through_the_store() {
        let dir = temp_profile("tokens");
        let config = Config::open(&dir).expect("open succeeds");
        let token = config
            .with(|store| store.local_access_token())
            .expect("token minted");

        config
            .with(|store| {
                let access = store.access_from_token(&token)?;
                assert_eq!(access.name, "Local access");
                assert!(store.access_from_token("BOGUSTOKEN").is_err());
                Ok(())
            })
            .expect("resolution works");
        let _ = std::fs::remove_dir_all(dir);
    }
}
