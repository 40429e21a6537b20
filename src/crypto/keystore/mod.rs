//! Pluggable OpenPGP key sources and the prioritized cascade
//!
//! A [`KeyStore`] is anything that can produce OpenPGP certificates (and
//! sometimes private keys) for a fingerprint or search term: the local
//! keyring, the mail index, WKD, a keys server, or the Autocrypt peer
//! database. [`PrioritizedKeyStores`] consults them in configured order
//! with per-call deadlines and result caps; stores that do not implement
//! an operation simply contribute nothing.
//!
//! Store construction goes through a [`KeyStoreRegistry`] owned by the
//! worker that builds the cascade; there are no process-level registries.

pub mod autocrypt;
pub mod email_search;
pub mod koo;
pub mod local;
pub mod wkd;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::crypto::keyinfo::{KeyInfo, get_keyinfo};
use crate::errors::{ApiError, AppResult};

/// Default cascade without networking enabled
pub const DEFAULT_LOCAL_KEYSTORES: &str = "local:shared, email, autocrypt";
/// Default cascade with networking
pub const DEFAULT_KEYSTORES: &str = "local:shared, email, wkd, koo, autocrypt";

/// Shared resources handed to every store constructor
#[derive(Clone)]
pub struct StoreResources {
    /// Directory for store-owned state files
    pub data_dir: PathBuf,
    /// Namespace for file names (usually the worker name)
    pub file_namespace: String,
    /// Tag namespace of the owning context, if any
    pub tag_namespace: Option<String>,
    /// Key generations for encrypted store files (oldest first)
    pub encryption_keys: Vec<[u8; 32]>,
}

/// A single source of OpenPGP key material
///
/// Default method bodies make every operation optional: searches that a
/// store cannot answer find nothing, lookups report not-found, writes are
/// rejected. Stores override what they actually support.
pub trait KeyStore: Send + Sync {
    /// Short name used for cascade selection and diagnostics
    fn name(&self) -> &str;

    /// Fetch the certificate with the given fingerprint
    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        Err(ApiError::NotFound(format!(
            "{}: no certificate {fingerprint}",
            self.name()
        )))
    }

    /// All certificates matching the search terms
    fn find_certs(&self, _search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    /// Fetch the private key with the given fingerprint
    fn get_private_key(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        Err(ApiError::NotFound(format!(
            "{}: no private key {fingerprint}",
            self.name()
        )))
    }

    /// All private keys matching the search terms
    fn find_private_keys(&self, _search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    /// Add a certificate to the store
    fn save_cert(&self, _cert: &[u8]) -> AppResult<()> {
        Err(ApiError::Denied {
            kind: "read-only".to_owned(),
            message: format!("{} does not accept certificates", self.name()),
        })
    }

    /// Delete the certificate with the given fingerprint
    fn delete_cert(&self, fingerprint: &str) -> AppResult<()> {
        Err(ApiError::NotFound(format!(
            "{}: no certificate {fingerprint}",
            self.name()
        )))
    }
}

/// Constructor table for key stores, owned by the worker that uses it
///
/// Populated at worker startup; consulted when parsing a cascade config
/// line. Names are matched case-insensitively.
pub struct KeyStoreRegistry {
    constructors: HashMap<String, Box<dyn Fn(Option<&str>, &StoreResources) -> AppResult<Arc<dyn KeyStore>> + Send + Sync>>,
}

impl KeyStoreRegistry {
    /// Registry with the built-in store types
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("local", |which, res| {
            Ok(Arc::new(local::LocalKeyStore::open(which, res)?) as Arc<dyn KeyStore>)
        });
        registry.register("email", |_which, res| {
            Ok(Arc::new(email_search::EmailSearchKeyStore::new(res)) as Arc<dyn KeyStore>)
        });
        registry.register("wkd", |_which, _res| {
            Ok(Arc::new(wkd::WkdKeyStore::new()) as Arc<dyn KeyStore>)
        });
        registry.register("koo", |_which, _res| {
            Ok(Arc::new(koo::KooKeyStore::new()) as Arc<dyn KeyStore>)
        });
        registry.register("autocrypt", |which, res| {
            Ok(Arc::new(autocrypt::AutocryptKeyStore::open(which, res)?) as Arc<dyn KeyStore>)
        });
        registry
    }

    /// Register a store constructor under a name
    pub fn register(
        &mut self,
        name: &str,
        constructor: impl Fn(Option<&str>, &StoreResources) -> AppResult<Arc<dyn KeyStore>>
        + Send
        + Sync
        + 'static,
    ) {
        self.constructors
            .insert(name.to_ascii_lowercase(), Box::new(constructor));
    }

    fn build(
        &self,
        name: &str,
        which: Option<&str>,
        resources: &StoreResources,
    ) -> AppResult<Arc<dyn KeyStore>> {
        let constructor = self
            .constructors
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| ApiError::NotFound(format!("Unknown keystore: {name}")))?;
        constructor(which, resources)
    }
}

/// In-order-of-priority list of key stores
///
/// All lookup methods take an optional wall-clock deadline; on expiry they
/// return whatever was gathered so far and never raise. Search methods
/// additionally cap the number of results.
pub struct PrioritizedKeyStores {
    stores: Vec<Arc<dyn KeyStore>>,
}

impl PrioritizedKeyStores {
    /// Build a cascade from a config line like `local:shared, email, wkd`
    ///
    /// Each entry is `name` or `name:which`, where `which` selects a store
    /// instance (a keyring name, a database path).
    pub fn from_config(
        config_line: &str,
        registry: &KeyStoreRegistry,
        resources: &StoreResources,
    ) -> AppResult<Self> {
        let mut stores = Vec::new();
        for entry in config_line.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, which) = match entry.split_once(':') {
                Some((name, which)) => (name, Some(which)),
                None => (entry, None),
            };
            stores.push(registry.build(name, which, resources)?);
        }
        Ok(Self { stores })
    }

    /// Direct construction from already-built stores (used by tests)
    pub fn from_stores(stores: Vec<Arc<dyn KeyStore>>) -> Self {
        Self { stores }
    }

    /// Find a member store by name
    pub fn get_store(&self, name: &str) -> Option<&Arc<dyn KeyStore>> {
        self.stores
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }

    fn expired(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| Instant::now() > d)
    }

    /// First store that can produce the certificate wins
    ///
    /// # Errors
    ///
    /// `NotFound` naming the stores that were tried; `Denied` propagates
    /// immediately (a locked store should not be silently skipped).
    pub fn get_cert(&self, fingerprint: &str, deadline: Option<Instant>) -> AppResult<Vec<u8>> {
        let mut tried = Vec::new();
        for store in &self.stores {
            if Self::expired(deadline) {
                break;
            }
            debug!(store = store.name(), fingerprint, "keystore lookup");
            match store.get_cert(fingerprint) {
                Ok(cert) => return Ok(cert),
                Err(ApiError::NotFound(_)) => tried.push(store.name().to_owned()),
                Err(err @ ApiError::Denied { .. }) => return Err(err),
                Err(err) => {
                    debug!(store = store.name(), error = %err, "keystore lookup failed");
                    tried.push(store.name().to_owned());
                }
            }
        }
        Err(ApiError::NotFound(format!(
            "Tried keystores: {}",
            tried.join(", ")
        )))
    }

    /// Certificates from every store, in priority order
    pub fn find_certs(
        &self,
        search_terms: &str,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Vec<Vec<u8>> {
        let mut results = Vec::new();
        'stores: for store in &self.stores {
            if Self::expired(deadline) {
                break;
            }
            match store.find_certs(search_terms) {
                Ok(certs) => {
                    for cert in certs {
                        results.push(cert);
                        if max_results.is_some_and(|cap| results.len() >= cap) {
                            break 'stores;
                        }
                        if Self::expired(deadline) {
                            break 'stores;
                        }
                    }
                }
                Err(err) => {
                    debug!(store = store.name(), error = %err, "keystore search failed");
                }
            }
        }
        results
    }

    /// Like [`Self::find_certs`], but parsed into [`KeyInfo`] summaries
    ///
    /// Certificates that fail to parse are skipped.
    pub fn list_certs(
        &self,
        search_terms: &str,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Vec<KeyInfo> {
        self.find_certs(search_terms, max_results, deadline)
            .iter()
            .filter_map(|cert| get_keyinfo(cert).ok())
            .collect()
    }

    /// First store that can produce the private key wins
    pub fn get_private_key(
        &self,
        fingerprint: &str,
        deadline: Option<Instant>,
    ) -> AppResult<Vec<u8>> {
        let mut tried = Vec::new();
        for store in &self.stores {
            if Self::expired(deadline) {
                break;
            }
            match store.get_private_key(fingerprint) {
                Ok(key) => return Ok(key),
                Err(ApiError::Denied { kind, message }) => {
                    return Err(ApiError::Denied { kind, message });
                }
                Err(_) => tried.push(store.name().to_owned()),
            }
        }
        Err(ApiError::NotFound(format!(
            "Tried keystores: {}",
            tried.join(", ")
        )))
    }

    /// Private keys from every store, in priority order
    pub fn find_private_keys(
        &self,
        search_terms: &str,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Vec<Vec<u8>> {
        let mut results = Vec::new();
        'stores: for store in &self.stores {
            if Self::expired(deadline) {
                break;
            }
            if let Ok(keys) = store.find_private_keys(search_terms) {
                for key in keys {
                    results.push(key);
                    if max_results.is_some_and(|cap| results.len() >= cap) {
                        break 'stores;
                    }
                }
            }
        }
        results
    }

    /// Save a certificate into the named store (or the first store)
    pub fn save_cert(&self, cert: &[u8], which: Option<&str>) -> AppResult<()> {
        let store = match which {
            Some(name) => self
                .get_store(name)
                .ok_or_else(|| ApiError::NotFound(format!("Unknown keystore: {name}")))?,
            None => self
                .stores
                .first()
                .ok_or_else(|| ApiError::internal("empty keystore cascade"))?,
        };
        store.save_cert(cert)
    }

    /// Delete a certificate from one store, or all of them (`which = "*"`)
    ///
    /// In all-stores mode, returns how many stores deleted something.
    pub fn delete_cert(&self, fingerprint: &str, which: Option<&str>) -> AppResult<usize> {
        if which == Some("*") {
            let mut count = 0;
            for store in &self.stores {
                if store.delete_cert(fingerprint).is_ok() {
                    count += 1;
                }
            }
            return Ok(count);
        }
        let store = match which {
            Some(name) => self
                .get_store(name)
                .ok_or_else(|| ApiError::NotFound(format!("Unknown keystore: {name}")))?,
            None => self
                .stores
                .first()
                .ok_or_else(|| ApiError::internal("empty keystore cascade"))?,
        };
        store.delete_cert(fingerprint)?;
        Ok(1)
    }
}
