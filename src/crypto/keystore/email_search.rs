//! Key discovery through the mail index
//!
//! Finds certificates that arrived as message attachments by consulting
//! the search index for `openpgp_keys`-tagged messages. The store only
//! activates when the owning worker wires in an index; without one it
//! contributes nothing to the cascade.

use tracing::debug;

use super::{KeyStore, StoreResources};
use crate::errors::{ApiError, AppResult};

pub struct EmailSearchKeyStore {
    tag_namespace: Option<String>,
    // TODO: wire the metadata index through StoreResources once the app
    // worker exposes attachment extraction over IPC.
    index_available: bool,
}

impl EmailSearchKeyStore {
    pub fn new(resources: &StoreResources) -> Self {
        Self {
            tag_namespace: resources.tag_namespace.clone(),
            index_available: false,
        }
    }
}

impl KeyStore for EmailSearchKeyStore {
    fn name(&self) -> &str {
        "email"
    }

    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        Err(ApiError::NotFound(format!("email: {fingerprint}")))
    }

    fn find_certs(&self, search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        if !self.index_available {
            debug!(
                terms = search_terms,
                namespace = ?self.tag_namespace,
                "email keystore has no index wired in"
            );
            return Ok(Vec::new());
        }
        Ok(Vec::new())
    }
}
