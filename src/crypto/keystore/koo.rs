//! keys.openpgp.org lookups
//!
//! Like WKD, the keys-server store maps queries to lookup URLs; fetching
//! happens out-of-band in the OpenPGP worker and results land in the
//! local keyring.

use super::KeyStore;
use crate::errors::{ApiError, AppResult};

const KOO_BASE: &str = "https://keys.openpgp.org";

pub struct KooKeyStore;

impl KooKeyStore {
    pub fn new() -> Self {
        Self
    }

    /// Lookup URL for a fingerprint or e-mail search term
    pub fn lookup_url(term: &str) -> String {
        if term.contains('@') {
            format!("{KOO_BASE}/vks/v1/by-email/{term}")
        } else {
            format!("{KOO_BASE}/vks/v1/by-fingerprint/{}", term.to_ascii_uppercase())
        }
    }
}

impl Default for KooKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for KooKeyStore {
    fn name(&self) -> &str {
        "koo"
    }

    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        Err(ApiError::NotFound(format!("koo: {fingerprint}")))
    }

    fn find_certs(&self, _search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}
