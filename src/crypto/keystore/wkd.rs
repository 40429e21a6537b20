//! Web Key Directory lookups
//!
//! Derives the advanced-method WKD URL for an address. Actual fetching is
//! a network operation the synchronous cascade cannot perform inline; the
//! OpenPGP worker resolves the URL out-of-band and feeds results into the
//! local keyring, so this store only contributes the address mapping.

use super::KeyStore;
use crate::errors::{ApiError, AppResult};

pub struct WkdKeyStore;

impl WkdKeyStore {
    pub fn new() -> Self {
        Self
    }

    /// Advanced-method WKD URL for an e-mail address, if well-formed
    pub fn lookup_url(address: &str) -> Option<String> {
        let (local, domain) = address.split_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(format!(
            "https://openpgpkey.{domain}/.well-known/openpgpkey/{domain}/hu/?l={}",
            local.to_ascii_lowercase()
        ))
    }
}

impl Default for WkdKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for WkdKeyStore {
    fn name(&self) -> &str {
        "wkd"
    }

    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        Err(ApiError::NotFound(format!("wkd: {fingerprint}")))
    }

    fn find_certs(&self, _search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::WkdKeyStore;

    #[test]
    fn lookup_url_shape() {
        let url = WkdKeyStore::lookup_url("Alice@Example.org").expect("address parses");
        assert!(url.starts_with("https://openpgpkey.Example.org/.well-known/openpgpkey/"));
        assert!(url.ends_with("?l=alice"));
        assert!(WkdKeyStore::lookup_url("not-an-address").is_none());
    }
}
