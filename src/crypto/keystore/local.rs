//! Local on-disk keyring store
//!
//! Certificates and private keys live as individual files under a keyring
//! directory, named by fingerprint (`<FPR>.cert` / `<FPR>.key`). Several
//! named keyrings may coexist; the cascade config selects one with
//! `local:<ring>` (default ring: `shared`).

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::{KeyStore, StoreResources};
use crate::crypto::keyinfo::get_keyinfo;
use crate::errors::{ApiError, AppResult};

pub struct LocalKeyStore {
    ring_dir: PathBuf,
}

impl LocalKeyStore {
    /// Open (creating if needed) the named keyring
    pub fn open(which: Option<&str>, resources: &StoreResources) -> AppResult<Self> {
        let ring = which.unwrap_or("shared");
        if ring.contains(['/', '\\']) || ring.starts_with('.') {
            return Err(ApiError::invalid(format!("bad keyring name '{ring}'")));
        }
        let ring_dir = resources.data_dir.join("keyring").join(ring);
        fs::create_dir_all(&ring_dir)?;
        Ok(Self { ring_dir })
    }

    fn cert_path(&self, fingerprint: &str) -> PathBuf {
        self.ring_dir
            .join(format!("{}.cert", fingerprint.to_ascii_uppercase()))
    }

    fn key_path(&self, fingerprint: &str) -> PathBuf {
        self.ring_dir
            .join(format!("{}.key", fingerprint.to_ascii_uppercase()))
    }

    fn scan(&self, suffix: &str, terms: &str) -> AppResult<Vec<Vec<u8>>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.ring_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(suffix) {
                continue;
            }
            let data = fs::read(entry.path())?;
            match get_keyinfo(&data) {
                Ok(info) if terms.is_empty() || info.matches(terms) => found.push(data),
                Ok(_) => {}
                Err(err) => {
                    debug!(file = name, error = %err, "skipping unparsable key file");
                }
            }
        }
        Ok(found)
    }
}

impl KeyStore for LocalKeyStore {
    fn name(&self) -> &str {
        "local"
    }

    fn get_cert(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        let path = self.cert_path(fingerprint);
        if path.exists() {
            Ok(fs::read(path)?)
        } else {
            Err(ApiError::NotFound(format!("local: {fingerprint}")))
        }
    }

    fn find_certs(&self, search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        self.scan(".cert", search_terms)
    }

    fn get_private_key(&self, fingerprint: &str) -> AppResult<Vec<u8>> {
        let path = self.key_path(fingerprint);
        if path.exists() {
            Ok(fs::read(path)?)
        } else {
            Err(ApiError::NotFound(format!("local: {fingerprint}")))
        }
    }

    fn find_private_keys(&self, search_terms: &str) -> AppResult<Vec<Vec<u8>>> {
        self.scan(".key", search_terms)
    }

    fn save_cert(&self, cert: &[u8]) -> AppResult<()> {
        let info = get_keyinfo(cert)?;
        fs::write(self.cert_path(&info.fingerprint), cert)?;
        Ok(())
    }

    fn delete_cert(&self, fingerprint: &str) -> AppResult<()> {
        let path = self.cert_path(fingerprint);
        if !path.exists() {
            return Err(ApiError::NotFound(format!("local: {fingerprint}")));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{KeyStore, StoreResources};
    use super::LocalKeyStore;

    const TEST_KEY_B64: &str = "\
mDMEXEcE6RYJKwYBBAHaRw8BAQdArjWwk3FAqyiFbFBKT4TzXcVBqPTB3gmzlC/Ub7O1u\
120JkFsaWNlIExvdmVsYWNlIDxhbGljZUBvcGVucGdwLmV4YW1wbGU+iJAEExYIADgCGwMFCwkIBwI\
GFQoJCAsCBBYCAwECHgECF4AWIQTrhbtfozp14V6UTmPyMVUMT0fjjgUCXaWfOgAKCRDyMVUMT0fjj\
ukrAPoDnHBSogOmsHOsd9qGsiZpgRnOdypvbm+QtXZqth9rvwD9HcDC0tC+PHAsO7OTh1S1TC9RiJs\
vawAfCPaQZoed8gK4OARcRwTpEgorBgEEAZdVAQUBAQdAQv8GIa2rSTzgqbXCpDDYMiKRVitCsy203\
x3sE9+eviIDAQgHiHgEGBYIACAWIQTrhbtfozp14V6UTmPyMVUMT0fjjgUCXEcE6QIbDAAKCRDyMVU\
MT0fjjlnQAQDFHUs6TIcxrNTtEZFjUFm1M0PJ1Dng/cDW4xN80fsn0QEA22Kr7VkCjeAEC08VSTeV+\
QFsmz55/lntWkwYWhmvOgE=";

    fn resources() -> StoreResources {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-keyring-{}", std::process::id()));
        StoreResources {
            data_dir: dir,
            file_namespace: "test".to_owned(),
            tag_namespace: None,
            encryption_keys: Vec::new(),
        }
    }

    #[test]
    fn save_find_get_delete_cycle() {
        use base64::Engine;
        let cert = base64::engine::general_purpose::STANDARD
            .decode(TEST_KEY_B64)
            .expect("test key decodes");
        let res = resources();
        let store: Arc<dyn KeyStore> =
            Arc::new(LocalKeyStore::open(Some("cycle"), &res).expect("open succeeds"));

        store.save_cert(&cert).expect("save succeeds");
        let found = store
            .find_certs("alice@openpgp.example")
            .expect("search succeeds");
        assert_eq!(found.len(), 1);
        assert!(store.find_certs("bob@nowhere").expect("search succeeds").is_empty());

        let fpr = "EB85BB5FA33A75E15E944E63F231550C4F47E38E";
        assert_eq!(store.get_cert(fpr).expect("get succeeds"), cert);
        store.delete_cert(fpr).expect("delete succeeds");
        assert!(store.get_cert(fpr).is_err());

        let _ = std::fs::remove_dir_all(res.data_dir);
    }

    #[test]
    fn path_escaping_ring_names_are_rejected() {
        let res = resources();
        assert!(LocalKeyStore::open(Some("../evil"), &res).is_err());
        assert!(LocalKeyStore::open(Some(".hidden"), &res).is_err());
    }
}
