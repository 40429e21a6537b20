//! Symmetric encryption envelope for config values and record stores
//!
//! All at-rest encryption goes through one envelope: AES-256-GCM with a
//! 12-byte nonce built from an 8-byte per-process random seed and a
//! monotonic 32-bit counter, so nonces never repeat within a process and
//! never collide across processes. The envelope serializes to base64
//! (`nonce || ciphertext+tag`); callers add their own on-disk markers.
//!
//! Keys come in generations: decryption tries every generation in order,
//! encryption always uses the newest. This is what makes master-key
//! rotation cheap (old values stay readable, new values use the new key).

use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{ApiError, AppResult};

/// Derive a 32-byte AES key from arbitrary key material
///
/// The material is hashed, never used directly, so callers may pass
/// passcodes, stretched passphrases or other secrets of any length.
pub fn make_aes_key(material: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(material);
    digest.into()
}

/// Derive a namespaced 32-byte AES key
///
/// Used when several storage files share one master key: deriving a
/// per-file key reduces the blast radius of nonce reuse between files.
pub fn derive_aes_key(namespace: &[u8], material: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(namespace);
    hasher.update(b"\0");
    hasher.update(material);
    hasher.finalize().into()
}

/// Per-process nonce source: random seed plus monotonic counter
///
/// The seed is drawn once from the CSPRNG at construction; the counter
/// increments on every nonce. Wrapping after 2^32 nonces is acceptable
/// because the seed makes cross-process collisions negligible and a single
/// process never approaches that volume.
pub struct NonceFactory {
    seed: [u8; 8],
    counter: AtomicU32,
}

impl NonceFactory {
    pub fn new() -> Self {
        let mut seed = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            seed,
            counter: AtomicU32::new(0),
        }
    }

    /// Produce the next unique 12-byte nonce
    pub fn next_nonce(&self) -> [u8; 12] {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.seed);
        nonce[8..].copy_from_slice(&count.to_be_bytes());
        nonce
    }
}

impl Default for NonceFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypt plaintext under `key`, returning base64 of `nonce || ciphertext`
pub fn seal(key: &[u8; 32], nonces: &NonceFactory, plaintext: &[u8]) -> AppResult<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = nonces.next_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ApiError::internal("AES-GCM encryption failed"))?;
    let mut packed = Vec::with_capacity(12 + ciphertext.len());
    packed.extend_from_slice(&nonce);
    packed.extend_from_slice(&ciphertext);
    Ok(B64.encode(packed))
}

/// Decrypt a sealed value with a single key
///
/// # Errors
///
/// `Integrity` if the envelope is malformed or the authentication tag does
/// not verify. The failure is scoped to this value only.
pub fn open(key: &[u8; 32], sealed: &str) -> AppResult<Vec<u8>> {
    let packed = B64
        .decode(sealed.trim())
        .map_err(|e| ApiError::Integrity(format!("bad envelope encoding: {e}")))?;
    if packed.len() < 12 + 16 {
        return Err(ApiError::Integrity("envelope too short".to_owned()));
    }
    let (nonce, ciphertext) = packed.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ApiError::Integrity("AES-GCM tag mismatch".to_owned()))
}

/// Decrypt trying every key generation in order
///
/// Returns the first successful plaintext. Integrity errors from older
/// generations are swallowed; if no generation opens the value, the last
/// error surfaces.
pub fn open_any(keys: &[[u8; 32]], sealed: &str) -> AppResult<Vec<u8>> {
    let mut last = ApiError::Integrity("no decryption keys available".to_owned());
    for key in keys {
        match open(key, sealed) {
            Ok(plain) => return Ok(plain),
            Err(err) => last = err,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::{NonceFactory, make_aes_key, open, open_any, seal};

    #[test]
    fn seal_and_open_round_trip() {
        let key = make_aes_key(b"test key material");
        let nonces = NonceFactory::new();
        let sealed = seal(&key, &nonces, b"hello encrypted world").expect("seal succeeds");
        assert_eq!(
            open(&key, &sealed).expect("open succeeds"),
            b"hello encrypted world"
        );
    }

    #[test]
    fn nonces_never_repeat() {
        let nonces = NonceFactory::new();
        let a = nonces.next_nonce();
        let b = nonces.next_nonce();
        assert_ne!(a, b);
        assert_eq!(a[..8], b[..8]);
    }

    #[test]
    fn wrong_key_is_an_integrity_error() {
        let key = make_aes_key(b"right");
        let nonces = NonceFactory::new();
        let sealed = seal(&key, &nonces, b"secret").expect("seal succeeds");
        let wrong = make_aes_key(b"wrong");
        assert!(open(&wrong, &sealed).is_err());
    }

    #[test]
    fn open_any_tries_generations_in_order() {
        let old = make_aes_key(b"generation 0");
        let new = make_aes_key(b"generation 1");
        let nonces = NonceFactory::new();
        let sealed_old = seal(&old, &nonces, b"written long ago").expect("seal succeeds");
        let opened = open_any(&[old, new], &sealed_old).expect("old generation still opens");
        assert_eq!(opened, b"written long ago");
    }

    #[test]
    fn truncated_envelope_fails_loudly() {
        let key = make_aes_key(b"key");
        assert!(open(&key, "AAAA").is_err());
        assert!(open(&key, "not base64 at all!").is_err());
    }
}
