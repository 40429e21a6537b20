//! Passphrase stretching and obfuscated in-memory secret storage
//!
//! Passphrases are stretched with scrypt (n=2^17, r=8, p=1) before any key
//! derivation. Unlocked secrets are held in [`SecurePassphrase`], which
//! XOR-masks the bytes with a random pad so the cleartext never sits
//! contiguously in memory, and zeroizes both halves on drop.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use scrypt::{Params, scrypt};
use zeroize::Zeroize;

use crate::errors::{ApiError, AppResult};

/// scrypt cost parameters: n=2^17, r=8, p=1, 32-byte output
///
/// The parameters are fixed; changing them would invalidate every stored
/// `config_key`, so a future change needs a versioned envelope.
const SCRYPT_LOG_N: u8 = 17;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_LEN: usize = 32;

/// Stretch a passphrase with scrypt and a salt, returning base64 output
///
/// The base64 form matches what gets fed into AES key derivation, so the
/// stretched value can be handled as ordinary printable key material.
pub fn stretch_with_scrypt(passphrase: &[u8], salt: &[u8]) -> AppResult<String> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_LEN)
        .map_err(|e| ApiError::internal(format!("bad scrypt parameters: {e}")))?;
    let mut out = [0u8; SCRYPT_LEN];
    scrypt(passphrase, salt, &params, &mut out)
        .map_err(|e| ApiError::internal(format!("scrypt failed: {e}")))?;
    let encoded = B64.encode(out);
    out.zeroize();
    Ok(encoded)
}

/// Obfuscated in-memory passphrase storage
///
/// The stored bytes are XOR-masked with a same-length random pad, so the
/// cleartext exists only transiently inside [`SecurePassphrase::reveal`].
/// This is not protection against a debugger, but it keeps the passphrase
/// out of accidental memory dumps, logs and swapped pages in cleartext
/// form. An optional expiration makes the secret evaporate on first access
/// after the deadline.
pub struct SecurePassphrase {
    masked: Vec<u8>,
    pad: Vec<u8>,
    /// Unix timestamp after which the secret self-destructs; 0 = never
    pub expiration: i64,
    /// Bumped on every set/copy so caches can detect staleness
    pub generation: u64,
}

impl SecurePassphrase {
    /// Store a passphrase, masking it immediately
    pub fn new(passphrase: &[u8]) -> Self {
        let mut pad = vec![0u8; passphrase.len()];
        rand::thread_rng().fill_bytes(&mut pad);
        let masked = passphrase
            .iter()
            .zip(pad.iter())
            .map(|(b, p)| b ^ p)
            .collect();
        Self {
            masked,
            pad,
            expiration: 0,
            generation: 1,
        }
    }

    /// Empty storage with no secret set
    pub fn unset() -> Self {
        Self {
            masked: Vec::new(),
            pad: Vec::new(),
            expiration: 0,
            generation: 0,
        }
    }

    /// Replace the stored passphrase
    pub fn set(&mut self, passphrase: &[u8]) {
        self.wipe();
        let mut pad = vec![0u8; passphrase.len()];
        rand::thread_rng().fill_bytes(&mut pad);
        self.masked = passphrase
            .iter()
            .zip(pad.iter())
            .map(|(b, p)| b ^ p)
            .collect();
        self.pad = pad;
        self.generation += 1;
    }

    pub fn is_set(&self) -> bool {
        !self.pad.is_empty()
    }

    fn expired(&self) -> bool {
        self.expiration > 0 && chrono::Utc::now().timestamp() > self.expiration
    }

    /// Run `f` over the cleartext bytes, wiping the temporary afterwards
    ///
    /// Returns `None` if no secret is set or it has expired (expiry also
    /// wipes the stored secret).
    pub fn reveal<T>(&mut self, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        if self.expired() {
            self.wipe();
            return None;
        }
        if !self.is_set() {
            return None;
        }
        let mut clear: Vec<u8> = self
            .masked
            .iter()
            .zip(self.pad.iter())
            .map(|(b, p)| b ^ p)
            .collect();
        let result = f(&clear);
        clear.zeroize();
        Some(result)
    }

    /// Constant-shape comparison against a candidate passphrase
    pub fn compare(&mut self, candidate: &[u8]) -> bool {
        self.reveal(|clear| {
            if clear.len() != candidate.len() {
                return false;
            }
            let mut diff = 0u8;
            for (a, b) in clear.iter().zip(candidate.iter()) {
                diff |= a ^ b;
            }
            diff == 0
        })
        .unwrap_or(false)
    }

    fn wipe(&mut self) {
        self.masked.zeroize();
        self.pad.zeroize();
        self.masked.clear();
        self.pad.clear();
    }
}

impl Drop for SecurePassphrase {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Generate a random passcode: dash-joined groups of decimal digits
///
/// The default shape (7 groups of 6 digits) carries roughly 139 bits of
/// entropy. Not human-friendly, but these are keys to the kingdom.
pub fn generate_passcode(groups: usize, length: usize) -> String {
    debug_assert!(length > 0 && length < 8);
    let mut rng = rand::thread_rng();
    let mut parts = Vec::with_capacity(groups);
    for _ in 0..groups {
        let mut value = rng.next_u32();
        let mut group = String::with_capacity(length);
        for _ in 0..length {
            group.push(char::from(b'0' + (value % 10) as u8));
            value /= 10;
        }
        parts.push(group);
    }
    parts.join("-")
}

/// Default passcode shape used for config and master keys
pub fn generate_default_passcode() -> String {
    generate_passcode(7, 6)
}
