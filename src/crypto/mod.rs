//! Cryptographic primitives and OpenPGP key handling
//!
//! - [`aes`]: the AES-256-GCM envelope used for every encrypted value
//! - [`passphrase`]: scrypt stretching and obfuscated secret storage
//! - [`recovery`]: recovery-code share arithmetic and contact masking
//! - [`keyinfo`]: minimal OpenPGP certificate inspection
//! - [`keystore`]: pluggable key sources and the prioritized cascade

pub mod aes;
pub mod keyinfo;
pub mod keystore;
pub mod passphrase;
pub mod recovery;
