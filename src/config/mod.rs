//! Encrypted, sectioned configuration
//!
//! - [`store`]: the INI-backed store with value encryption, passphrase
//!   unlock, master-key generations and rotating backups
//! - [`access`]: access grants, role strings and bearer tokens
//! - [`schema`]: typed views over Account/Identity/Context sections

pub mod access;
pub mod schema;
pub mod store;

pub use store::{Config, ConfigValue};
