//! nestmail: a privacy-focused personal mail indexer and worker backend
//!
//! The long-running core behind the terminal UI and CLI: encrypted
//! configuration and metadata persistence, a capability-authenticated
//! local RPC surface (HTTP + WebSocket), a supervised worker tree (app,
//! OpenPGP, recovery, SMTP bridge), an IMAP client layer, a chi-squared
//! spam classifier with a filter-script engine, and a shared-secret
//! password-recovery protocol.
//!
//! # Architecture
//!
//! - [`config`]: sectioned encrypted configuration, access grants, schema
//! - [`crypto`]: AES envelope, passphrase stretching, recovery codes,
//!   OpenPGP key stores and the Autocrypt state machine
//! - [`storage`]: record logs, message metadata, mailbox formats, the
//!   ZIP-packaged SQLite container
//! - [`rpc`]: the worker RPC frame, wire shapes and clients
//! - [`workers`]: the worker processes and their supervision
//! - [`imap`]: IMAP connection broker, tokenizer and session
//! - [`classifier`] / [`filters`]: spam scoring and the filter scripts
//! - [`composer`]: send-plan derivation
//! - [`schedule`]: crontab storage (the cron parser is an external
//!   collaborator)
//! - [`errors`]: the typed error model shared by all of the above

pub mod classifier;
pub mod composer;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod filters;
pub mod imap;
pub mod rpc;
pub mod schedule;
pub mod storage;
pub mod workers;

pub use errors::{ApiError, AppResult};
