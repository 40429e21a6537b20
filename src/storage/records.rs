//! Append-only encrypted record log with a fingerprint index
//!
//! Records are single lines of `<key> <value>` appended under a file lock;
//! an in-memory index maps each key to the offset of its newest line, so
//! re-writing a key shadows earlier records without touching them. A
//! periodic compaction may rewrite the log dropping shadowed lines.
//!
//! Values are sealed with the store's key generations, or with an explicit
//! per-record key (the recovery service derives one from each reset code).
//! Tombstone lines (`<key> -`) mark deletions.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::crypto::aes::{NonceFactory, open, open_any, seal};
use crate::errors::{ApiError, AppResult};

/// Marker prefix for encrypted values (mirrors the config file convention)
const ENC_MARKER: &str = "::";
/// Tombstone value for deleted keys
const TOMBSTONE: &str = "-";

struct LogState {
    file: File,
    len: u64,
    index: HashMap<String, u64>,
}

/// Append-only record store
pub struct RecordStore {
    path: PathBuf,
    keys: Vec<[u8; 32]>,
    nonces: NonceFactory,
    state: Mutex<LogState>,
}

impl RecordStore {
    /// Open (or create) the log `<dir>/<namespace>.log` and build the index
    pub fn open(dir: &Path, namespace: &str, keys: Vec<[u8; 32]>) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{namespace}.log"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let (index, len) = Self::scan(&path)?;
        debug!(path = %path.display(), records = index.len(), "opened record store");
        Ok(Self {
            path,
            keys,
            nonces: NonceFactory::new(),
            state: Mutex::new(LogState { file, len, index }),
        })
    }

    /// Rebuild the fingerprint index by scanning the whole log
    fn scan(path: &Path) -> AppResult<(HashMap<String, u64>, u64)> {
        let mut index = HashMap::new();
        let mut offset = 0u64;
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let line_len = line.len() as u64 + 1;
            if let Some((key, value)) = line.split_once(' ') {
                if value == TOMBSTONE {
                    index.remove(key);
                } else {
                    index.insert(key.to_owned(), offset);
                }
            }
            offset += line_len;
        }
        Ok((index, offset))
    }

    /// Number of live (non-shadowed, non-deleted) records
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys, unordered
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().index.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().index.contains_key(key)
    }

    fn encode_value(&self, value: &Value, record_key: Option<&[u8; 32]>) -> AppResult<String> {
        let plain = serde_json::to_string(value)?;
        if let Some(key) = record_key {
            return Ok(format!("{ENC_MARKER}{}", seal(key, &self.nonces, plain.as_bytes())?));
        }
        match self.keys.last() {
            Some(newest) => Ok(format!(
                "{ENC_MARKER}{}",
                seal(newest, &self.nonces, plain.as_bytes())?
            )),
            None => Ok(plain),
        }
    }

    fn decode_value(&self, raw: &str, record_key: Option<&[u8; 32]>) -> AppResult<Value> {
        let Some(sealed) = raw.strip_prefix(ENC_MARKER) else {
            return Ok(serde_json::from_str(raw)?);
        };
        let plain = match record_key {
            Some(key) => open(key, sealed)?,
            None => open_any(&self.keys, sealed)?,
        };
        Ok(serde_json::from_str(&String::from_utf8_lossy(&plain))?)
    }

    /// Write a record; a later write to the same key shadows this one
    ///
    /// Keys must be free of whitespace and newlines (they are index tokens,
    /// typically base64url hashes).
    pub fn set(&self, key: &str, value: &Value, record_key: Option<&[u8; 32]>) -> AppResult<()> {
        if key.is_empty() || key.contains([' ', '\n', '\r']) {
            return Err(ApiError::invalid(format!("bad record key '{key}'")));
        }
        let encoded = self.encode_value(value, record_key)?;
        let line = format!("{key} {encoded}\n");

        let mut state = self.state.lock();
        let offset = state.len;
        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.len += line.len() as u64;
        state.index.insert(key.to_owned(), offset);
        Ok(())
    }

    /// Read the newest record for a key
    ///
    /// # Errors
    ///
    /// `Integrity` if the value cannot be decrypted (wrong key, corrupt
    /// line); missing keys return `Ok(None)`.
    pub fn get(&self, key: &str, record_key: Option<&[u8; 32]>) -> AppResult<Option<Value>> {
        let offset = {
            let state = self.state.lock();
            match state.index.get(key) {
                Some(offset) => *offset,
                None => return Ok(None),
            }
        };
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let (found_key, raw) = line
            .trim_end_matches('\n')
            .split_once(' ')
            .ok_or_else(|| ApiError::Integrity("torn record line".to_owned()))?;
        if found_key != key {
            return Err(ApiError::Integrity(format!(
                "index points at record '{found_key}', wanted '{key}'"
            )));
        }
        self.decode_value(raw, record_key).map(Some)
    }

    /// Remove a key by appending a tombstone
    pub fn remove(&self, key: &str) -> AppResult<bool> {
        let mut state = self.state.lock();
        if state.index.remove(key).is_none() {
            return Ok(false);
        }
        let line = format!("{key} {TOMBSTONE}\n");
        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.len += line.len() as u64;
        Ok(true)
    }

    /// Rewrite the log dropping shadowed and deleted records
    ///
    /// Returns the number of bytes reclaimed. Readers holding offsets
    /// across a compaction would be wrong, so the whole operation holds
    /// the store lock.
    pub fn compact(&self) -> AppResult<u64> {
        let mut state = self.state.lock();
        let old_len = state.len;

        let mut live: Vec<(String, u64)> = state
            .index
            .iter()
            .map(|(k, o)| (k.clone(), *o))
            .collect();
        live.sort_by_key(|(_, offset)| *offset);

        let tmp_path = self.path.with_extension("log.compact");
        let mut out = File::create(&tmp_path)?;
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut new_index = HashMap::with_capacity(live.len());
        let mut new_len = 0u64;

        for (key, offset) in live {
            reader.seek(SeekFrom::Start(offset))?;
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if !line.ends_with('\n') {
                line.push('\n');
            }
            out.write_all(line.as_bytes())?;
            new_index.insert(key, new_len);
            new_len += line.len() as u64;
        }
        out.flush()?;
        std::fs::rename(&tmp_path, &self.path)?;

        state.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        state.len = new_len;
        state.index = new_index;
        Ok(old_len.saturating_sub(new_len))
    }
}
