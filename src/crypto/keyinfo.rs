//! Minimal OpenPGP certificate inspection
//!
//! The key-store cascade and the Autocrypt state machine only need to know
//! whether a blob of keydata parses as an OpenPGP certificate, which
//! fingerprints it carries and which user IDs it names. This module walks
//! the packet structure far enough to answer those questions; it does not
//! validate signatures or expiry (that is the OpenPGP worker's SOP
//! backend's job).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use sha1::{Digest, Sha1};

use crate::errors::{ApiError, AppResult};

/// Summary of one OpenPGP certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Primary key fingerprint, uppercase hex
    pub fingerprint: String,
    /// Subkey fingerprints, uppercase hex
    pub subkey_fingerprints: Vec<String>,
    /// UserID packets, e.g. `Alice <alice@example.org>`
    pub user_ids: Vec<String>,
    /// Primary key creation time (Unix seconds)
    pub created: i64,
}

impl KeyInfo {
    /// True if any user ID mentions `term` (case-insensitive substring)
    pub fn matches(&self, term: &str) -> bool {
        let term = term.to_ascii_lowercase();
        self.fingerprint.to_ascii_lowercase().contains(&term)
            || self
                .user_ids
                .iter()
                .any(|uid| uid.to_ascii_lowercase().contains(&term))
    }
}

/// Parse certificate keydata (binary or ASCII-armored) into [`KeyInfo`]
///
/// # Errors
///
/// `InvalidArgument` if the data does not contain at least one v4 public
/// key packet.
pub fn get_keyinfo(keydata: &[u8]) -> AppResult<KeyInfo> {
    let binary = if looks_armored(keydata) {
        dearmor(keydata)?
    } else {
        keydata.to_vec()
    };

    let mut fingerprint = None;
    let mut subkeys = Vec::new();
    let mut user_ids = Vec::new();
    let mut created = 0i64;

    let mut cursor = 0usize;
    while cursor < binary.len() {
        let (tag, body, next) = read_packet(&binary, cursor)?;
        match tag {
            // Public key / public subkey
            6 | 14 => {
                let (fpr, ts) = key_packet_fingerprint(body)?;
                if tag == 6 && fingerprint.is_none() {
                    fingerprint = Some(fpr);
                    created = ts;
                } else {
                    subkeys.push(fpr);
                }
            }
            // UserID
            13 => {
                if let Ok(uid) = std::str::from_utf8(body) {
                    user_ids.push(uid.to_owned());
                }
            }
            _ => {}
        }
        cursor = next;
    }

    match fingerprint {
        Some(fingerprint) => Ok(KeyInfo {
            fingerprint,
            subkey_fingerprints: subkeys,
            user_ids,
            created,
        }),
        None => Err(ApiError::invalid("no public key packet in keydata")),
    }
}

fn looks_armored(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN PGP")
}

/// Strip ASCII armor down to the base64 payload and decode it
///
/// The trailing CRC-24 line (starting with `=`) is skipped; CRC validation
/// adds nothing on top of the packet parse.
fn dearmor(data: &[u8]) -> AppResult<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ApiError::invalid("armored keydata is not UTF-8"))?;
    let mut payload = String::new();
    let mut in_body = false;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN") {
            in_body = true;
            continue;
        }
        if line.starts_with("-----END") {
            break;
        }
        if !in_body || line.is_empty() || line.contains(':') || line.starts_with('=') {
            continue;
        }
        payload.push_str(line);
    }
    B64.decode(payload)
        .map_err(|e| ApiError::invalid(format!("bad armor payload: {e}")))
}

/// Decode one packet header, returning `(tag, body, next_offset)`
fn read_packet(data: &[u8], at: usize) -> AppResult<(u8, &[u8], usize)> {
    let header = *data
        .get(at)
        .ok_or_else(|| ApiError::invalid("truncated packet stream"))?;
    if header & 0x80 == 0 {
        return Err(ApiError::invalid("not an OpenPGP packet"));
    }

    let (tag, len, body_at) = if header & 0x40 != 0 {
        // New format: tag in low 6 bits, one/two/five-octet lengths
        let tag = header & 0x3f;
        let first = *data
            .get(at + 1)
            .ok_or_else(|| ApiError::invalid("truncated packet length"))? as usize;
        match first {
            0..=191 => (tag, first, at + 2),
            192..=223 => {
                let second = *data
                    .get(at + 2)
                    .ok_or_else(|| ApiError::invalid("truncated packet length"))?
                    as usize;
                (tag, (first - 192) * 256 + second + 192, at + 3)
            }
            255 => {
                let bytes = data
                    .get(at + 2..at + 6)
                    .ok_or_else(|| ApiError::invalid("truncated packet length"))?;
                let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                (tag, len, at + 6)
            }
            // Partial body lengths only occur in data packets, never keys
            _ => return Err(ApiError::invalid("partial packet length in keydata")),
        }
    } else {
        // Old format: tag in bits 2-5, length type in low 2 bits
        let tag = (header & 0x3c) >> 2;
        match header & 0x03 {
            0 => {
                let len = *data
                    .get(at + 1)
                    .ok_or_else(|| ApiError::invalid("truncated packet length"))?
                    as usize;
                (tag, len, at + 2)
            }
            1 => {
                let bytes = data
                    .get(at + 1..at + 3)
                    .ok_or_else(|| ApiError::invalid("truncated packet length"))?;
                (tag, u16::from_be_bytes([bytes[0], bytes[1]]) as usize, at + 3)
            }
            2 => {
                let bytes = data
                    .get(at + 1..at + 5)
                    .ok_or_else(|| ApiError::invalid("truncated packet length"))?;
                let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                (tag, len, at + 5)
            }
            _ => return Err(ApiError::invalid("indeterminate packet length in keydata")),
        }
    };

    let body = data
        .get(body_at..body_at + len)
        .ok_or_else(|| ApiError::invalid("truncated packet body"))?;
    Ok((tag, body, body_at + len))
}

/// v4 fingerprint: SHA-1 over `0x99 || be16(len) || body`
fn key_packet_fingerprint(body: &[u8]) -> AppResult<(String, i64)> {
    if body.first() != Some(&4) {
        return Err(ApiError::invalid("unsupported key packet version"));
    }
    if body.len() < 6 {
        return Err(ApiError::invalid("key packet too short"));
    }
    let created = i64::from(u32::from_be_bytes([body[1], body[2], body[3], body[4]]));

    let mut hasher = Sha1::new();
    hasher.update([0x99]);
    hasher.update(u16::try_from(body.len())
        .map_err(|_| ApiError::invalid("key packet too large"))?
        .to_be_bytes());
    hasher.update(body);
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(40);
    for byte in digest {
        hex.push_str(&format!("{byte:02X}"));
    }
    Ok((hex, created))
}
