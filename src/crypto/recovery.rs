//! Recovery-code arithmetic for the password-recovery protocol
//!
//! The recovery scheme splits a passcode into two shares: `passcode_a`
//! stays on the client, `passcode_b` is held by the recovery service. Both
//! are dash-grouped decimal strings of identical shape; only their
//! per-digit mod-10 sum is ever the real decryption key, so neither party
//! holds the full passcode at rest.

use std::sync::LazyLock;

use regex::Regex;

use crate::crypto::passphrase::generate_passcode;
use crate::errors::{ApiError, AppResult};

/// Digits, then digits-or-dashes, then digits: the only accepted shape
pub static VALID_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[\d-]+\d+$").expect("static regex compiles"));

/// Loose but practical e-mail shape check for recovery contacts
pub static VALID_EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s.@]+$").expect("static regex compiles"));

/// Generate a recovery code share with the default key-grade shape
pub fn generate_recovery_code() -> String {
    generate_passcode(7, 6)
}

/// Generate a short out-of-band verification code (single digit group)
pub fn generate_temp_code() -> String {
    generate_passcode(1, 6)
}

/// Combine two code shares by per-digit addition modulo 10
///
/// Commutative by construction. The dash layout of both inputs must match
/// exactly; any mismatch in length or grouping is rejected.
///
/// # Errors
///
/// `InvalidArgument` when the code groups do not match.
pub fn combine_recovery_codes(a: &str, b: &str) -> AppResult<String> {
    if a.len() != b.len() {
        return Err(ApiError::invalid("Code groups do not match"));
    }
    let mut combined = String::with_capacity(a.len());
    for (ca, cb) in a.chars().zip(b.chars()) {
        match (ca.to_digit(10), cb.to_digit(10)) {
            (Some(da), Some(db)) => {
                combined.push(char::from_digit((da + db) % 10, 10).unwrap_or('0'));
            }
            (None, None) if ca == '-' && cb == '-' => combined.push('-'),
            _ => return Err(ApiError::invalid("Code groups do not match")),
        }
    }
    Ok(combined)
}

/// Mask a contact address for display in recovery responses
///
/// Keeps the first two characters of the local part and roughly the first
/// third of the domain label: `alice@example.net` becomes `al*@ex*****.net`.
/// Non-address strings pass through unchanged.
pub fn mask_contact(addr: &str) -> String {
    let Some((user, domain)) = addr.split_once('@') else {
        return addr.to_owned();
    };
    let Some((label, tld)) = domain.rsplit_once('.') else {
        return addr.to_owned();
    };
    let visible = label.len() / 3;
    let hidden = label.len() - visible;
    format!(
        "{}*@{}{}.{}",
        &user[..user.len().min(2)],
        &label[..visible],
        "*".repeat(hidden),
        tld
    )
}

/// Client-side state for one protected secret
///
/// `passcode_a` stays here; `passcode_b` lives at the recovery service.
/// The secret itself is sealed under the combined code, so this record is
/// safe to persist in the configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecoverableData {
    pub comment: String,
    pub passcode_a: String,
    /// Sealed secret (AES envelope under the combined passcode)
    pub encrypted_data: String,
    pub expires: i64,
    pub reset_code: String,
    pub recovery_id: i64,
    pub recovery_svc: String,
}

impl RecoverableData {
    /// Assemble the client record from a service registration response
    ///
    /// `registration` is the JSON the `register` endpoint returned for
    /// `passcode_b`. The secret is sealed under the per-digit combination
    /// of both shares; neither share alone can open it.
    pub fn assemble(
        secret_data: &[u8],
        hint: &str,
        passcode_a: &str,
        passcode_b: &str,
        recovery_svc: &str,
        registration: &serde_json::Value,
    ) -> AppResult<Self> {
        if !VALID_CODE_RE.is_match(passcode_a) {
            return Err(ApiError::invalid("Invalid passcode_a"));
        }
        let combined = combine_recovery_codes(passcode_a, passcode_b)?;
        let key = crate::crypto::aes::make_aes_key(combined.as_bytes());
        let nonces = crate::crypto::aes::NonceFactory::new();
        let encrypted_data = crate::crypto::aes::seal(&key, &nonces, secret_data)?;

        let field_i64 = |name: &str| {
            registration
                .get(name)
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| ApiError::invalid(format!("registration without '{name}'")))
        };
        let reset_code = registration
            .get("reset_code")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ApiError::invalid("registration without 'reset_code'"))?;

        Ok(Self {
            comment: hint.to_owned(),
            passcode_a: passcode_a.to_owned(),
            encrypted_data,
            expires: field_i64("expires")?,
            reset_code: reset_code.to_owned(),
            recovery_id: field_i64("id")?,
            recovery_svc: recovery_svc.to_owned(),
        })
    }

    /// Register a fresh secret with a recovery service
    ///
    /// Generates both passcode shares, hands `passcode_b` to the service
    /// and returns the persistable client record.
    pub async fn protect(
        svc: &crate::rpc::client::RpcClient,
        secret_data: &[u8],
        hint: &str,
        contacts: &[String],
    ) -> AppResult<Self> {
        let passcode_a = generate_recovery_code();
        let passcode_b = generate_recovery_code();
        let registration = svc
            .call(
                "recovery_svc/register",
                &serde_json::json!({
                    "hint": hint,
                    "passcode": passcode_b,
                    "contacts": contacts,
                }),
            )
            .await?;
        Self::assemble(
            secret_data,
            hint,
            &passcode_a,
            &passcode_b,
            svc.base_url(),
            &registration,
        )
    }

    /// Open the sealed secret with the share released by the service
    pub fn recover(&self, passcode_b: &str) -> AppResult<Vec<u8>> {
        let combined = combine_recovery_codes(&self.passcode_a, passcode_b)?;
        let key = crate::crypto::aes::make_aes_key(combined.as_bytes());
        crate::crypto::aes::open(&key, &self.encrypted_data)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        RecoverableData, VALID_CODE_RE, combine_recovery_codes, generate_recovery_code,
        mask_contact,
    };
    use crate::crypto::passphrase::generate_passcode;

    #[test]
    fn combine_is_commutative() {
        let a = generate_passcode(4, 4);
        let b = generate_passcode(4, 4);
        let ab = combine_recovery_codes(&a, &b).expect("shapes match");
        let ba = combine_recovery_codes(&b, &a).expect("shapes match");
        assert_eq!(ab, ba);
        assert!(VALID_CODE_RE.is_match(&ab));
    }

    #[test]
    fn mismatched_group_layout_is_rejected() {
        let a = generate_passcode(4, 4);
        let b = generate_passcode(4, 4);
        assert!(combine_recovery_codes(&a.replace('-', "0"), &b).is_err());
        assert!(combine_recovery_codes(&a, &b[1..]).is_err());
    }

    #[test]
    fn generated_codes_validate() {
        for _ in 0..16 {
            assert!(VALID_CODE_RE.is_match(&generate_recovery_code()));
        }
    }

    #[test]
    fn combine_known_digits() {
        assert_eq!(
            combine_recovery_codes("1111-22-3456", "4444-11-5555").expect("shapes match"),
            "5555-33-8901"
        );
    }

    #[test]
    fn recoverable_data_round_trip() {
        let a = generate_recovery_code();
        let b = generate_recovery_code();
        let registration = serde_json::json!({
            "id": 1234i64,
            "expires": 1_900_000_000i64,
            "reset_code": "1111-22-3456",
        });
        let record = RecoverableData::assemble(
            b"hello world",
            "A recovery test",
            &a,
            &b,
            "http://localhost/recovery/",
            &registration,
        )
        .expect("record assembles");

        assert_eq!(record.recovery_id, 1234);
        assert!(!record.encrypted_data.contains("hello"));
        assert_eq!(record.recover(&b).expect("recovers"), b"hello world");
        // The wrong share opens nothing
        assert!(record.recover(&generate_recovery_code()).is_err());
    }

    #[test]
    fn contact_masking_hides_most_of_the_address() {
        assert_eq!(mask_contact("bre@klaki.net"), "br*@k****.net");
        let masked = mask_contact("alice@example.net");
        assert!(masked.starts_with("al*@"));
        assert!(masked.ends_with(".net"));
        assert!(masked.contains('*'));
    }
}
