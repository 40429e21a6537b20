//! The sectioned, partially-encrypted configuration store
//!
//! `config.rc` is an ordered INI file. A value is either printable text,
//! an encoded compound value (`::J…`/`::B…`), or an in-place encrypted
//! value (`::E…`). Certain (section, option) patterns are always written
//! encrypted: master-key slots and stored account passwords.
//!
//! Unlocking is indirect: the passphrase is stretched with scrypt into a
//! "pass key" which decrypts a random "config key" stored in the secrets
//! section; the hashed config key is the active AES key. Rotating the
//! passphrase therefore re-encrypts only the config key, not every value.
//!
//! Master keys (for the metadata store and SQLite containers) live as
//! encrypted secrets, one per generation; decryption tries them all in
//! order, encryption uses the newest.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::crypto::aes::{NonceFactory, make_aes_key, open, seal};
use crate::crypto::passphrase::{generate_default_passcode, stretch_with_scrypt};
use crate::errors::{ApiError, AppResult};

/// Well-known section names
pub const GENERAL: &str = "App";
pub const SECRETS: &str = "Secrets";
pub const RECOVERY: &str = "Passcrow Recovery";
pub const SMTP_BRIDGE: &str = "SMTP Bridge Service";
pub const ACCESS_PREFIX: &str = "Access ";
pub const ACCOUNT_PREFIX: &str = "Account ";
pub const IDENTITY_PREFIX: &str = "Identity ";
pub const CONTEXT_PREFIX: &str = "Context ";
pub const CONTEXT_ZERO: &str = "Context 0";

const ALLOWED_SECTIONS: [&str; 4] = [GENERAL, SECRETS, RECOVERY, SMTP_BRIDGE];
const ALLOWED_PREFIXES: [&str; 4] = [
    ACCESS_PREFIX,
    ACCOUNT_PREFIX,
    IDENTITY_PREFIX,
    CONTEXT_PREFIX,
];

/// Marker announcing a config-key value decrypted with the right pass key
const CONF_KEY_MAGIC: &str = "CONF_KEY:";

/// Encrypted / encoded value marker
const MARKER: &str = "::";

const PREAMBLE: &str = "\
# This file was auto-generated by Nestmail.
#
# NOTE: Do not edit this file while Nestmail is running!
#       Also note that if you do edit it by hand, comments will be lost and
#       sections may get reordered when the app next saves its settings.
#
#############################################################################

";

/// A decoded configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ConfigValue {
    /// The text content, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    fn encode_plaintext(&self) -> String {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        match self {
            Self::Text(t) => format!("T:{t}"),
            Self::Bytes(b) => format!("B:{}", b64.encode(b)),
            Self::Json(j) => format!("J:{j}"),
        }
    }

    fn decode_plaintext(raw: &str) -> AppResult<Self> {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        match raw.split_once(':') {
            Some(("T", rest)) => Ok(Self::Text(rest.to_owned())),
            Some(("B", rest)) => Ok(Self::Bytes(
                b64.decode(rest)
                    .map_err(|e| ApiError::Integrity(format!("bad bytes value: {e}")))?,
            )),
            Some(("J", rest)) => Ok(Self::Json(serde_json::from_str(rest)?)),
            _ => Err(ApiError::Integrity("unknown value encoding".to_owned())),
        }
    }
}

#[derive(Default)]
struct Section {
    name: String,
    options: Vec<(String, String)>,
}

impl Section {
    fn get(&self, option: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == option)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, option: &str, value: String) {
        match self.options.iter_mut().find(|(k, _)| k == option) {
            Some((_, v)) => *v = value,
            None => self.options.push((option.to_owned(), value)),
        }
    }

    fn remove(&mut self, option: &str) -> bool {
        let before = self.options.len();
        self.options.retain(|(k, _)| k != option);
        self.options.len() != before
    }
}

/// The in-memory configuration state; access it through [`Config`]
pub struct ConfigStore {
    profile_dir: PathBuf,
    filepath: PathBuf,
    backups_dir: PathBuf,
    sections: Vec<Section>,
    /// Active AES key derived from the config key; None while locked
    aes_key: Option<[u8; 32]>,
    nonces: NonceFactory,
    keep_private: HashSet<String>,
    digits: Regex,
    dirty: bool,
    /// Token -> access section cache, rebuilt lazily, dropped on save
    token_cache: Option<std::collections::HashMap<String, String>>,
}

impl ConfigStore {
    fn new(profile_dir: &Path) -> AppResult<Self> {
        let filepath = profile_dir.join("config.rc");
        let backups_dir = profile_dir.join("backups");
        std::fs::create_dir_all(profile_dir)?;

        let mut store = Self {
            profile_dir: profile_dir.to_owned(),
            filepath,
            backups_dir,
            sections: Vec::new(),
            aes_key: None,
            nonces: NonceFactory::new(),
            keep_private: HashSet::from([
                format!("{SECRETS}/config_key"),
                format!("{SECRETS}/master_key"),
                format!("{SECRETS}/master_key_N"),
                format!("{ACCOUNT_PREFIX}N/mailbox_password"),
                format!("{ACCOUNT_PREFIX}N/sendmail_password"),
            ]),
            digits: Regex::new(r"\d+").expect("static regex compiles"),
            dirty: false,
            token_cache: None,
        };
        store.load()?;
        store.seed_initial_settings();

        // Insecure auto-unlock: honoured when configured, never silent
        if let Some(pass) = store.get_raw(SECRETS, "passphrase").map(str::to_owned) {
            warn!("auto-unlocking from cleartext Secrets/passphrase");
            match store.provide_passphrase(&pass) {
                Ok(()) => {
                    if store.get_raw(SECRETS, "master_key").is_none() {
                        store.generate_master_key("")?;
                    }
                }
                Err(err) => warn!(error = %err, "auto-unlock failed"),
            }
        }
        store.context_zero();
        store.access_zero();
        Ok(store)
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    fn seed_initial_settings(&mut self) {
        for (section, option, value) in [
            (GENERAL, "config_backups", "10"),
            (GENERAL, "default_cli_context", CONTEXT_ZERO),
            (GENERAL, "log_level", "info"),
        ] {
            if self.get_raw(section, option).is_none() {
                self.section_mut(section).set(option, value.to_owned());
                self.dirty = true;
            }
        }
    }

    /// The built-in context every install has
    fn context_zero(&mut self) {
        if self.get_raw(CONTEXT_ZERO, "name").is_none() {
            self.section_mut(CONTEXT_ZERO)
                .set("name", "My Mail".to_owned());
            self.dirty = true;
        }
    }

    /// The built-in local-access grant, owner of every context
    fn access_zero(&mut self) {
        let roles = self
            .sections
            .iter()
            .filter(|s| s.name.starts_with(CONTEXT_PREFIX))
            .map(|s| format!("{}:A", s.name))
            .collect::<Vec<_>>()
            .join(", ");
        let section = format!("{ACCESS_PREFIX}0");
        let current = self.get_raw(&section, "roles").map(str::to_owned);
        if self.get_raw(&section, "name").is_none() {
            self.section_mut(&section)
                .set("name", "Local access".to_owned());
            self.dirty = true;
        }
        if current.as_deref() != Some(&roles) {
            self.section_mut(&section).set("roles", roles);
            self.dirty = true;
        }
    }

    fn allowed_section(name: &str) -> bool {
        ALLOWED_SECTIONS.contains(&name)
            || ALLOWED_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        if let Some(pos) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[pos];
        }
        self.sections.push(Section {
            name: name.to_owned(),
            options: Vec::new(),
        });
        self.sections.last_mut().expect("just pushed")
    }

    /// All section names, in file order
    pub fn section_names(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.name.clone()).collect()
    }

    /// Option names within one section
    pub fn option_names(&self, section: &str) -> Vec<String> {
        self.sections
            .iter()
            .find(|s| s.name == section)
            .map(|s| s.options.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn token_cache_ref(
        &self,
    ) -> Option<&std::collections::HashMap<String, String>> {
        self.token_cache.as_ref()
    }

    pub(crate) fn set_token_cache(
        &mut self,
        cache: std::collections::HashMap<String, String>,
    ) {
        self.token_cache = Some(cache);
    }

    /// Logical key pattern with numeric parts normalized to `N`
    fn key_desc(&self, section: &str, option: &str) -> String {
        self.digits
            .replace_all(&format!("{section}/{option}"), "N")
            .into_owned()
    }

    /// Raw stored string, marker and all
    pub fn get_raw(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)
            .and_then(|s| s.get(option))
    }

    /// Decoded (and decrypted) value
    ///
    /// # Errors
    ///
    /// `Denied` with kind `need-passphrase` for an encrypted value while
    /// locked; `Integrity` when decryption fails.
    pub fn get(&self, section: &str, option: &str) -> AppResult<Option<ConfigValue>> {
        let Some(raw) = self.get_raw(section, option) else {
            return Ok(None);
        };
        let Some(encoded) = raw.strip_prefix(MARKER) else {
            return Ok(Some(ConfigValue::Text(raw.to_owned())));
        };
        let Some(split) = encoded.split_at_checked(1) else {
            return Err(ApiError::Integrity(format!(
                "bad marker value in {section}/{option}"
            )));
        };
        match split {
            ("E", sealed) => {
                let Some(key) = self.aes_key else {
                    return Err(ApiError::need_passphrase());
                };
                let plain = open(&key, sealed)?;
                ConfigValue::decode_plaintext(&String::from_utf8_lossy(&plain)).map(Some)
            }
            ("J", body) => Ok(Some(ConfigValue::Json(serde_json::from_str(body)?))),
            ("B", body) => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(body)
                    .map_err(|e| ApiError::Integrity(format!("bad bytes value: {e}")))?;
                Ok(Some(ConfigValue::Bytes(bytes)))
            }
            _ => Err(ApiError::Integrity(format!(
                "unknown value marker in {section}/{option}"
            ))),
        }
    }

    /// Decoded text value, for the common case
    pub fn get_text(&self, section: &str, option: &str) -> AppResult<Option<String>> {
        Ok(self.get(section, option)?.and_then(|v| match v {
            ConfigValue::Text(t) => Some(t),
            _ => None,
        }))
    }

    /// Store a value; keys in the private set are transparently encrypted
    pub fn set(&mut self, section: &str, option: &str, value: ConfigValue) -> AppResult<()> {
        if !Self::allowed_section(section) {
            return Err(ApiError::invalid(format!("unknown section '{section}'")));
        }
        if self.keep_private.contains(&self.key_desc(section, option)) {
            return self.set_private(section, option, value);
        }
        let encoded = match &value {
            ConfigValue::Text(t)
                if !t.starts_with(MARKER) && !t.contains('\r') && !t.contains('\0') =>
            {
                t.clone()
            }
            // Text that would collide with the marker syntax is stored
            // JSON-encoded instead of ambiguously
            ConfigValue::Text(t) => {
                format!("{MARKER}J{}", serde_json::Value::from(t.as_str()))
            }
            ConfigValue::Json(j) => format!("{MARKER}J{j}"),
            ConfigValue::Bytes(b) => {
                use base64::Engine;
                format!(
                    "{MARKER}B{}",
                    base64::engine::general_purpose::STANDARD.encode(b)
                )
            }
        };
        self.section_mut(section).set(option, encoded);
        self.dirty = true;
        Ok(())
    }

    /// Store a value encrypted in place, remembering the key as private
    pub fn set_private(
        &mut self,
        section: &str,
        option: &str,
        value: ConfigValue,
    ) -> AppResult<()> {
        if !Self::allowed_section(section) {
            return Err(ApiError::invalid(format!("unknown section '{section}'")));
        }
        let desc = self.key_desc(section, option);
        self.keep_private.insert(desc);
        let Some(key) = self.aes_key else {
            return Err(ApiError::need_passphrase());
        };
        let sealed = seal(&key, &self.nonces, value.encode_plaintext().as_bytes())?;
        self.section_mut(section)
            .set(option, format!("{MARKER}E{sealed}"));
        self.dirty = true;
        Ok(())
    }

    /// Delete an option; empty sections disappear on save
    pub fn delete(&mut self, section: &str, option: &str) -> AppResult<bool> {
        let removed = self
            .sections
            .iter_mut()
            .find(|s| s.name == section)
            .is_some_and(|s| s.remove(option));
        if removed {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// True once a master key exists
    pub fn has_crypto_enabled(&self) -> bool {
        self.get_raw(SECRETS, "master_key").is_some()
    }

    /// True once the passphrase has been provided this session
    pub fn is_unlocked(&self) -> bool {
        self.aes_key.is_some()
    }

    /// Unlock with a passphrase (or set one, on first use)
    ///
    /// # Errors
    ///
    /// `Denied` when the passphrase does not decrypt the stored config key.
    pub fn provide_passphrase(&mut self, passphrase: &str) -> AppResult<()> {
        let stretched = stretch_with_scrypt(passphrase.as_bytes(), b"config")?;
        let pass_key = make_aes_key(stretched.as_bytes());

        let config_key = match self.get_raw(SECRETS, "config_key") {
            None => {
                // First unlock: mint and store a fresh config key
                let config_key = format!("{CONF_KEY_MAGIC}{}", generate_default_passcode());
                let previous = self.aes_key;
                self.aes_key = Some(pass_key);
                let result =
                    self.set_private(SECRETS, "config_key", ConfigValue::Text(config_key.clone()));
                self.aes_key = previous;
                result?;
                config_key
            }
            Some(raw) => {
                let sealed = raw
                    .strip_prefix(MARKER)
                    .and_then(|r| r.strip_prefix('E'))
                    .ok_or_else(|| ApiError::Integrity("config_key is not encrypted".to_owned()))?;
                let plain = open(&pass_key, sealed).map_err(|_| ApiError::Denied {
                    kind: "bad-passphrase".to_owned(),
                    message: "Incorrect Passphrase".to_owned(),
                })?;
                let value = ConfigValue::decode_plaintext(&String::from_utf8_lossy(&plain))
                    .map_err(|_| ApiError::Denied {
                        kind: "bad-passphrase".to_owned(),
                        message: "Incorrect Passphrase".to_owned(),
                    })?;
                match value {
                    ConfigValue::Text(t) if t.starts_with(CONF_KEY_MAGIC) => t,
                    _ => {
                        return Err(ApiError::Denied {
                            kind: "bad-passphrase".to_owned(),
                            message: "Incorrect Passphrase".to_owned(),
                        });
                    }
                }
            }
        };

        let aes_key = make_aes_key(config_key.as_bytes());
        if let Some(existing) = self.aes_key {
            if existing != aes_key {
                return Err(ApiError::Denied {
                    kind: "key-conflict".to_owned(),
                    message: "A different AES key is already active".to_owned(),
                });
            }
        }
        self.aes_key = Some(aes_key);
        info!("configuration unlocked");
        Ok(())
    }

    /// Generate the master key for a suffix (`""` or `"_N"`)
    ///
    /// Refuses to overwrite an existing generation.
    pub fn generate_master_key(&mut self, suffix: &str) -> AppResult<()> {
        if self.aes_key.is_none() {
            return Err(ApiError::Denied {
                kind: "need-passphrase".to_owned(),
                message: "Refusing to set a master key without a passphrase".to_owned(),
            });
        }
        let slot = format!("master_key{suffix}");
        if self.get_raw(SECRETS, &slot).is_some() {
            return Err(ApiError::Denied {
                kind: "exists".to_owned(),
                message: "Cravenly refusing to overwrite master key".to_owned(),
            });
        }
        self.set_private(
            SECRETS,
            &slot,
            ConfigValue::Text(generate_default_passcode()),
        )?;
        let now = chrono::Utc::now().timestamp().to_string();
        self.section_mut(SECRETS).set("last_key_rotation", now);
        self.dirty = true;
        Ok(())
    }

    /// Append a fresh master-key generation
    pub fn change_master_key(&mut self) -> AppResult<bool> {
        for n in 1..1000 {
            let slot = format!("master_key_{n}");
            if self.get_raw(SECRETS, &slot).is_none() {
                self.generate_master_key(&format!("_{n}"))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// All master-key generations as AES keys, oldest first
    ///
    /// # Errors
    ///
    /// `NotFound` before the first master key exists; `Denied` while locked.
    pub fn get_aes_keys(&self) -> AppResult<Vec<[u8; 32]>> {
        let mut keys = Vec::new();
        let first = self
            .get(SECRETS, "master_key")?
            .ok_or_else(|| ApiError::NotFound("Master key is unset".to_owned()))?;
        let Some(text) = first.as_text() else {
            return Err(ApiError::Integrity("master key is not text".to_owned()));
        };
        keys.push(make_aes_key(text.as_bytes()));
        for n in 1..1000 {
            match self.get(SECRETS, &format!("master_key_{n}"))? {
                Some(value) => match value.as_text() {
                    Some(text) => keys.push(make_aes_key(text.as_bytes())),
                    None => break,
                },
                None => break,
            }
        }
        Ok(keys)
    }

    /// Rotate the passphrase, re-encrypting every private value
    ///
    /// The master keys themselves do not change, so nothing outside the
    /// config file needs rewriting.
    pub fn change_config_key(&mut self, new_passphrase: &str) -> AppResult<()> {
        let old_key = self.aes_key.take();
        self.delete(SECRETS, "config_key")?;
        self.provide_passphrase(new_passphrase)?;

        if let Some(stored) = self.get_raw(SECRETS, "passphrase").map(str::to_owned) {
            if stored != new_passphrase {
                self.delete(SECRETS, "passphrase")?;
            }
        }

        let Some(old_key) = old_key else {
            return Ok(());
        };

        // Walk every encrypted value and re-seal it under the new key
        let mut encrypted = Vec::new();
        for section in &self.sections {
            for (option, value) in &section.options {
                if section.name == SECRETS && option == "config_key" {
                    continue;
                }
                if value.starts_with(&format!("{MARKER}E")) {
                    encrypted.push((section.name.clone(), option.clone()));
                }
            }
        }
        for (section, option) in encrypted {
            let raw = self
                .get_raw(&section, &option)
                .ok_or_else(|| ApiError::internal("re-encryption target vanished"))?
                .to_owned();
            let sealed = raw
                .strip_prefix(MARKER)
                .and_then(|r| r.strip_prefix('E'))
                .ok_or_else(|| ApiError::internal("re-encryption target changed shape"))?;
            let plain = open(&old_key, sealed)?;
            let value = ConfigValue::decode_plaintext(&String::from_utf8_lossy(&plain))?;
            self.set_private(&section, &option, value)?;
        }
        Ok(())
    }

    // -- persistence ------------------------------------------------------

    fn load(&mut self) -> AppResult<()> {
        let Ok(text) = std::fs::read_to_string(&self.filepath) else {
            return Ok(());
        };
        let mut sections: Vec<Section> = Vec::new();
        for line in text.lines() {
            if line.trim_start().starts_with('#') || line.trim().is_empty() {
                continue;
            }
            if let Some(name) = line
                .trim()
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
            {
                sections.push(Section {
                    name: name.to_owned(),
                    options: Vec::new(),
                });
                continue;
            }
            if line.starts_with([' ', '\t']) {
                // Continuation of the previous value
                if let Some((_, value)) = sections
                    .last_mut()
                    .and_then(|s| s.options.last_mut())
                {
                    value.push('\n');
                    value.push_str(line.trim_start());
                }
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if let Some(section) = sections.last_mut() {
                    section
                        .options
                        .push((key.trim().to_owned(), value.trim_start().to_owned()));
                }
            }
        }
        self.sections = sections;
        Ok(())
    }

    /// Serialize, rotate backups and write `config.rc` (mode 0600)
    pub fn save(&mut self) -> AppResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.token_cache = None;

        // Known sections first in fixed order, then prefixed sections by name
        self.sections.retain(|s| !s.options.is_empty());
        self.sections.sort_by_key(|s| {
            match ALLOWED_SECTIONS.iter().position(|k| *k == s.name) {
                Some(pos) => (0, pos, s.name.clone()),
                None => (1, 0, sort_key(&s.name)),
            }
        });

        let mut out = String::from(PREAMBLE);
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            let mut options = section.options.clone();
            options.sort_by_key(|(k, _)| sort_key(k));
            for (key, value) in options {
                let folded = value.replace('\n', "\n\t");
                out.push_str(&format!("{key} = {folded}\n"));
            }
            out.push('\n');
        }

        self.rotate();

        let tmp = self.filepath.with_extension("rc.tmp");
        std::fs::write(&tmp, out)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.filepath)?;
        self.dirty = false;
        debug!(path = %self.filepath.display(), "configuration saved");
        Ok(())
    }

    /// Rotate the previous config file into the backup directory
    ///
    /// Geometric age schedule: slot `i` keeps a snapshot at least
    /// `min(prev + 24h, 300 * 2^i)` seconds old. Best-effort only; a
    /// failed rotation never blocks the save.
    fn rotate(&mut self) {
        if !self.filepath.exists() {
            return;
        }
        if std::fs::create_dir_all(&self.backups_dir).is_err() {
            return;
        }
        let count: i32 = self
            .get_raw(GENERAL, "config_backups")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let fudge = 300i64;
        let mut last_min_age = 0i64;
        let mut min_ages = Vec::new();
        for i in 0..=count {
            let min_age = (last_min_age + 24 * 3600).min(fudge * 2i64.pow(i as u32));
            min_ages.push(min_age);
            last_min_age = min_age;
        }
        for i in (0..=count).rev() {
            let dest = self.backups_dir.join(format!("config.rc.{:02}", i + 1));
            let src = if i > 0 {
                self.backups_dir.join(format!("config.rc.{i:02}"))
            } else {
                self.filepath.clone()
            };
            if !src.exists() {
                continue;
            }
            let min_age = min_ages[i as usize];
            if dest.exists() {
                let age = std::fs::metadata(&dest)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if age > min_age {
                    let _ = std::fs::remove_file(&dest);
                }
            }
            if !dest.exists() {
                let _ = std::fs::rename(&src, &dest);
            }
        }
    }
}

/// Digit-aware sort key: numeric runs compare numerically
fn sort_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 8);
    let mut digits = String::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if !digits.is_empty() {
                key.push_str(&format!("{:0>8}", digits));
                digits.clear();
            }
            key.push(c);
        }
    }
    if !digits.is_empty() {
        key.push_str(&format!("{:0>8}", digits));
    }
    key
}

/// Shared handle to the configuration store
///
/// The store is the only mutable state shared across RPC handlers, so
/// every access goes through this lock. [`Config::with`] runs a closure as
/// one transaction and saves once at the end if anything changed; that is
/// the Rust rendering of nested save-suppressing config blocks.
#[derive(Clone)]
pub struct Config {
    inner: Arc<Mutex<ConfigStore>>,
}

impl Config {
    /// Open (or create) the configuration under a profile directory
    pub fn open(profile_dir: &Path) -> AppResult<Self> {
        let store = ConfigStore::new(profile_dir)?;
        let config = Self {
            inner: Arc::new(Mutex::new(store)),
        };
        config.with(|_| Ok(()))?; // persist seeded defaults
        Ok(config)
    }

    /// Run a transaction; saves on success if the store became dirty
    pub fn with<T>(&self, f: impl FnOnce(&mut ConfigStore) -> AppResult<T>) -> AppResult<T> {
        let mut store = self.inner.lock();
        let result = f(&mut store)?;
        store.save()?;
        Ok(result)
    }

    /// Read-only access without triggering a save
    pub fn read<T>(&self, f: impl FnOnce(&ConfigStore) -> T) -> T {
        f(&self.inner.lock())
    }

    /// Raw guard for call sites that manage save timing themselves
    pub fn lock(&self) -> MutexGuard<'_, ConfigStore> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Config, ConfigValue, GENERAL, SECRETS};

    fn temp_profile(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-cfg-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn values_round_trip_through_save_and_reload() {
        let dir = temp_profile("roundtrip");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.set(GENERAL, "plain", ConfigValue::Text("hello".to_owned()))?;
                store.set(
                    GENERAL,
                    "listy",
                    ConfigValue::Json(serde_json::json!(["a", "b", 3])),
                )?;
                store.set(
                    GENERAL,
                    "dicty",
                    ConfigValue::Json(serde_json::json!({"k": "v"})),
                )?;
                store.set(GENERAL, "bin", ConfigValue::Bytes(vec![0, 1, 2, 255]))
            })
            .expect("writes succeed");

        let reloaded = Config::open(&dir).expect("reopen succeeds");
        reloaded.read(|store| {
            assert_eq!(
                store.get(GENERAL, "plain").expect("get succeeds"),
                Some(ConfigValue::Text("hello".to_owned()))
            );
            assert_eq!(
                store.get(GENERAL, "listy").expect("get succeeds"),
                Some(ConfigValue::Json(serde_json::json!(["a", "b", 3])))
            );
            assert_eq!(
                store.get(GENERAL, "dicty").expect("get succeeds"),
                Some(ConfigValue::Json(serde_json::json!({"k": "v"})))
            );
            assert_eq!(
                store.get(GENERAL, "bin").expect("get succeeds"),
                Some(ConfigValue::Bytes(vec![0, 1, 2, 255]))
            );
        });
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn passphrase_unlock_and_mismatch() {
        let dir = temp_profile("unlock");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.provide_passphrase("Hello world, this is my passphrase")?;
                store.provide_passphrase("Hello world, this is my passphrase")
            })
            .expect("unlock succeeds twice");

        let reloaded = Config::open(&dir).expect("reopen succeeds");
        let err = reloaded
            .with(|store| store.provide_passphrase("Bogus"))
            .expect_err("wrong passphrase fails");
        assert_eq!(err.kind(), "permission-denied");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn encrypted_values_never_hit_disk_in_clear() {
        let dir = temp_profile("private");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.provide_passphrase("a passphrase")?;
                store.set(
                    "Account 1",
                    "mailbox_password",
                    ConfigValue::Text("very secret password".to_owned()),
                )
            })
            .expect("write succeeds");

        let on_disk = std::fs::read_to_string(dir.join("config.rc")).expect("file exists");
        assert!(!on_disk.contains("very secret password"));
        assert!(on_disk.contains("mailbox_password = ::E"));

        // Readable after reload + unlock; denied while locked
        let reloaded = Config::open(&dir).expect("reopen succeeds");
        let locked = reloaded.read(|store| {
            store
                .get("Account 1", "mailbox_password")
                .expect_err("locked read fails")
                .kind()
                .to_owned()
        });
        assert_eq!(locked, "permission-denied");
        reloaded
            .with(|store| {
                store.provide_passphrase("a passphrase")?;
                assert_eq!(
                    store.get("Account 1", "mailbox_password")?,
                    Some(ConfigValue::Text("very secret password".to_owned()))
                );
                Ok(())
            })
            .expect("unlocked read succeeds");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn master_key_rotation_preserves_decryption() {
        let dir = temp_profile("rotation");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.provide_passphrase("pass one")?;
                store.generate_master_key("")?;
                assert_eq!(store.get_aes_keys()?.len(), 1);
                store.set_private(
                    SECRETS,
                    "treasure",
                    ConfigValue::Text("buried gold".to_owned()),
                )?;
                assert!(store.change_master_key()?);
                assert_eq!(store.get_aes_keys()?.len(), 2);
                assert_eq!(
                    store.get(SECRETS, "treasure")?,
                    Some(ConfigValue::Text("buried gold".to_owned()))
                );
                Ok(())
            })
            .expect("rotation preserves values");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn passphrase_rotation_keeps_master_keys() {
        let dir = temp_profile("rekey");
        let config = Config::open(&dir).expect("open succeeds");
        let old_keys = config
            .with(|store| {
                store.provide_passphrase("old passphrase")?;
                store.generate_master_key("")?;
                store.change_master_key()?;
                store.get_aes_keys()
            })
            .expect("setup succeeds");
        assert_eq!(old_keys.len(), 2);

        config
            .with(|store| store.change_config_key("this is my new passphrase"))
            .expect("rekey succeeds");

        let reloaded = Config::open(&dir).expect("reopen succeeds");
        let new_keys = reloaded
            .with(|store| {
                store.provide_passphrase("this is my new passphrase")?;
                store.get_aes_keys()
            })
            .expect("unlock with new passphrase");
        assert_eq!(old_keys, new_keys);

        let err = Config::open(&dir)
            .expect("reopen succeeds")
            .with(|store| store.provide_passphrase("old passphrase"))
            .expect_err("old passphrase is dead");
        assert_eq!(err.kind(), "permission-denied");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn backups_rotate_on_save() {
        let dir = temp_profile("backups");
        let config = Config::open(&dir).expect("open succeeds");
        for i in 0..3 {
            config
                .with(|store| {
                    store.set(
                        GENERAL,
                        "counter",
                        ConfigValue::Text(i.to_string()),
                    )
                })
                .expect("write succeeds");
        }
        assert!(dir.join("backups").join("config.rc.01").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn sections_are_ordered_known_first() {
        let dir = temp_profile("ordering");
        let config = Config::open(&dir).expect("open succeeds");
        config
            .with(|store| {
                store.set("Identity 2", "name", ConfigValue::Text("Two".to_owned()))?;
                store.set("Identity 10", "name", ConfigValue::Text("Ten".to_owned()))?;
                store.set(GENERAL, "zzz", ConfigValue::Text("last".to_owned()))
            })
            .expect("writes succeed");
        let text = std::fs::read_to_string(dir.join("config.rc")).expect("file exists");
        let app = text.find("[App]").expect("App section present");
        let id2 = text.find("[Identity 2]").expect("Identity 2 present");
        let id10 = text.find("[Identity 10]").expect("Identity 10 present");
        assert!(app < id2, "known sections come first");
        assert!(id2 < id10, "numeric ordering, not lexicographic");
        let _ = std::fs::remove_dir_all(dir);
    }
}
