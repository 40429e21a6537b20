//! Local mailbox container formats and the import pipeline
//!
//! Readable containers: `maildir` (standard `cur/`/`new/`/`tmp/`),
//! `wervd` (maildir with per-message AES-encrypted content, detected by
//! the presence of `wervd.ver`), `mbox` (From-line separated), and
//! `mailzip` (a ZIP of raw messages). Every yielded message carries a
//! [`MailboxPointer`] that stays stable across runs.
//!
//! The import pipeline parses each raw message's headers into the
//! canonical [`Metadata`] record and feeds the metadata store.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use mailparse::{MailHeaderMap, parse_mail};
use sha1::Digest;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::metadata::{MailboxPointer, Metadata, MetadataStore, msgid_hash};
use crate::crypto::aes::open_any;
use crate::errors::{ApiError, AppResult};

/// Marker at offset 0 of every encrypted wervd message file
const WERVD_MARKER: &[u8] = b"WERVD1\n";
/// Version file whose presence marks a maildir as wervd
const WERVD_VERSION_FILE: &str = "wervd.ver";

/// Longest snippet kept in a metadata record
const SNIPPET_MAX_CHARS: usize = 160;

/// Storage-format tag of a local container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxFormat {
    Maildir,
    Wervd,
    Mbox,
    Mailzip,
}

impl MailboxFormat {
    /// Pointer storage tag for this format
    pub fn tag(self) -> &'static str {
        match self {
            Self::Maildir => "md",
            Self::Wervd => "wervd",
            Self::Mbox => "mbox",
            Self::Mailzip => "mailzip",
        }
    }

    /// Detect the container format of a local path
    pub fn detect(path: &Path) -> AppResult<Self> {
        if path.is_dir() {
            if path.join(WERVD_VERSION_FILE).exists() {
                return Ok(Self::Wervd);
            }
            if path.join("cur").is_dir() && path.join("new").is_dir() {
                return Ok(Self::Maildir);
            }
            return Err(ApiError::invalid(format!(
                "{} is neither a maildir nor a wervd mailbox",
                path.display()
            )));
        }
        if path.is_file() {
            if path.extension().and_then(|e| e.to_str()) == Some("zip") {
                return Ok(Self::Mailzip);
            }
            return Ok(Self::Mbox);
        }
        Err(ApiError::NotFound(format!("no mailbox at {}", path.display())))
    }
}

/// Read every message from a local container
///
/// `keys` are the master key generations, needed only for wervd content.
pub fn read_mailbox(
    path: &Path,
    keys: &[[u8; 32]],
) -> AppResult<Vec<(MailboxPointer, Vec<u8>)>> {
    let format = MailboxFormat::detect(path)?;
    match format {
        MailboxFormat::Maildir => read_maildir(path, MailboxFormat::Maildir, keys),
        MailboxFormat::Wervd => read_maildir(path, MailboxFormat::Wervd, keys),
        MailboxFormat::Mbox => read_mbox(path),
        MailboxFormat::Mailzip => read_mailzip(path),
    }
}

fn read_maildir(
    path: &Path,
    format: MailboxFormat,
    keys: &[[u8; 32]],
) -> AppResult<Vec<(MailboxPointer, Vec<u8>)>> {
    let mut messages = Vec::new();
    for sub in ["cur", "new"] {
        let dir = path.join(sub);
        if !dir.is_dir() {
            continue;
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .collect();
        names.sort();
        for name in names {
            let raw = std::fs::read(dir.join(&name))?;
            let body = if format == MailboxFormat::Wervd {
                match decrypt_wervd(&raw, keys) {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(file = name, error = %err, "skipping undecryptable message");
                        continue;
                    }
                }
            } else {
                raw
            };
            messages.push((
                MailboxPointer {
                    storage: format.tag().to_owned(),
                    container: path.display().to_string(),
                    offset: format!("{sub}/{name}"),
                },
                body,
            ));
        }
    }
    Ok(messages)
}

/// Unwrap one wervd message file
///
/// # Errors
///
/// `Integrity` when the marker is present but no key opens the payload;
/// `InvalidArgument` when the marker is missing entirely.
fn decrypt_wervd(raw: &[u8], keys: &[[u8; 32]]) -> AppResult<Vec<u8>> {
    let Some(payload) = raw.strip_prefix(WERVD_MARKER) else {
        return Err(ApiError::invalid("missing wervd content marker"));
    };
    if keys.is_empty() {
        return Err(ApiError::need_passphrase());
    }
    open_any(keys, &String::from_utf8_lossy(payload))
}

fn read_mbox(path: &Path) -> AppResult<Vec<(MailboxPointer, Vec<u8>)>> {
    let data = std::fs::read(path)?;
    let mut messages = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0usize;

    for line in data.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b"From ") {
            if let Some(begin) = start {
                messages.push((begin, offset));
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }
    if let Some(begin) = start {
        messages.push((begin, data.len()));
    }

    Ok(messages
        .into_iter()
        .map(|(begin, end)| {
            (
                MailboxPointer {
                    storage: MailboxFormat::Mbox.tag().to_owned(),
                    container: path.display().to_string(),
                    offset: begin.to_string(),
                },
                data[begin..end].to_vec(),
            )
        })
        .collect())
}

fn read_mailzip(path: &Path) -> AppResult<Vec<(MailboxPointer, Vec<u8>)>> {
    let mut archive = ZipArchive::new(File::open(path)?)
        .map_err(|e| ApiError::invalid(format!("bad mailzip archive: {e}")))?;
    let mut messages = Vec::new();
    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .map_err(|e| ApiError::invalid(format!("bad mailzip member: {e}")))?;
        if member.is_dir() {
            continue;
        }
        let name = member.name().to_owned();
        let mut body = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut body)?;
        messages.push((
            MailboxPointer {
                storage: MailboxFormat::Mailzip.tag().to_owned(),
                container: path.display().to_string(),
                offset: name,
            },
            body,
        ));
    }
    Ok(messages)
}

/// Load one raw message back through its pointer
///
/// Used when a client asks for message text or raw data; only local
/// container formats resolve here (IMAP pointers need a live session).
pub fn load_raw(pointer: &MailboxPointer, keys: &[[u8; 32]]) -> AppResult<Vec<u8>> {
    let container = Path::new(&pointer.container);
    match pointer.storage.as_str() {
        "md" => Ok(std::fs::read(container.join(&pointer.offset))?),
        "wervd" => {
            let raw = std::fs::read(container.join(&pointer.offset))?;
            decrypt_wervd(&raw, keys)
        }
        "mbox" => {
            let offset: usize = pointer
                .offset
                .parse()
                .map_err(|_| ApiError::invalid("bad mbox offset"))?;
            let data = std::fs::read(container)?;
            if offset >= data.len() {
                return Err(ApiError::NotFound(format!(
                    "offset {offset} beyond mbox end"
                )));
            }
            let end = data[offset..]
                .windows(6)
                .position(|w| w == b"\nFrom ")
                .map_or(data.len(), |p| offset + p + 1);
            Ok(data[offset..end].to_vec())
        }
        "mailzip" => {
            let mut archive = ZipArchive::new(File::open(container)?)
                .map_err(|e| ApiError::invalid(format!("bad mailzip archive: {e}")))?;
            let mut member = archive
                .by_name(&pointer.offset)
                .map_err(|_| ApiError::NotFound(format!("no member {}", pointer.offset)))?;
            let mut body = Vec::new();
            member.read_to_end(&mut body)?;
            Ok(body)
        }
        other => Err(ApiError::invalid(format!(
            "cannot load '{other}' pointers locally"
        ))),
    }
}

/// Parse a raw message's headers into a metadata record
///
/// Full MIME decoding is a collaborator's job; this extracts the header
/// set the index needs plus a snippet from the first readable body part.
/// Messages without a Message-Id get a synthetic one derived from their
/// content so re-imports stay idempotent.
pub fn parse_message(raw: &[u8], pointer: MailboxPointer) -> AppResult<Metadata> {
    let parsed = parse_mail(raw)
        .map_err(|e| ApiError::invalid(format!("unparsable message: {e}")))?;
    let headers = parsed.get_headers();

    let message_id = match headers.get_first_value("Message-Id") {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            let digest = sha1::Sha1::digest(raw);
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            format!("<{hex}@missing-id>")
        }
    };

    let timestamp = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .unwrap_or(0);

    let thread_parent = headers
        .get_first_value("References")
        .and_then(|refs| refs.split_whitespace().next_back().map(str::to_owned))
        .or_else(|| headers.get_first_value("In-Reply-To"));
    let thread_id = thread_parent
        .map(|parent| msgid_hash(&parent))
        .unwrap_or_else(|| msgid_hash(&message_id));

    let split_addrs = |value: Option<String>| -> Vec<String> {
        value
            .map(|v| {
                v.split(',')
                    .map(|a| a.trim().to_owned())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(Metadata {
        message_id,
        thread_id,
        timestamp,
        size: raw.len() as u64,
        from: headers.get_first_value("From").unwrap_or_default(),
        to: split_addrs(headers.get_first_value("To")),
        cc: split_addrs(headers.get_first_value("Cc")),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        snippet: extract_snippet(&parsed),
        tags: BTreeSet::new(),
        pointers: vec![pointer],
    })
}

/// Best-effort snippet from the first text part
fn extract_snippet(parsed: &mailparse::ParsedMail<'_>) -> String {
    fn first_text(part: &mailparse::ParsedMail<'_>) -> Option<String> {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        if ctype == "text/plain" {
            return part.get_body().ok();
        }
        if ctype == "text/html" {
            let body = part.get_body().ok()?;
            return html2text::from_read(body.as_bytes(), 78).ok();
        }
        for sub in &part.subparts {
            if let Some(text) = first_text(sub) {
                return Some(text);
            }
        }
        None
    }

    let text = first_text(parsed).unwrap_or_default();
    let mut snippet: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_MAX_CHARS)
        .collect();
    snippet.truncate(snippet.trim_end().len());
    snippet
}

/// Read, parse and index a whole container; returns the new record keys
pub fn import_mailbox(
    store: &mut MetadataStore,
    path: &Path,
    initial_tags: &[String],
    keys: &[[u8; 32]],
) -> AppResult<Vec<String>> {
    let mut indexed = Vec::new();
    for (pointer, raw) in read_mailbox(path, keys)? {
        let mut meta = match parse_message(&raw, pointer) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, "skipping unparsable message");
                continue;
            }
        };
        for tag in initial_tags {
            meta.tags.insert(format!("in:{}", tag.to_lowercase()));
        }
        indexed.push(store.add(meta)?);
    }
    debug!(path = %path.display(), count = indexed.len(), "imported mailbox");
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{MailboxFormat, import_mailbox, parse_message, read_mailbox};
    use crate::storage::metadata::{MailboxPointer, MetadataStore};

    const RAW_MSG: &[u8] = b"Message-Id: <one@example.org>\r\n\
Date: Wed, 1 Sep 2021 00:03:01 GMT\r\n\
From: Bjarni <bre@example.org>\r\n\
To: \"Some One\" <someone@example.org>\r\n\
Subject: Hello world\r\n\
\r\n\
This is great mail content for testing.\r\n";

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-mbx-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("temp dir created");
        dir
    }

    fn make_maildir(dir: &PathBuf, count: usize) {
        for sub in ["cur", "new", "tmp"] {
            std::fs::create_dir_all(dir.join(sub)).expect("maildir subdirs");
        }
        for i in 0..count {
            let body = String::from_utf8_lossy(RAW_MSG)
                .replace("one@example.org", &format!("msg-{i}@example.org"));
            std::fs::write(dir.join("cur").join(format!("msg{i}:2,S")), body)
                .expect("message written");
        }
    }

    fn pointer() -> MailboxPointer {
        MailboxPointer {
            storage: "md".to_owned(),
            container: "/tmp/mb".to_owned(),
            offset: "cur/x".to_owned(),
        }
    }

    #[test]
    fn detects_formats() {
        let dir = temp_dir("detect");
        make_maildir(&dir, 0);
        assert_eq!(
            MailboxFormat::detect(&dir).expect("detects"),
            MailboxFormat::Maildir
        );
        std::fs::write(dir.join("wervd.ver"), "1").expect("marker written");
        assert_eq!(
            MailboxFormat::detect(&dir).expect("detects"),
            MailboxFormat::Wervd
        );
        let mbox = dir.join("inbox.mbox");
        std::fs::write(&mbox, "From a@b Thu Jan  1 00:00:00 1970\n").expect("mbox written");
        assert_eq!(
            MailboxFormat::detect(&mbox).expect("detects"),
            MailboxFormat::Mbox
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn parses_headers_into_metadata() {
        let meta = parse_message(RAW_MSG, pointer()).expect("parses");
        assert_eq!(meta.message_id, "<one@example.org>");
        assert_eq!(meta.subject, "Hello world");
        assert!(meta.from.contains("bre@example.org"));
        assert_eq!(meta.to.len(), 1);
        assert!(meta.timestamp > 1_630_000_000);
        assert!(meta.snippet.contains("great mail content"));
        assert_eq!(meta.size, RAW_MSG.len() as u64);
    }

    #[test]
    fn missing_message_id_is_synthesized_stably() {
        let raw = b"Subject: no id here\r\n\r\nBody\r\n";
        let a = parse_message(raw, pointer()).expect("parses");
        let b = parse_message(raw, pointer()).expect("parses");
        assert_eq!(a.message_id, b.message_id);
        assert!(a.message_id.contains("@missing-id"));
    }

    #[test]
    fn mbox_splitting_finds_every_message() {
        let dir = temp_dir("mbox");
        let path = dir.join("three.mbox");
        let mut data = Vec::new();
        for i in 0..3 {
            data.extend_from_slice(b"From someone Thu Jan  1 00:00:00 1970\n");
            data.extend_from_slice(
                format!("Message-Id: <m{i}@x>\nSubject: msg {i}\n\nbody {i}\n").as_bytes(),
            );
        }
        std::fs::write(&path, &data).expect("mbox written");

        let messages = read_mailbox(&path, &[]).expect("reads");
        assert_eq!(messages.len(), 3);
        assert!(messages[1].1.starts_with(b"Message-Id: <m1@x>"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn wervd_content_decrypts_with_the_master_key() {
        use crate::crypto::aes::{NonceFactory, make_aes_key, seal};

        let dir = temp_dir("wervd");
        for sub in ["cur", "new", "tmp"] {
            std::fs::create_dir_all(dir.join(sub)).expect("maildir subdirs");
        }
        std::fs::write(dir.join("wervd.ver"), "1").expect("marker written");

        let key = make_aes_key(b"master");
        let nonces = NonceFactory::new();
        let sealed = seal(&key, &nonces, RAW_MSG).expect("seal succeeds");
        let mut file = b"WERVD1\n".to_vec();
        file.extend_from_slice(sealed.as_bytes());
        std::fs::write(dir.join("cur").join("m0:2,S"), file).expect("message written");

        let messages = read_mailbox(&dir, &[key]).expect("reads");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.storage, "wervd");
        assert_eq!(messages[0].1, RAW_MSG);

        // Without keys the message is skipped rather than crashing the run
        let locked = read_mailbox(&dir, &[]).expect("reads");
        assert!(locked.is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn maildir_import_indexes_three_messages() {
        let dir = temp_dir("import");
        make_maildir(&dir, 3);
        let store_dir = temp_dir("import-store");
        let mut store =
            MetadataStore::open(&store_dir, "metadata", Vec::new()).expect("open succeeds");

        let keys = import_mailbox(&mut store, &dir, &["inbox".to_owned()], &[])
            .expect("import succeeds");
        assert_eq!(keys.len(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.counts(&["*".to_owned()], &[])["*"], 3);
        assert_eq!(store.search_keys("in:inbox", &[]).len(), 3);

        // Importing again does not duplicate
        import_mailbox(&mut store, &dir, &[], &[]).expect("re-import succeeds");
        assert_eq!(store.len(), 3);

        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(store_dir);
    }
}
