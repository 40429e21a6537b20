//! IMAP connection broker and command sequencer
//!
//! Connects with a protocol hint (`auto`, `imaps`, `imap+starttls`,
//! `imap`), authenticates, and runs tagged commands with timeout-bounded
//! reads. `auto` attempts TLS on 993 and then STARTTLS on 143; an
//! explicitly requested TLS upgrade that fails is an error, never a
//! silent downgrade.
//!
//! Untagged response lines are gathered into chunk groups (literals become
//! their own chunks) and handed to the response tokenizer.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::parser::{ImapValue, imap_dict, parse_imap};
use crate::errors::{ApiError, AppResult};

/// Header set requested for metadata fetches
pub const METADATA_HEADERS: &str =
    "DATE FROM TO CC SUBJECT MESSAGE-ID REFERENCES IN-REPLY-TO LIST-ID";

/// How to secure the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapProtocol {
    /// Try `imaps` on 993, then `imap+starttls` on 143
    Auto,
    /// Implicit TLS
    Tls,
    /// Plaintext connect, mandatory STARTTLS upgrade
    StartTls,
    /// Plaintext (localhost and tests only)
    Plain,
}

impl std::str::FromStr for ImapProtocol {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "imaps" | "imap_ssl" => Ok(Self::Tls),
            "imap+starttls" | "starttls" | "imap_tls" => Ok(Self::StartTls),
            "imap" => Ok(Self::Plain),
            other => Err(ApiError::invalid(format!("unknown IMAP protocol '{other}'"))),
        }
    }
}

/// Connection and per-command read timeouts
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    pub connect: Duration,
    pub command: Duration,
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(30),
        }
    }
}

/// Transient-failure retry policy: 3 attempts, exponential backoff
pub async fn with_retries<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut last = None;
    for attempt in 0..3 {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ (ApiError::Network(_) | ApiError::Timeout(_))) => {
                debug!(attempt, error = %err, "transient IMAP failure, retrying");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| ApiError::internal("retry loop without attempts")))
}

/// Split `host[:port]`, honouring `[v6addr]:port` syntax
pub fn parse_host_port(host_port: &str) -> (String, Option<u16>) {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            return (host.to_owned(), port.parse().ok());
        }
        return (rest.trim_end_matches(']').to_owned(), None);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_owned(), Some(port)),
            Err(_) => (host_port.to_owned(), None),
        },
        _ => (host_port.to_owned(), None),
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One chunk group = one untagged response (line + literal blobs)
pub type ChunkGroup = Vec<Vec<u8>>;

/// Result of one tagged command
pub struct CommandReply {
    pub ok: bool,
    /// `OK`, `NO` or `BAD`
    pub status: String,
    /// Human-readable completion text
    pub status_text: String,
    /// Untagged responses gathered before completion
    pub groups: Vec<ChunkGroup>,
}

impl CommandReply {
    /// Borrowed chunk slices for the tokenizer
    fn chunk_refs(group: &ChunkGroup) -> Vec<&[u8]> {
        group.iter().map(Vec::as_slice).collect()
    }

    /// Parse one group with the response tokenizer
    pub fn parse_group(&self, index: usize) -> Option<(bool, Vec<ImapValue>)> {
        self.groups
            .get(index)
            .map(|g| parse_imap(&self.status, &Self::chunk_refs(g)))
    }
}

/// Mailbox state captured at SELECT time
#[derive(Debug, Clone, Default)]
pub struct SelectedMailbox {
    pub mailbox: String,
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// Metadata for one fetched message
#[derive(Debug, Clone)]
pub struct FetchedMetadata {
    /// Message sequence number within the selected mailbox
    pub seq: u32,
    pub size: u64,
    pub flags: Vec<String>,
    pub raw_headers: Vec<u8>,
}

/// One mailbox found by enumeration
#[derive(Debug, Clone)]
pub struct MailboxEntry {
    /// Decoded (UTF-8) mailbox name
    pub name: String,
    /// Wire name (modified UTF-7)
    pub wire_name: String,
    pub delimiter: String,
    pub flags: Vec<String>,
}

/// An authenticated-capable IMAP session
pub struct ImapSession {
    stream: BufStream<Stream>,
    timeouts: ImapTimeouts,
    tag_counter: u32,
    host: String,
    username: Option<String>,
    pub capabilities: HashSet<String>,
    pub selected: Option<SelectedMailbox>,
    authenticated: bool,
}

impl ImapSession {
    /// Connect with a protocol hint; see [`ImapProtocol`]
    pub async fn connect(
        host_port: &str,
        protocol: ImapProtocol,
        timeouts: ImapTimeouts,
    ) -> AppResult<Self> {
        let (host, port) = parse_host_port(host_port);

        if protocol == ImapProtocol::Auto {
            let mut last = None;
            for (proto, default_port) in
                [(ImapProtocol::Tls, 993u16), (ImapProtocol::StartTls, 143)]
            {
                if let Some(explicit) = port {
                    if explicit != default_port {
                        continue;
                    }
                }
                match Box::pin(Self::connect(
                    &format!("{host}:{}", port.unwrap_or(default_port)),
                    proto,
                    timeouts,
                ))
                .await
                {
                    Ok(session) => return Ok(session),
                    Err(err) => last = Some(err),
                }
            }
            return match last {
                Some(err) => Err(err),
                // Auto on a non-standard port: plain IMAP, upgraded
                // opportunistically if the server offers STARTTLS
                None => Box::pin(Self::connect(host_port, ImapProtocol::Plain, timeouts)).await,
            };
        }

        let port = port.unwrap_or(match protocol {
            ImapProtocol::Tls => 993,
            _ => 143,
        });

        debug!(host, port, ?protocol, "connecting to IMAP server");
        let tcp = timeout(timeouts.connect, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ApiError::Timeout(format!("tcp connect timeout to {host}:{port}")))?
            .map_err(|e| ApiError::Network(format!("tcp connect failed: {e}")))?;

        let stream = if protocol == ImapProtocol::Tls {
            Stream::Tls(Box::new(tls_handshake(tcp, &host, timeouts).await?))
        } else {
            Stream::Plain(tcp)
        };

        let mut session = Self {
            stream: BufStream::new(stream),
            timeouts,
            tag_counter: 0,
            host: host.clone(),
            username: None,
            capabilities: HashSet::new(),
            selected: None,
            authenticated: false,
        };

        let greeting = session.read_line().await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(ApiError::RemoteProtocol(format!(
                "unexpected IMAP greeting: {}",
                greeting.trim_end()
            )));
        }
        session.refresh_capabilities().await?;

        // STARTTLS is mandatory when requested, opportunistic on plain
        // connections whose server advertises it
        let want_upgrade = protocol == ImapProtocol::StartTls
            || (protocol == ImapProtocol::Plain && session.capabilities.contains("STARTTLS"));
        if want_upgrade {
            if !session.capabilities.contains("STARTTLS") {
                return Err(ApiError::Tls(
                    "Failed to secure the connection with TLS".to_owned(),
                ));
            }
            let reply = session.command("STARTTLS").await?;
            if !reply.ok {
                return Err(ApiError::Tls(
                    "Failed to secure the connection with TLS".to_owned(),
                ));
            }
            session = session.upgrade_tls().await?;
            session.refresh_capabilities().await?;
        }

        Ok(session)
    }

    /// Wrap the established plaintext stream in TLS (after STARTTLS OK)
    async fn upgrade_tls(self) -> AppResult<Self> {
        let Self {
            stream,
            timeouts,
            tag_counter,
            host,
            username,
            selected,
            authenticated,
            ..
        } = self;
        let tcp = match stream.into_inner() {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => {
                return Err(ApiError::Tls("connection is already TLS".to_owned()));
            }
        };
        let tls = tls_handshake(tcp, &host, timeouts).await?;
        Ok(Self {
            stream: BufStream::new(Stream::Tls(Box::new(tls))),
            timeouts,
            tag_counter,
            host,
            username,
            capabilities: HashSet::new(),
            selected,
            authenticated,
        })
    }

    /// `imap://user@host:port` style resource id for unlock prompts
    pub fn resource_id(&self) -> String {
        match &self.username {
            Some(user) => format!("imap://{}@{}", user.replace('@', "%40"), self.host),
            None => format!("imap://{}", self.host),
        }
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let mut line = String::new();
        let read = timeout(self.timeouts.command, self.stream.read_line(&mut line))
            .await
            .map_err(|_| ApiError::Timeout("IMAP read timed out".to_owned()))?
            .map_err(|e| ApiError::Network(format!("IMAP read failed: {e}")))?;
        if read == 0 {
            return Err(ApiError::Network(
                "IMAP server closed the connection".to_owned(),
            ));
        }
        Ok(line)
    }

    /// Run one tagged command, gathering untagged responses
    pub async fn command(&mut self, cmd: &str) -> AppResult<CommandReply> {
        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);
        let line = format!("{tag} {cmd}\r\n");
        timeout(self.timeouts.command, async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ApiError::Timeout("IMAP write timed out".to_owned()))?
        .map_err(|e| ApiError::Network(format!("IMAP write failed: {e}")))?;

        let mut groups: Vec<ChunkGroup> = Vec::new();
        loop {
            let line = self.read_line().await?;
            let trimmed = line.trim_end_matches(['\r', '\n']);

            if let Some(rest) = trimmed.strip_prefix(&format!("{tag} ")) {
                let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
                return Ok(CommandReply {
                    ok: status.eq_ignore_ascii_case("OK"),
                    status: status.to_owned(),
                    status_text: text.to_owned(),
                    groups,
                });
            }
            if trimmed.starts_with('+') {
                // Continuation requests only matter for APPEND, which this
                // client does not issue
                continue;
            }

            let chunk = trimmed.strip_prefix("* ").unwrap_or(trimmed).to_owned();
            let mut group: ChunkGroup = Vec::new();
            let mut current = chunk.into_bytes();

            // A line ending in {N} announces N literal bytes, then the
            // rest of the same logical response continues on the wire
            while let Some(len) = literal_len(&current) {
                group.push(current);
                let mut blob = vec![0u8; len];
                timeout(self.timeouts.command, self.stream.read_exact(&mut blob))
                    .await
                    .map_err(|_| ApiError::Timeout("IMAP literal read timed out".to_owned()))?
                    .map_err(|e| ApiError::Network(format!("IMAP literal read failed: {e}")))?;
                group.push(blob);
                let tail = self.read_line().await?;
                current = tail.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
            }
            group.push(current);
            groups.push(group);
        }
    }

    async fn refresh_capabilities(&mut self) -> AppResult<()> {
        let reply = self.command("CAPABILITY").await?;
        let mut caps = HashSet::new();
        for i in 0..reply.groups.len() {
            if let Some((true, values)) = reply.parse_group(i) {
                for value in values {
                    if let Some(atom) = value.as_str() {
                        caps.insert(atom.to_ascii_uppercase());
                    }
                }
            }
        }
        caps.remove("CAPABILITY");
        self.capabilities = caps;
        Ok(())
    }

    /// LOGIN authentication
    ///
    /// # Errors
    ///
    /// `NeedInfo` when the server reports `AUTHENTICATIONFAILED`; the UI
    /// re-prompts for credentials and retries.
    pub async fn login(&mut self, username: &str, password: &str) -> AppResult<()> {
        if self.authenticated {
            return Ok(());
        }
        self.username = Some(username.to_owned());
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        let reply = self.command(&cmd).await?;
        if reply.ok {
            self.authenticated = true;
            return Ok(());
        }
        if reply.status_text.to_ascii_uppercase().contains("AUTHENTICATIONFAILED") {
            return Err(ApiError::please_unlock(&self.resource_id(), false, true));
        }
        Err(ApiError::RemoteProtocol(format!(
            "LOGIN failed: {}",
            reply.status_text
        )))
    }

    /// SELECT a mailbox, capturing EXISTS and UIDVALIDITY
    pub async fn select(&mut self, mailbox: &str) -> AppResult<&SelectedMailbox> {
        let wire = utf7_imap::encode_utf7_imap(mailbox.to_owned());
        if self.selected.as_ref().is_some_and(|s| s.mailbox == mailbox) {
            return self
                .selected
                .as_ref()
                .ok_or_else(|| ApiError::internal("selected mailbox vanished"));
        }
        let reply = self.command(&format!("SELECT {}", quote(&wire))).await?;
        if !reply.ok {
            return Err(ApiError::NotFound(format!("Failed to select {mailbox}")));
        }

        let mut state = SelectedMailbox {
            mailbox: mailbox.to_owned(),
            ..Default::default()
        };
        for group in &reply.groups {
            let Some(first) = group.first() else { continue };
            let text = String::from_utf8_lossy(first);
            if let Some(count) = text.strip_suffix(" EXISTS") {
                state.exists = count.trim().parse().unwrap_or(0);
            }
            if let Some(pos) = text.find("[UIDVALIDITY ") {
                let tail = &text[pos + "[UIDVALIDITY ".len()..];
                if let Some(end) = tail.find(']') {
                    state.uid_validity = tail[..end].trim().parse().ok();
                }
            }
        }
        debug!(mailbox, exists = state.exists, "selected mailbox");
        self.selected = Some(state);
        self.selected
            .as_ref()
            .ok_or_else(|| ApiError::internal("selected mailbox vanished"))
    }

    /// All message sequence numbers in a mailbox
    pub async fn uids(&mut self, mailbox: &str) -> AppResult<Vec<u32>> {
        self.select(mailbox).await?;
        let reply = self.command("SEARCH ALL").await?;
        if !reply.ok {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for i in 0..reply.groups.len() {
            if let Some((_, values)) = reply.parse_group(i) {
                let mut values = values.iter();
                if values.next().and_then(ImapValue::as_str) != Some("SEARCH") {
                    continue;
                }
                ids.extend(
                    values.filter_map(|v| v.as_str().and_then(|s| s.parse::<u32>().ok())),
                );
            }
        }
        Ok(ids)
    }

    /// Fetch sizes, flags and metadata headers for a batch of messages
    pub async fn fetch_metadata(
        &mut self,
        mailbox: &str,
        ids: &[u32],
    ) -> AppResult<Vec<FetchedMetadata>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(mailbox).await?;
        let set = ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let peek_key = format!("BODY.PEEK[HEADER.FIELDS ({METADATA_HEADERS})]");
        let reply = self
            .command(&format!("FETCH {set} (RFC822.SIZE FLAGS {peek_key})"))
            .await?;
        if !reply.ok {
            return Err(ApiError::RemoteProtocol(format!(
                "FETCH failed: {}",
                reply.status_text
            )));
        }

        // Collapse the unwieldy response key so the tokenizer sees a
        // single atom instead of a bracketed field list
        let response_key = peek_key.replace(".PEEK", "");
        let mut fetched = Vec::new();
        for group in &reply.groups {
            let rewritten: Vec<Vec<u8>> = group
                .iter()
                .enumerate()
                .map(|(i, chunk)| {
                    if i == 0 {
                        String::from_utf8_lossy(chunk)
                            .replace(&response_key, "RFC822.HEADER")
                            .into_bytes()
                    } else {
                        chunk.clone()
                    }
                })
                .collect();
            let refs: Vec<&[u8]> = rewritten.iter().map(Vec::as_slice).collect();
            let (_, values) = parse_imap(&reply.status, &refs);

            let mut iter = values.iter();
            let Some(seq) = iter
                .next()
                .and_then(ImapValue::as_str)
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if iter.next().and_then(ImapValue::as_str) != Some("FETCH") {
                continue;
            }
            let Some(attrs) = iter.next().and_then(ImapValue::as_list) else {
                continue;
            };
            let dict = imap_dict(attrs);
            let Some(size) = dict
                .get("RFC822.SIZE")
                .and_then(ImapValue::as_str)
                .and_then(|s| s.parse().ok())
            else {
                debug!(seq, "fetch response without size, skipping");
                continue;
            };
            let flags = dict
                .get("FLAGS")
                .and_then(ImapValue::as_list)
                .map(|list| {
                    list.iter()
                        .filter_map(|f| f.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            let raw_headers = dict
                .get("RFC822.HEADER")
                .and_then(ImapValue::as_str)
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default();
            fetched.push(FetchedMetadata {
                seq,
                size,
                flags,
                raw_headers,
            });
        }
        Ok(fetched)
    }

    /// Recursive mailbox enumeration
    ///
    /// Descends into folders without `\NOINFERIORS`; entries flagged
    /// `\NOSELECT` are yielded (callers filter) but still descended into.
    pub async fn list_mailboxes(&mut self, limit: usize) -> AppResult<Vec<MailboxEntry>> {
        let mut found = Vec::new();
        let mut queue = vec![String::new()];
        while let Some(prefix) = queue.pop() {
            let reply = self
                .command(&format!("LIST {} %", quote(&prefix)))
                .await?;
            if !reply.ok {
                continue;
            }
            for i in 0..reply.groups.len() {
                let Some((_, values)) = reply.parse_group(i) else {
                    continue;
                };
                let mut iter = values.into_iter();
                if iter.next().and_then(|v| v.as_str().map(str::to_owned)).as_deref()
                    != Some("LIST")
                {
                    continue;
                }
                let Some(ImapValue::List(flag_values)) = iter.next() else {
                    continue;
                };
                let flags: Vec<String> = flag_values
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_ascii_uppercase))
                    .collect();
                let delimiter = iter
                    .next()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "/".to_owned());
                let Some(wire_name) = iter.next().and_then(|v| v.as_str().map(str::to_owned))
                else {
                    continue;
                };

                if !flags.iter().any(|f| f == "\\NOINFERIORS") && delimiter != "NIL" {
                    queue.push(format!("{wire_name}{delimiter}"));
                }
                found.push(MailboxEntry {
                    name: utf7_imap::decode_utf7_imap(wire_name.clone()),
                    wire_name,
                    delimiter,
                    flags,
                });
                if found.len() >= limit {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Selectable mailboxes only (no `\NOSELECT`)
    pub async fn mailboxes(&mut self, limit: usize) -> AppResult<Vec<MailboxEntry>> {
        Ok(self
            .list_mailboxes(limit * 4)
            .await?
            .into_iter()
            .filter(|m| !m.flags.iter().any(|f| f == "\\NOSELECT"))
            .take(limit)
            .collect())
    }

    /// Force-close the connection to unblock any hung operations
    pub async fn shutdown(mut self) {
        let _ = self.stream.write_all(b"A9999 LOGOUT\r\n").await;
        let _ = self.stream.flush().await;
        match self.stream.into_inner() {
            Stream::Plain(mut tcp) => {
                let _ = tcp.shutdown().await;
            }
            Stream::Tls(mut tls) => {
                let _ = tls.shutdown().await;
            }
        }
    }
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    timeouts: ImapTimeouts,
) -> AppResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| ApiError::Tls(format!("invalid TLS server name '{host}'")))?;
    timeout(timeouts.connect, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ApiError::Timeout("TLS handshake timeout".to_owned()))?
        .map_err(|e| ApiError::Tls(format!("TLS handshake failed: {e}")))
}

/// Quote an IMAP string argument
fn quote(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_owned();
    }
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Length of a trailing `{N}` literal marker, if present
fn literal_len(line: &[u8]) -> Option<usize> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let open = line.iter().rposition(|b| *b == b'{')?;
    std::str::from_utf8(&line[open + 1..line.len() - 1])
        .ok()?
        .parse()
        .ok()
}
