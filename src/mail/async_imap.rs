//! Async IMAP session implementation using async-imap
//!
//! One `AsyncImapSession` wraps one authenticated TLS connection. Every
//! network round-trip is bounded by a timeout so a stalled server surfaces
//! as a transient `MailError::Timeout` instead of hanging the account's pool.

use crate::mail::{
    config::{ImapConfig, SecurityType},
    FetchedBody, MailError, MailResult, MailSession, MailboxInfo, MailboxSyncRequest,
    MailboxSyncResult, RemoteMessage, SessionConnector, SpecialUse,
};
use async_imap::types::{Fetch, Flag, NameAttribute};
use async_imap::Session;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use mail_parser::MimeHeaders;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::compat::TokioAsyncReadCompatExt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Max UIDs per SEARCH / FETCH command line
const UID_CHUNK_SIZE: usize = 500;

type TlsStream = async_native_tls::TlsStream<tokio_util::compat::Compat<tokio::net::TcpStream>>;

/// Decode MIME encoded header (RFC 2047)
fn decode_mime_header(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }

    let mut result = input.to_string();

    // =?charset?B?text?=
    if let Ok(re_b64) = regex_lite::Regex::new(r"=\?([^?]+)\?[Bb]\?([^?]+)\?=") {
        result = re_b64
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .unwrap_or_else(|| encoded.to_string())
            })
            .to_string();
    }

    // =?charset?Q?text?=
    if let Ok(re_qp) = regex_lite::Regex::new(r"=\?([^?]+)\?[Qq]\?([^?]+)\?=") {
        result = re_qp
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                decode_quoted_printable(encoded)
            })
            .to_string();
    }

    result
}

/// Decode the Q-encoding used inside RFC 2047 words
fn decode_quoted_printable(input: &str) -> String {
    let mut result = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '=' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                result.push(byte);
            }
        } else if c == '_' {
            result.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            result.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Render a UID list as an IMAP sequence set
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn map_imap_error(err: async_imap::error::Error) -> MailError {
    match err {
        async_imap::error::Error::Io(e) => MailError::Io(e),
        async_imap::error::Error::ConnectionLost => {
            MailError::ConnectionClosed("server closed the connection".to_string())
        }
        other => MailError::Imap(other.to_string()),
    }
}

async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> MailResult<T>
where
    F: Future<Output = MailResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MailError::Timeout(format!(
            "{} did not complete within {}s",
            what,
            limit.as_secs()
        ))),
    }
}

/// Drain a response stream. `idle` bounds the gap between two items, not the
/// whole transfer, so a large but steady response never times out.
async fn collect_stream<S, T>(what: &str, idle: Duration, stream: S) -> MailResult<Vec<T>>
where
    S: Stream<Item = Result<T, async_imap::error::Error>>,
{
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    loop {
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => items.push(item.map_err(map_imap_error)?),
            Ok(None) => return Ok(items),
            Err(_) => {
                return Err(MailError::Timeout(format!(
                    "{} stalled for {}s after {} response(s)",
                    what,
                    idle.as_secs(),
                    items.len()
                )))
            }
        }
    }
}

/// A mailbox the server refuses (NO on SELECT, vanished folder) is left out
/// of the pass instead of failing every other mailbox with it.
fn skip_rejected_mailbox(
    path: &str,
    result: MailResult<MailboxSyncResult>,
) -> MailResult<Option<MailboxSyncResult>> {
    match result {
        Ok(synced) => Ok(Some(synced)),
        Err(MailError::Imap(reason)) => {
            log::warn!("Skipping mailbox {}: {}", path, reason);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn join_address(mailbox: Option<&[u8]>, host: Option<&[u8]>) -> String {
    let mailbox = mailbox
        .map(|m| String::from_utf8_lossy(m).to_string())
        .unwrap_or_default();
    let host = host
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();
    format!("{}@{}", mailbox, host)
}

/// Header-derived metadata the envelope does not carry
struct HeaderMeta {
    list_unsubscribe: Option<String>,
    has_attachments: bool,
}

fn parse_header_meta(header: &[u8]) -> HeaderMeta {
    let Some(parsed) = mail_parser::MessageParser::default().parse(header) else {
        return HeaderMeta {
            list_unsubscribe: None,
            has_attachments: false,
        };
    };

    let list_unsubscribe = parsed
        .header_raw("List-Unsubscribe")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let has_attachments = parsed
        .content_type()
        .map(|ct| {
            ct.ctype().eq_ignore_ascii_case("multipart")
                && ct
                    .subtype()
                    .map(|s| s.eq_ignore_ascii_case("mixed"))
                    .unwrap_or(false)
        })
        .unwrap_or(false);

    HeaderMeta {
        list_unsubscribe,
        has_attachments,
    }
}

/// Convert a FETCH (UID FLAGS ENVELOPE RFC822.HEADER) response
fn remote_message_from_fetch(fetch: &Fetch) -> Option<RemoteMessage> {
    let uid = fetch.uid?;
    let flags: Vec<Flag<'_>> = fetch.flags().collect();
    let is_read = flags.iter().any(|f| matches!(f, Flag::Seen));
    let is_starred = flags.iter().any(|f| matches!(f, Flag::Flagged));

    let envelope = fetch.envelope();

    let (from_address, from_name) = envelope
        .and_then(|e| e.from.as_ref())
        .and_then(|addrs| addrs.first())
        .map(|addr| {
            let name = addr
                .name
                .as_ref()
                .map(|n| decode_mime_header(&String::from_utf8_lossy(n)));
            (join_address(addr.mailbox.as_deref(), addr.host.as_deref()), name)
        })
        .unwrap_or_else(|| ("unknown".to_string(), None));

    let to_addresses = envelope
        .and_then(|e| e.to.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .map(|addr| join_address(addr.mailbox.as_deref(), addr.host.as_deref()))
                .collect()
        })
        .unwrap_or_default();

    let subject = envelope
        .and_then(|e| e.subject.as_ref())
        .map(|s| decode_mime_header(&String::from_utf8_lossy(s)))
        .unwrap_or_else(|| "(No subject)".to_string());

    let date = envelope
        .and_then(|e| e.date.as_ref())
        .map(|d| String::from_utf8_lossy(d).to_string())
        .unwrap_or_default();

    let message_id = envelope
        .and_then(|e| e.message_id.as_ref())
        .map(|id| String::from_utf8_lossy(id).to_string());

    let in_reply_to = envelope
        .and_then(|e| e.in_reply_to.as_ref())
        .map(|id| String::from_utf8_lossy(id).to_string());

    let meta = fetch.header().map(parse_header_meta);

    Some(RemoteMessage {
        uid,
        message_id,
        subject,
        from_address,
        from_name,
        to_addresses,
        date,
        is_read,
        is_starred,
        has_attachments: meta.as_ref().map(|m| m.has_attachments).unwrap_or(false),
        list_unsubscribe: meta.and_then(|m| m.list_unsubscribe),
        in_reply_to,
    })
}

/// Parse a full RFC 822 message into text/html bodies
fn parse_email_body(raw: &[u8]) -> FetchedBody {
    if let Some(parsed) = mail_parser::MessageParser::default().parse(raw) {
        return FetchedBody {
            body_text: parsed.body_text(0).map(|s| s.to_string()),
            body_html: parsed.body_html(0).map(|s| s.to_string()),
            list_unsubscribe: parsed
                .header_raw("List-Unsubscribe")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        };
    }

    // Fallback: treat as plain text
    FetchedBody {
        body_text: Some(String::from_utf8_lossy(raw).to_string()),
        body_html: None,
        list_unsubscribe: None,
    }
}

fn mailbox_info_from_name(name: &async_imap::types::Name) -> MailboxInfo {
    let mut selectable = true;
    let mut special_use = None;

    for attr in name.attributes() {
        match attr {
            NameAttribute::NoSelect => selectable = false,
            NameAttribute::Extension(ext) => {
                if ext.eq_ignore_ascii_case("\\NonExistent") {
                    selectable = false;
                } else if special_use.is_none() {
                    special_use = SpecialUse::from_attribute(ext);
                }
            }
            other => {
                // Special-use flags render as their bare name, e.g. `Sent`
                if special_use.is_none() {
                    special_use = SpecialUse::from_attribute(&format!("{:?}", other));
                }
            }
        }
    }

    let path = name.name().to_string();
    if path.eq_ignore_ascii_case("INBOX") {
        special_use = Some(SpecialUse::Inbox);
    }

    MailboxInfo {
        path,
        special_use,
        selectable,
    }
}

/// Authenticated async-imap session over TLS
pub struct AsyncImapSession {
    session: Session<TlsStream>,
    host: String,
    broken: bool,
}

impl AsyncImapSession {
    /// Connect and log in
    pub async fn connect(config: &ImapConfig) -> MailResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(MailError::Config(errors.join(", ")));
        }

        let port = match config.security {
            SecurityType::SSL => config.port,
            SecurityType::STARTTLS => {
                // STARTTLS upgrade is not supported by the client; use implicit TLS
                log::warn!(
                    "STARTTLS requested for {}, connecting with implicit TLS on 993",
                    config.host
                );
                993
            }
            SecurityType::NONE => {
                return Err(MailError::Config(
                    "Unencrypted IMAP connections are not supported. Use SSL/TLS.".to_string(),
                ));
            }
        };

        let tls = if config.accept_invalid_certs {
            log::warn!("Accepting invalid SSL certificates for {}", config.host);
            async_native_tls::TlsConnector::new().danger_accept_invalid_certs(true)
        } else {
            async_native_tls::TlsConnector::new()
        };

        let address = format!("{}:{}", config.host, port);

        let tls_stream = with_timeout("connect", CONNECT_TIMEOUT, async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| MailError::Connection(format!("{}: {}", address, e)))?;

            tls.connect(&config.host, stream.compat())
                .await
                .map_err(|e| MailError::Connection(format!("TLS handshake failed: {}", e)))
        })
        .await?;

        let client = async_imap::Client::new(tls_stream);

        let session = with_timeout("login", COMMAND_TIMEOUT, async {
            client
                .login(&config.username, config.password.as_str())
                .await
                .map_err(|(e, _client)| match e {
                    async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
                        MailError::Authentication(e.to_string())
                    }
                    other => map_imap_error(other),
                })
        })
        .await?;

        log::info!("Async IMAP connected to: {}", config.host);

        Ok(Self {
            session,
            host: config.host.clone(),
            broken: false,
        })
    }

    /// Record transient failures so the pool drops this session
    fn track<T>(&mut self, result: MailResult<T>) -> MailResult<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                self.broken = true;
            }
        }
        result
    }

    async fn sync_one(&mut self, request: &MailboxSyncRequest) -> MailResult<MailboxSyncResult> {
        let session = &mut self.session;

        let mailbox = with_timeout("select", COMMAND_TIMEOUT, async {
            session.select(&request.path).await.map_err(map_imap_error)
        })
        .await?;

        let mut result = MailboxSyncResult {
            path: request.path.clone(),
            max_uid: request.since_uid,
            ..Default::default()
        };

        if mailbox.exists == 0 {
            return Ok(result);
        }

        // `n:*` always matches the highest message, so filter again below
        let query = format!("UID {}:*", request.since_uid.saturating_add(1));
        let found = with_timeout("search new messages", COMMAND_TIMEOUT, async {
            session.uid_search(&query).await.map_err(map_imap_error)
        })
        .await?;
        let mut new_uids: Vec<u32> = found.into_iter().filter(|uid| *uid > request.since_uid).collect();
        new_uids.sort_unstable();

        for chunk in new_uids.chunks(UID_CHUNK_SIZE) {
            let set = uid_set(chunk);
            let stream = with_timeout("fetch new messages", COMMAND_TIMEOUT, async {
                session
                    .uid_fetch(&set, "(UID FLAGS ENVELOPE RFC822.HEADER)")
                    .await
                    .map_err(map_imap_error)
            })
            .await?;
            let fetches = collect_stream("fetch new messages", COMMAND_TIMEOUT, stream).await?;

            for fetch in &fetches {
                if let Some(message) = remote_message_from_fetch(fetch) {
                    if message.uid <= request.since_uid {
                        continue;
                    }
                    result.max_uid = result.max_uid.max(message.uid);
                    result.new_messages.push(message);
                }
            }
        }
        result.new_messages.sort_by_key(|m| m.uid);

        for chunk in request.local_unread_uids.chunks(UID_CHUNK_SIZE) {
            let query = format!("UID {} SEEN", uid_set(chunk));
            let seen = with_timeout("search seen", COMMAND_TIMEOUT, async {
                session.uid_search(&query).await.map_err(map_imap_error)
            })
            .await?;
            let mut seen: Vec<u32> = seen.into_iter().collect();
            seen.sort_unstable();
            result.uids_newly_seen.extend(seen);
        }

        log::debug!(
            "{}: {} new, {} newly seen, max uid {}",
            request.path,
            result.new_messages.len(),
            result.uids_newly_seen.len(),
            result.max_uid
        );

        Ok(result)
    }

    async fn list_inner(&mut self) -> MailResult<Vec<MailboxInfo>> {
        let session = &mut self.session;
        let stream = with_timeout("list", COMMAND_TIMEOUT, async {
            session
                .list(Some(""), Some("*"))
                .await
                .map_err(map_imap_error)
        })
        .await?;
        let names = collect_stream("list", COMMAND_TIMEOUT, stream).await?;
        Ok(names.iter().map(mailbox_info_from_name).collect())
    }

    async fn fetch_bodies_inner(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> MailResult<HashMap<u32, FetchedBody>> {
        let session = &mut self.session;

        with_timeout("examine", COMMAND_TIMEOUT, async {
            session.examine(mailbox).await.map_err(map_imap_error)
        })
        .await?;

        let mut bodies = HashMap::with_capacity(uids.len());
        for chunk in uids.chunks(UID_CHUNK_SIZE) {
            let set = uid_set(chunk);
            let stream = with_timeout("fetch bodies", COMMAND_TIMEOUT, async {
                session
                    .uid_fetch(&set, "(UID BODY.PEEK[])")
                    .await
                    .map_err(map_imap_error)
            })
            .await?;
            let fetches = collect_stream("fetch bodies", COMMAND_TIMEOUT, stream).await?;

            for fetch in &fetches {
                if let (Some(uid), Some(raw)) = (fetch.uid, fetch.body()) {
                    bodies.insert(uid, parse_email_body(raw));
                }
            }
        }

        Ok(bodies)
    }

    async fn set_seen_inner(&mut self, mailbox: &str, uids: &[u32], seen: bool) -> MailResult<()> {
        let session = &mut self.session;

        with_timeout("select", COMMAND_TIMEOUT, async {
            session.select(mailbox).await.map_err(map_imap_error)
        })
        .await?;

        let flag_cmd = if seen {
            "+FLAGS.SILENT (\\Seen)"
        } else {
            "-FLAGS.SILENT (\\Seen)"
        };

        for chunk in uids.chunks(UID_CHUNK_SIZE) {
            let set = uid_set(chunk);
            let stream = with_timeout("store flags", COMMAND_TIMEOUT, async {
                session.uid_store(&set, flag_cmd).await.map_err(map_imap_error)
            })
            .await?;
            collect_stream("store flags", COMMAND_TIMEOUT, stream).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl MailSession for AsyncImapSession {
    async fn list_mailboxes(&mut self) -> MailResult<Vec<MailboxInfo>> {
        let result = self.list_inner().await;
        self.track(result)
    }

    async fn sync_mailboxes(
        &mut self,
        requests: &[MailboxSyncRequest],
    ) -> MailResult<Vec<MailboxSyncResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.sync_one(request).await;
            if let Some(synced) = skip_rejected_mailbox(&request.path, self.track(result))? {
                results.push(synced);
            }
        }
        Ok(results)
    }

    async fn fetch_bodies(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> MailResult<HashMap<u32, FetchedBody>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        let result = self.fetch_bodies_inner(mailbox, uids).await;
        self.track(result)
    }

    async fn set_seen(&mut self, mailbox: &str, uids: &[u32], seen: bool) -> MailResult<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let result = self.set_seen_inner(mailbox, uids, seen).await;
        self.track(result)
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }

    async fn logout(&mut self) -> MailResult<()> {
        let session = &mut self.session;
        let result = with_timeout("logout", COMMAND_TIMEOUT, async {
            session.logout().await.map_err(map_imap_error)
        })
        .await;
        log::debug!("Logged out from {}", self.host);
        self.broken = true;
        result
    }
}

/// Connector producing `AsyncImapSession`s
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

#[async_trait]
impl SessionConnector for ImapConnector {
    async fn connect(&self, config: &ImapConfig) -> MailResult<Box<dyn MailSession>> {
        let session = AsyncImapSession::connect(config).await?;
        Ok(Box::new(session))
    }
}
