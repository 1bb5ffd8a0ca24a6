//! Email mailbox: raw IMAP over rustls for inbound, SMTP via lettre for outbound.
//!
//! All socket work is blocking and runs under `spawn_blocking`. Fetching
//! uses `BODY.PEEK[]` so nothing is flagged `\Seen` until the pipeline calls
//! `mark_read` for messages it has handled.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::address::EmailAddress;
use crate::config::{Credentials, MailServerConfig};
use crate::error::ChannelError;
use crate::pipeline::types::{InboundMessage, Mailbox};

const IMAP: &str = "imap";
const SMTP: &str = "smtp";

// ── Configuration ───────────────────────────────────────────────────

/// Everything needed to talk to one mailbox.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Login name and From address.
    pub address: String,
    pub password: SecretString,
    /// Socket read timeout for IMAP and transport timeout for SMTP.
    pub io_timeout: Duration,
}

impl EmailConfig {
    pub fn new(servers: &MailServerConfig, credentials: &Credentials, io_timeout: Duration) -> Self {
        Self {
            imap_host: servers.imap_host.clone(),
            imap_port: servers.imap_port,
            smtp_host: servers.smtp_host.clone(),
            smtp_port: servers.smtp_port,
            address: credentials.email_address.clone(),
            password: credentials.email_password.clone(),
            io_timeout,
        }
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP inbox plus SMTP outbox for a single account.
pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        IMAP
    }

    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, ChannelError> {
        let config = Arc::clone(&self.config);
        let messages = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| ChannelError::Disconnected {
                name: IMAP.into(),
                reason: format!("fetch task failed: {e}"),
            })??;
        info!(count = messages.len(), host = %self.config.imap_host, "Fetched unread email");
        Ok(messages)
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let config = Arc::clone(&self.config);
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_smtp(&config, &to, &subject, &body))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: SMTP.into(),
                reason: format!("send task failed: {e}"),
            })?
    }

    async fn mark_read(&self, messages: &[InboundMessage]) -> Result<(), ChannelError> {
        let uids: Vec<u32> = messages.iter().filter_map(|m| m.mailbox_uid).collect();
        if uids.is_empty() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config)?;
            session.select_inbox()?;
            session.store_seen(&uids)?;
            session.logout();
            debug!(count = uids.len(), "Flagged messages as seen");
            Ok(())
        })
        .await
        .map_err(|e| ChannelError::Disconnected {
            name: IMAP.into(),
            reason: format!("mark_read task failed: {e}"),
        })?
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: SMTP.into(),
        reason,
    }
}

/// Blocking SMTP send. Port 465 uses implicit TLS, anything else STARTTLS.
fn send_smtp(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
    let creds = SmtpCredentials::new(
        config.address.clone(),
        config.password.expose_secret().to_string(),
    );

    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(creds)
        .timeout(Some(config.io_timeout))
        .build();

    let email = Message::builder()
        .from(
            config
                .address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    info!(to = %to, "Email sent");
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn disconnected(reason: impl std::fmt::Display) -> ChannelError {
    ChannelError::Disconnected {
        name: IMAP.into(),
        reason: reason.to_string(),
    }
}

/// Untagged lines and literal payloads from one tagged command.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// Minimal synchronous IMAP client: one command in flight at a time.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, ChannelError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
            .map_err(|e| disconnected(format!("connect {}:{}: {e}", config.imap_host, config.imap_port)))?;
        tcp.set_read_timeout(Some(config.io_timeout)).map_err(disconnected)?;
        tcp.set_write_timeout(Some(config.io_timeout)).map_err(disconnected)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| disconnected(format!("invalid IMAP host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(disconnected)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(disconnected(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).map_err(disconnected)?;
        if n == 0 {
            return Err(disconnected("connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one command and collect everything up to its tagged completion.
    fn command(&mut self, command: &str) -> Result<ImapResponse, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let inner = self.stream.get_mut();
        inner
            .write_all(format!("{tag} {command}\r\n").as_bytes())
            .map_err(disconnected)?;
        inner.flush().map_err(disconnected)?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.stream.read_exact(&mut literal).map_err(disconnected)?;
                response.literals.push(literal);
            }
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = command.split_whitespace().next().unwrap_or_default();
                return Err(disconnected(format!("{verb} rejected: {status}")));
            }
            response.lines.push(line);
        }
    }

    fn login(&mut self, config: &EmailConfig) -> Result<(), ChannelError> {
        let command = format!(
            "LOGIN {} {}",
            imap_quote(&config.address),
            imap_quote(config.password.expose_secret())
        );
        self.command(&command).map(|_| ()).map_err(|e| ChannelError::AuthFailed {
            name: IMAP.into(),
            reason: e.to_string(),
        })
    }

    fn select_inbox(&mut self) -> Result<(), ChannelError> {
        self.command("SELECT \"INBOX\"").map(|_| ())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, ChannelError> {
        let response = self.command("UID SEARCH UNSEEN")?;
        Ok(parse_search_response(&response.lines))
    }

    /// Full RFC 822 bytes without setting `\Seen`.
    fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ChannelError> {
        let response = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(response.literals.into_iter().next())
    }

    fn store_seen(&mut self, uids: &[u32]) -> Result<(), ChannelError> {
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.command(&format!("UID STORE {set} +FLAGS (\\Seen)")).map(|_| ())
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout did not complete cleanly");
        }
    }
}

/// Fetch and parse every unseen message. Own-address messages are flagged
/// seen and dropped.
fn fetch_unseen(config: &EmailConfig) -> Result<Vec<InboundMessage>, ChannelError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.select_inbox()?;

    let uids = session.search_unseen()?;
    let mut messages = Vec::with_capacity(uids.len());
    let mut own = Vec::new();

    for uid in uids {
        let Some(raw) = session.fetch_raw(uid)? else {
            warn!(uid, "FETCH returned no message body");
            continue;
        };
        match parse_message(uid, &raw) {
            Some(message) if is_own_address(&message.sender, &config.address) => {
                debug!(uid, "Skipping message sent from our own address");
                own.push(uid);
            }
            Some(message) => messages.push(message),
            None => warn!(uid, "Unparsable message, leaving unread"),
        }
    }

    if !own.is_empty() {
        session.store_seen(&own)?;
    }
    session.logout();
    Ok(messages)
}

fn is_own_address(sender: &str, own: &str) -> bool {
    EmailAddress::parse(sender).is_ok_and(|addr| addr.same_mailbox(own))
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// `{123}` at the end of a response line announces a literal of that size.
fn literal_size(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].parse().ok()
}

fn parse_search_response(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Quote a string for use as an IMAP quoted atom.
fn imap_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Turn raw RFC 822 bytes into an `InboundMessage`.
fn parse_message(uid: u32, raw: &[u8]) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|from| from.first())
        .map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(address)) => format!("{name} <{address}>"),
            (None, Some(address)) => address.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .unwrap_or_default();
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("imap-uid-{uid}"));
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let mut message = InboundMessage::new(id, sender, subject, extract_text(&parsed))
        .with_mailbox_uid(uid);
    message.received_at = received_at;
    Some(message)
}

/// Plain-text body, falling back to stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
