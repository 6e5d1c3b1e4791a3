//! IMAP mailbox client.
//!
//! Speaks just enough IMAP4rev1 over a blocking socket to log in, list
//! unseen messages, download their full bodies, and flag them `\Seen`.
//! Delivery is at-least-once: a crash after the `STORE` but before the
//! message is persisted loses nothing, because the pipeline deduplicates on
//! Message-ID and a crash before the `STORE` simply redelivers.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::MailboxAccount;
use crate::error::TransportError;
use crate::pipeline::types::RawMessage;

/// Fetches unseen messages from one mailbox account.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Download all unseen messages and mark them seen.
    ///
    /// Never retries; a failure is retried by the next scheduled sweep.
    async fn fetch_unseen(&self, account: &MailboxAccount)
    -> Result<Vec<RawMessage>, TransportError>;
}

/// Largest message body accepted from the server by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// Raw IMAP over TCP, with rustls for implicit TLS.
#[derive(Debug, Clone)]
pub struct ImapMailbox {
    max_message_size: usize,
}

impl ImapMailbox {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Messages announced larger than this are skipped and left unseen.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

impl Default for ImapMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn fetch_unseen(
        &self,
        account: &MailboxAccount,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let account = account.clone();
        let name = account.name.clone();
        let max_message_size = self.max_message_size;
        tokio::task::spawn_blocking(move || fetch_unseen_blocking(&account, max_message_size))
            .await
            .map_err(|e| TransportError::Connection {
                account: name,
                reason: format!("IMAP task panicked: {e}"),
            })?
    }
}

/// Anything we can speak IMAP over.
trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

/// Lines and literals received for one tagged command.
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    reader: BufReader<Box<dyn ImapStream>>,
    account: String,
    next_tag: u32,
    max_literal: usize,
}

impl ImapSession {
    fn connect(account: &MailboxAccount, max_literal: usize) -> Result<Self, TransportError> {
        let conn_err = |reason: String| TransportError::Connection {
            account: account.name.clone(),
            reason,
        };

        let tcp = TcpStream::connect((account.imap_host.as_str(), account.imap_port))
            .map_err(|e| conn_err(format!("connect {}:{}: {e}", account.imap_host, account.imap_port)))?;
        tcp.set_read_timeout(Some(account.read_timeout))
            .map_err(|e| conn_err(e.to_string()))?;

        let stream: Box<dyn ImapStream> = if account.tls {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            );
            let server_name = rustls_pki_types::ServerName::try_from(account.imap_host.clone())
                .map_err(|e| conn_err(format!("invalid server name: {e}")))?;
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| conn_err(format!("TLS setup failed: {e}")))?;
            Box::new(rustls::StreamOwned::new(conn, tcp))
        } else {
            Box::new(tcp)
        };

        let mut session = Self {
            reader: BufReader::new(stream),
            account: account.name.clone(),
            next_tag: 1,
            max_literal,
        };

        let greeting = session.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(conn_err(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        Ok(session)
    }

    fn io_err(&self, e: impl std::fmt::Display) -> TransportError {
        TransportError::Connection {
            account: self.account.clone(),
            reason: e.to_string(),
        }
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| self.io_err(e))?;
        if n == 0 {
            return Err(self.io_err("IMAP connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one tagged command and collect everything up to its completion.
    ///
    /// A `NO`/`BAD` completion is a protocol error; the session stays usable.
    /// So is a literal over the size limit, which is read off the wire and
    /// discarded.
    fn command(&mut self, cmd: &str) -> Result<Response, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let written = {
            let stream = self.reader.get_mut();
            stream
                .write_all(format!("{tag} {cmd}\r\n").as_bytes())
                .and_then(|()| stream.flush())
        };
        written.map_err(|e| self.io_err(e))?;

        let mut response = Response {
            lines: Vec::new(),
            literals: Vec::new(),
        };
        let mut oversized = None;
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line)
                && size > self.max_literal
            {
                let mut rest = (&mut self.reader).take(size as u64);
                let drained = std::io::copy(&mut rest, &mut std::io::sink());
                drained.map_err(|e| self.io_err(e))?;
                oversized = Some(size);
                continue;
            }
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.reader
                    .read_exact(&mut literal)
                    .map_err(|e| self.io_err(e))?;
                response.literals.push(literal);
                response.lines.push(line);
                continue;
            }
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if let Some(size) = oversized {
                    return Err(TransportError::Protocol {
                        account: self.account.clone(),
                        reason: format!(
                            "{} returned {size} bytes, limit is {}",
                            command_name(cmd),
                            self.max_literal
                        ),
                    });
                }
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(TransportError::Protocol {
                    account: self.account.clone(),
                    reason: format!("{} failed: {}", command_name(cmd), status.trim_end()),
                });
            }
            response.lines.push(line);
        }
    }
}

/// `{123}` at the end of a line announces a literal of that many bytes.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let open = trimmed.rfind('{')?;
    trimmed[open + 1..]
        .strip_suffix('}')
        .and_then(|n| n.trim_end_matches('+').parse().ok())
}

/// First word of a command, so credentials never reach a log line.
fn command_name(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or(cmd)
}

/// Quote a string for use as an IMAP quoted-string argument.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Parse `* SEARCH 4 7 9` lines into UIDs.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(String::from))
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Blocking fetch of every unseen message (run in `spawn_blocking`).
fn fetch_unseen_blocking(
    account: &MailboxAccount,
    max_message_size: usize,
) -> Result<Vec<RawMessage>, TransportError> {
    let mut session = ImapSession::connect(account, max_message_size)?;

    let login = format!(
        "LOGIN {} {}",
        quote(&account.imap_user),
        quote(account.imap_password.expose_secret())
    );
    session.command(&login).map_err(|e| match e {
        TransportError::Protocol { account, reason } => TransportError::Connection {
            account,
            reason: format!("authentication rejected: {reason}"),
        },
        other => other,
    })?;

    session.command("SELECT INBOX")?;
    let search = session.command("UID SEARCH UNSEEN")?;
    let uids = parse_search(&search.lines);
    debug!(account = %account.name, count = uids.len(), "Unseen messages found");

    let mut messages = Vec::new();
    for uid in &uids {
        let fetched = match session.command(&format!("UID FETCH {uid} BODY[]")) {
            Ok(response) => response,
            Err(TransportError::Protocol { reason, .. }) => {
                warn!(account = %account.name, uid = %uid, "Skipping message: {reason}");
                continue;
            }
            Err(e) if !messages.is_empty() => {
                // Already-flagged messages must still reach the pipeline.
                warn!(account = %account.name, "Connection lost mid-batch, keeping {} message(s): {e}", messages.len());
                return Ok(messages);
            }
            Err(e) => return Err(e),
        };

        let Some(bytes) = fetched.literals.into_iter().next() else {
            warn!(account = %account.name, uid = %uid, "FETCH returned no body");
            continue;
        };

        if let Err(e) = session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)")) {
            warn!(account = %account.name, uid = %uid, "Failed to mark message seen: {e}");
        }
        messages.push(RawMessage {
            uid: uid.clone(),
            bytes,
        });
    }

    let _ = session.command("LOGOUT");
    info!(account = %account.name, count = messages.len(), "Fetched unseen messages");
    Ok(messages)
}
