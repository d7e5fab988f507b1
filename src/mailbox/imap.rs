//! Minimal IMAP4rev1 client session over TCP or TLS.
//!
//! Covers exactly what the poller needs: LOGIN, SELECT, UID SEARCH, UID FETCH,
//! UID STORE, CLOSE/UNSELECT and LOGOUT. Responses are read line by line with
//! `{n}` literal support.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use super::stream::MailStream;
use super::{
    ListFilter, MAX_MESSAGE_SIZE, MailboxSession, MessageHandle, MessageId, RawMessage,
    SessionConnector,
};
use crate::config::MailboxConfig;
use crate::error::SessionError;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size (a whole message body).
const MAX_LITERAL_SIZE: usize = MAX_MESSAGE_SIZE;

/// One server response with any literals it carried.
#[derive(Debug, Default)]
struct Response {
    /// Response text, literal payloads excluded (their `{n}` markers stay).
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Attributes parsed from an untagged `FETCH` response.
#[derive(Debug, Default, PartialEq, Eq)]
struct FetchAttributes {
    uid: Option<u32>,
    flags: Vec<String>,
    size: Option<u32>,
}

impl FetchAttributes {
    fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"))
    }
}

/// An authenticated IMAP session.
pub struct ImapSession<S = MailStream> {
    reader: BufReader<S>,
    tag_counter: u32,
    selected: Option<String>,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the greeting and authenticate over an already-open stream.
    pub async fn establish(
        stream: S,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            reader: BufReader::new(stream),
            tag_counter: 0,
            selected: None,
        };

        let greeting = session.read_response().await?;
        let upper = greeting.text.to_ascii_uppercase();
        if upper.starts_with("* PREAUTH") {
            debug!("Server pre-authenticated the session");
            return Ok(session);
        }
        if !upper.starts_with("* OK") {
            return Err(SessionError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            )));
        }

        let login = format!(
            "LOGIN {} {}",
            quote(username),
            quote(password.expose_secret())
        );
        match session.command(&login).await {
            Ok(_) => Ok(session),
            Err(SessionError::CommandFailed { reason, .. }) => Err(SessionError::AuthFailed {
                user: username.to_string(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{}", self.tag_counter)
    }

    /// Send one command and collect its untagged responses until the tagged status.
    async fn command(&mut self, cmd: &str) -> Result<Vec<Response>, SessionError> {
        let tag = self.next_tag();
        let name = command_name(cmd);
        if name == "LOGIN" {
            trace!(tag = %tag, "> LOGIN ***");
        } else {
            trace!(tag = %tag, "> {cmd}");
        }

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes()).await?;
        stream.flush().await?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response().await?;
            let Some(status_line) = response
                .text
                .strip_prefix(tag.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
            else {
                untagged.push(response);
                continue;
            };

            let (status, reason) = status_line.split_once(' ').unwrap_or((status_line, ""));
            if status.eq_ignore_ascii_case("OK") {
                return Ok(untagged);
            }
            return Err(SessionError::CommandFailed {
                command: name,
                reason: format!("{} {}", status.to_ascii_uppercase(), reason.trim()),
            });
        }
    }

    /// Read one response, following any literals it announces.
    async fn read_response(&mut self) -> Result<Response, SessionError> {
        let mut response = Response::default();
        loop {
            let line = self.read_line().await?;
            let text = line.strip_suffix(b"\r\n").unwrap_or(&line);
            response.text.push_str(&String::from_utf8_lossy(text));

            let Some(len) = literal_length(text) else {
                break;
            };
            if len > MAX_LITERAL_SIZE {
                return Err(SessionError::Protocol(format!(
                    "literal too large: {len} bytes (max {MAX_LITERAL_SIZE})"
                )));
            }
            let mut literal = vec![0u8; len];
            self.reader.read_exact(&mut literal).await?;
            response.literals.push(literal);
        }
        Ok(response)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        if !line.ends_with(b"\n") {
            return Err(SessionError::Protocol("line too long".into()));
        }
        Ok(line)
    }

    fn require_selected(&self) -> Result<(), SessionError> {
        if self.selected.is_some() {
            Ok(())
        } else {
            Err(SessionError::NoFolderOpen)
        }
    }

    async fn store_flag(&mut self, handle: &MessageHandle, flag: &str) -> Result<(), SessionError> {
        self.require_selected()?;
        self.command(&format!("UID STORE {} +FLAGS.SILENT ({flag})", handle.id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn open(&mut self, folder: &str) -> Result<(), SessionError> {
        self.command(&format!("SELECT {}", quote(folder))).await?;
        self.selected = Some(folder.to_string());
        debug!(folder = %folder, "Folder opened");
        Ok(())
    }

    async fn list(&mut self, filter: ListFilter) -> Result<Vec<MessageHandle>, SessionError> {
        self.require_selected()?;
        let criteria = match filter {
            ListFilter::Unseen => "UNSEEN",
            ListFilter::All => "ALL",
        };
        let responses = self.command(&format!("UID SEARCH {criteria}")).await?;
        let uids: Vec<u32> = responses
            .iter()
            .filter_map(|r| search_results(&r.text))
            .flatten()
            .collect();
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        // Reduced profile: flags and size only, no content.
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let responses = self
            .command(&format!("UID FETCH {set} (UID FLAGS RFC822.SIZE)"))
            .await?;

        let mut by_uid: HashMap<u32, FetchAttributes> = responses
            .iter()
            .filter(|r| is_fetch_response(&r.text))
            .map(|r| parse_fetch_attributes(&r.text))
            .filter_map(|attrs| attrs.uid.map(|uid| (uid, attrs)))
            .collect();

        Ok(uids
            .into_iter()
            .filter_map(|uid| {
                let attrs = by_uid.remove(&uid)?;
                Some(MessageHandle {
                    id: MessageId(uid),
                    seen: attrs.is_seen(),
                    size: attrs.size,
                })
            })
            .collect())
    }

    async fn fetch(&mut self, handle: &MessageHandle) -> Result<RawMessage, SessionError> {
        self.require_selected()?;
        let uid = handle.id.0;
        let responses = self
            .command(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))
            .await?;

        responses
            .into_iter()
            .filter(|r| is_fetch_response(&r.text))
            .filter(|r| parse_fetch_attributes(&r.text).uid.is_none_or(|u| u == uid))
            .find_map(|r| r.literals.into_iter().next())
            .map(|content| RawMessage {
                id: handle.id,
                content,
            })
            .ok_or(SessionError::MessageNotFound { uid })
    }

    async fn mark_read(&mut self, handle: &MessageHandle) -> Result<(), SessionError> {
        self.store_flag(handle, "\\Seen").await
    }

    async fn mark_deleted(&mut self, handle: &MessageHandle) -> Result<(), SessionError> {
        self.store_flag(handle, "\\Deleted").await
    }

    async fn close(&mut self, expunge: bool) -> Result<(), SessionError> {
        let Some(folder) = self.selected.take() else {
            return Ok(());
        };

        if expunge {
            self.command("CLOSE").await?;
        } else {
            // CLOSE on a read-write folder expunges, so leave via UNSELECT or a
            // read-only re-select.
            match self.command("UNSELECT").await {
                Ok(_) => {}
                Err(SessionError::CommandFailed { .. }) => {
                    self.command(&format!("EXAMINE {}", quote(&folder))).await?;
                    self.command("CLOSE").await?;
                }
                Err(e) => return Err(e),
            }
        }
        debug!(folder = %folder, expunge, "Folder closed");
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        self.command("LOGOUT").await?;
        let _ = self.reader.get_mut().shutdown().await;
        Ok(())
    }
}

/// Connects a fresh [`ImapSession`] from the mailbox configuration.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: MailboxConfig,
}

impl ImapConnector {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, SessionError> {
        let cfg = &self.config;
        let stream = MailStream::connect(&cfg.host, cfg.port, cfg.protocol).await?;
        debug!(host = %cfg.host, port = cfg.port, tls = stream.is_tls(), "Connected to mailbox");
        let session = ImapSession::establish(stream, &cfg.username, &cfg.password).await?;
        Ok(Box::new(session))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Quote a string argument, escaping `\` and `"`.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command name for error reporting: `UID FETCH`, `SELECT`, never arguments.
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match (words.next(), words.next()) {
        (Some(first), Some(second)) if first.eq_ignore_ascii_case("UID") => {
            format!("UID {}", second.to_ascii_uppercase())
        }
        (Some(first), _) => first.to_ascii_uppercase(),
        _ => String::new(),
    }
}

/// Length of a `{n}` or `{n+}` literal announced at the end of a line.
fn literal_length(line: &[u8]) -> Option<usize> {
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|&b| b == b'{')?;
    let digits = &inner[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// UIDs from a `* SEARCH ...` response.
fn search_results(text: &str) -> Option<Vec<u32>> {
    let mut words = text.split_whitespace();
    if words.next() != Some("*") || !words.next()?.eq_ignore_ascii_case("SEARCH") {
        return None;
    }
    Some(words.filter_map(|w| w.parse().ok()).collect())
}

fn is_fetch_response(text: &str) -> bool {
    let mut words = text.split_whitespace();
    words.next() == Some("*")
        && words.next().is_some_and(|n| n.parse::<u32>().is_ok())
        && words.next().is_some_and(|w| w.eq_ignore_ascii_case("FETCH"))
}

fn parse_fetch_attributes(text: &str) -> FetchAttributes {
    FetchAttributes {
        uid: number_after(text, "UID"),
        flags: flags_of(text),
        size: number_after(text, "RFC822.SIZE"),
    }
}

/// Number following a space-delimited attribute name, e.g. `UID 42`.
fn number_after(text: &str, key: &str) -> Option<u32> {
    let upper = text.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut from = 0;
    while let Some(pos) = upper[from..].find(key) {
        let start = from + pos;
        let end = start + key.len();
        let delimited = start == 0 || matches!(bytes[start - 1], b' ' | b'(');
        if delimited && upper[end..].starts_with(' ') {
            let digits: String = upper[end + 1..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
        from = end;
    }
    None
}

fn flags_of(text: &str) -> Vec<String> {
    let upper = text.to_ascii_uppercase();
    let Some(start) = upper.find("FLAGS (") else {
        return Vec::new();
    };
    let rest = &text[start + "FLAGS (".len()..];
    let end = rest.find(')').unwrap_or(rest.len());
    rest[..end].split_whitespace().map(str::to_string).collect()
}
