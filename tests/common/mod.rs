//! Shared in-memory mailbox for the integration tests.
//!
//! `FakeMailbox` holds the folder state behind a mutex so the test can inspect
//! it after the poller has consumed the session.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::fmt::MakeWriter;

use mail_intake::error::SessionError;
use mail_intake::mailbox::{
    ListFilter, MailboxSession, MessageHandle, MessageId, RawMessage, SessionConnector,
};
use mail_intake::processor::MessageHandler;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: u32,
    pub content: Vec<u8>,
    pub seen: bool,
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub struct MailboxState {
    pub messages: Vec<StoredMessage>,
    /// Extra ids appended to every unseen listing, to simulate duplicates.
    pub duplicate_ids: Vec<u32>,
    /// Ids removed from the folder right after they are fetched.
    pub vanish_after_fetch: HashSet<u32>,
    pub fail_list: bool,
    /// Ids whose fetch is rejected by the server.
    pub reject_fetch: HashSet<u32>,
    /// Ids whose fetch drops the connection.
    pub drop_on_fetch: HashSet<u32>,
    /// When false, `mark_read` is accepted but not applied.
    pub apply_seen: bool,
    /// Every session call, in order.
    pub calls: Vec<String>,
    pub open_sessions: usize,
    pub max_open_sessions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeMailbox {
    pub state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        let mailbox = Self::default();
        mailbox.state.lock().unwrap().apply_seen = true;
        mailbox
    }

    pub fn add(&self, id: u32, content: &str) {
        self.state.lock().unwrap().messages.push(StoredMessage {
            id,
            content: content.replace('\n', "\r\n").into_bytes(),
            seen: false,
            deleted: false,
        });
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MailboxState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn message(&self, id: u32) -> Option<StoredMessage> {
        self.with(|s| s.messages.iter().find(|m| m.id == id).cloned())
    }

    pub fn session(&self) -> FakeSession {
        self.with(|s| {
            s.open_sessions += 1;
            s.max_open_sessions = s.max_open_sessions.max(s.open_sessions);
        });
        FakeSession {
            state: Arc::clone(&self.state),
            open: false,
        }
    }
}

pub struct FakeSession {
    state: Arc<Mutex<MailboxState>>,
    open: bool,
}

impl FakeSession {
    fn log(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    fn require_open(&self) -> Result<(), SessionError> {
        if self.open {
            Ok(())
        } else {
            Err(SessionError::NoFolderOpen)
        }
    }
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn open(&mut self, folder: &str) -> Result<(), SessionError> {
        self.log(format!("open {folder}"));
        self.open = true;
        Ok(())
    }

    async fn list(&mut self, filter: ListFilter) -> Result<Vec<MessageHandle>, SessionError> {
        self.require_open()?;
        self.log(format!("list {filter:?}"));
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(SessionError::CommandFailed {
                command: "UID SEARCH".into(),
                reason: "NO mailbox busy".into(),
            });
        }
        let mut ids: Vec<u32> = state
            .messages
            .iter()
            .filter(|m| filter == ListFilter::All || !m.seen)
            .map(|m| m.id)
            .collect();
        if filter == ListFilter::Unseen {
            ids.extend(state.duplicate_ids.iter().copied());
        }
        Ok(ids
            .into_iter()
            .map(|id| MessageHandle {
                size: state
                    .messages
                    .iter()
                    .find(|m| m.id == id)
                    .map(|m| m.content.len() as u32),
                ..MessageHandle::new(id)
            })
            .collect())
    }

    async fn fetch(&mut self, handle: &MessageHandle) -> Result<RawMessage, SessionError> {
        self.require_open()?;
        self.log(format!("fetch {}", handle.id));
        let mut state = self.state.lock().unwrap();
        let uid = handle.id.0;
        if state.drop_on_fetch.contains(&uid) {
            return Err(SessionError::Protocol("connection closed".into()));
        }
        if state.reject_fetch.contains(&uid) {
            return Err(SessionError::MessageNotFound { uid });
        }
        let content = state
            .messages
            .iter()
            .find(|m| m.id == uid)
            .map(|m| m.content.clone())
            .ok_or(SessionError::MessageNotFound { uid })?;
        if state.vanish_after_fetch.contains(&uid) {
            state.messages.retain(|m| m.id != uid);
        }
        Ok(RawMessage::new(uid, content))
    }

    async fn mark_read(&mut self, handle: &MessageHandle) -> Result<(), SessionError> {
        self.require_open()?;
        self.log(format!("seen {}", handle.id));
        let mut state = self.state.lock().unwrap();
        if state.apply_seen {
            if let Some(m) = state.messages.iter_mut().find(|m| m.id == handle.id.0) {
                m.seen = true;
            }
        }
        Ok(())
    }

    async fn mark_deleted(&mut self, handle: &MessageHandle) -> Result<(), SessionError> {
        self.require_open()?;
        self.log(format!("delete {}", handle.id));
        let mut state = self.state.lock().unwrap();
        if let Some(m) = state.messages.iter_mut().find(|m| m.id == handle.id.0) {
            m.deleted = true;
        }
        Ok(())
    }

    async fn close(&mut self, expunge: bool) -> Result<(), SessionError> {
        self.require_open()?;
        self.log(format!("close expunge={expunge}"));
        self.open = false;
        if expunge {
            self.state.lock().unwrap().messages.retain(|m| !m.deleted);
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        self.log("logout");
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open_sessions -= 1;
        }
    }
}

/// Hands out a fresh `FakeSession` per tick.
pub struct FakeConnector {
    pub mailbox: FakeMailbox,
    /// Artificial latency per connect, to widen any overlap window.
    pub delay: Duration,
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, SessionError> {
        let session = self.mailbox.session();
        tokio::time::sleep(self.delay).await;
        Ok(Box::new(session))
    }
}

/// Records the id of every message it receives.
#[derive(Default)]
pub struct RecordingHandler {
    pub received: Mutex<Vec<MessageId>>,
}

impl RecordingHandler {
    pub fn ids(&self) -> Vec<u32> {
        self.received.lock().unwrap().iter().map(|id| id.0).collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &RawMessage) {
        self.received.lock().unwrap().push(message.id);
    }
}

/// "Invoice" message with a plain-text part and a 10-byte PDF attachment.
pub const INVOICE: &str = "From: Billing <billing@example.com>
To: ap@example.com
Subject: Invoice
Message-ID: <inv-1@example.com>
MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=\"b1\"

--b1
Content-Type: text/plain; charset=utf-8

Hello
--b1
Content-Type: application/pdf; name=\"invoice.pdf\"
Content-Disposition: attachment; filename=\"invoice.pdf\"
Content-Transfer-Encoding: base64

JVBERi0xLjQK/w==
--b1--
";

/// Bytes of the `invoice.pdf` attachment in [`INVOICE`].
pub const INVOICE_PDF: &[u8] = b"%PDF-1.4\n\xff";

pub fn plain(subject: &str) -> String {
    format!(
        "From: a@example.com\nTo: b@example.com\nSubject: {subject}\nContent-Type: text/plain\n\nbody\n"
    )
}

/// Collects formatted log output so tests can assert on emitted lines.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Install a debug-level subscriber writing here for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
