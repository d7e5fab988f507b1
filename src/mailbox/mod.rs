//! Mailbox session seam: the folder operations the poller needs, plus an IMAP
//! implementation of them.

pub mod imap;
pub mod stream;

use std::fmt;

use async_trait::async_trait;

use crate::error::SessionError;

pub use imap::{ImapConnector, ImapSession};

/// Largest message the session will materialize, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Mailbox-assigned identifier of a message, stable for its lifetime in the folder.
///
/// For IMAP this is the message UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lightweight listing entry, populated from the reduced fetch profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub id: MessageId,
    /// Whether the `\Seen` flag was set when listed.
    pub seen: bool,
    /// Server-reported size in bytes, when known.
    pub size: Option<u32>,
}

impl MessageHandle {
    pub fn new(id: u32) -> Self {
        Self {
            id: MessageId(id),
            seen: false,
            size: None,
        }
    }
}

/// A fully fetched message: its id and the raw RFC 5322 bytes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub content: Vec<u8>,
}

impl RawMessage {
    pub fn new(id: u32, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId(id),
            content: content.into(),
        }
    }
}

/// Which messages `list` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// Messages without the `\Seen` flag.
    Unseen,
    /// Every message in the folder.
    All,
}

/// A connected, authenticated session scoped to one open folder at a time.
#[async_trait]
pub trait MailboxSession: Send {
    /// Open `folder` read-write.
    async fn open(&mut self, folder: &str) -> Result<(), SessionError>;

    /// List messages in the open folder, in mailbox order.
    async fn list(&mut self, filter: ListFilter) -> Result<Vec<MessageHandle>, SessionError>;

    /// Materialize the full content of one message without marking it read.
    async fn fetch(&mut self, handle: &MessageHandle) -> Result<RawMessage, SessionError>;

    /// Set the `\Seen` flag.
    async fn mark_read(&mut self, handle: &MessageHandle) -> Result<(), SessionError>;

    /// Set the `\Deleted` flag. Takes effect on `close(true)`.
    async fn mark_deleted(&mut self, handle: &MessageHandle) -> Result<(), SessionError>;

    /// Close the open folder, expunging deleted messages when `expunge` is set.
    async fn close(&mut self, expunge: bool) -> Result<(), SessionError>;

    /// End the session.
    async fn logout(&mut self) -> Result<(), SessionError>;
}

/// Produces a fresh session for each tick.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, SessionError>;
}
