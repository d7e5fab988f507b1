//! Error types for Mail Intake.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox session errors (connect, auth, list, fetch, store).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Command {command} rejected: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No folder is open")]
    NoFolderOpen,

    #[error("Message {uid} not found in folder")]
    MessageNotFound { uid: u32 },

    #[error("Tick timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session can no longer be used for this tick.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::Timeout(_)
        )
    }
}

/// Malformed message content. Local to one message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message {id} is empty")]
    Empty { id: String },

    #[error("Message {id} could not be decoded: {reason}")]
    Malformed { id: String, reason: String },
}

/// Filesystem failure for a single attachment.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Unsafe attachment name rejected: {name:?}")]
    UnsafeName { name: String },

    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
