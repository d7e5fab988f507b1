//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::mailbox::MAX_MESSAGE_SIZE;

/// Default poll delay: 5 seconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default overall budget for one tick.
const DEFAULT_TICK_TIMEOUT_SECS: u64 = 120;

/// Default attachments subfolder under the root.
pub const DEFAULT_ATTACHMENTS_SUBFOLDER: &str = "data";

/// Default copy chunk size.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 8192;

/// Wire scheme used to reach the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// IMAP over implicit TLS.
    Imaps,
    /// Plaintext IMAP.
    Imap,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Imaps => "imaps",
            Self::Imap => "imap",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imaps" => Ok(Self::Imaps),
            "imap" => Ok(Self::Imap),
            other => Err(format!("unknown protocol '{other}' (expected imaps or imap)")),
        }
    }
}

/// How the poller finds the messages it hands to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStrategy {
    /// Forward each fetched message straight to the processor.
    #[default]
    Direct,
    /// Re-list the folder and match the delivered message by id before processing.
    Relist,
}

impl FromStr for PollStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "relist" => Ok(Self::Relist),
            other => Err(format!("unknown strategy '{other}' (expected direct or relist)")),
        }
    }
}

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: String,
    pub password: SecretString,
}

impl MailboxConfig {
    /// Mailbox URL for diagnostics, with the password masked.
    pub fn masked_url(&self, folder: &str) -> String {
        let url = format!(
            "{}://{}:{}@{}:{}/{}",
            self.protocol.scheme(),
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            folder
        );
        let secret = self.password.expose_secret();
        if secret.is_empty() {
            url
        } else {
            url.replace(secret, &"x".repeat(8))
        }
    }
}

/// Where and how attachments are written.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Attachments root directory.
    pub root: PathBuf,
    /// Fixed subfolder under `root`.
    pub subfolder: String,
    /// Copy chunk size in bytes (at least 1).
    pub buffer_size: usize,
}

impl WriterConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subfolder: DEFAULT_ATTACHMENTS_SUBFOLDER.to_string(),
            buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }

    /// Directory attachments land in: `root / subfolder`.
    pub fn target_dir(&self) -> PathBuf {
        self.root.join(&self.subfolder)
    }
}

/// Per-tick mailbox policies.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub folder: String,
    pub mark_read: bool,
    pub delete_processed: bool,
    /// Cap on messages handled per tick. `None` means unlimited.
    pub max_fetch_size: Option<usize>,
    /// Listed messages larger than this are skipped without fetching.
    pub max_message_size: usize,
    pub strategy: PollStrategy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            mark_read: true,
            delete_processed: false,
            max_fetch_size: None,
            max_message_size: MAX_MESSAGE_SIZE,
            strategy: PollStrategy::Direct,
        }
    }
}

/// Scheduler timing.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    /// Fixed delay between ticks.
    pub poll_interval: Duration,
    /// Overall budget for a single tick.
    pub tick_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            tick_timeout: Duration::from_secs(DEFAULT_TICK_TIMEOUT_SECS),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub mailbox: MailboxConfig,
    pub writer: WriterConfig,
    pub poller: PollerConfig,
    pub schedule: ScheduleConfig,
}

impl IntakeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let host = required("MAIL_IMAP_HOST")?;
        let username = required("MAIL_USERNAME")?;
        let password = SecretString::from(required("MAIL_PASSWORD")?);

        let protocol: Protocol = parse_or(&lookup, "MAIL_IMAP_PROTOCOL", Protocol::Imaps)?;
        let default_port = match protocol {
            Protocol::Imaps => 993,
            Protocol::Imap => 143,
        };
        let port: u16 = parse_or(&lookup, "MAIL_IMAP_PORT", default_port)?;

        let root = match lookup("MAIL_ATTACHMENTS_ROOT") {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                key: "MAIL_ATTACHMENTS_ROOT".into(),
                message: format!("no root given and current directory unavailable: {e}"),
            })?,
        };
        let subfolder = lookup("MAIL_ATTACHMENTS_SUBFOLDER")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ATTACHMENTS_SUBFOLDER.to_string());
        let buffer_size: usize =
            parse_or(&lookup, "MAIL_COPY_BUFFER_SIZE", DEFAULT_COPY_BUFFER_SIZE)?;
        if buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_COPY_BUFFER_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }

        let folder = lookup("MAIL_FOLDER")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "INBOX".to_string());
        let max_fetch: usize = parse_or(&lookup, "MAIL_MAX_FETCH_SIZE", 0)?;

        let poll_ms: u64 = parse_or(&lookup, "MAIL_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_POLL_INTERVAL_MS".into(),
                message: "must be greater than zero".into(),
            });
        }
        let timeout_secs: u64 =
            parse_or(&lookup, "MAIL_TICK_TIMEOUT_SECS", DEFAULT_TICK_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_TICK_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let max_message_size: usize =
            parse_or(&lookup, "MAIL_MAX_MESSAGE_SIZE", MAX_MESSAGE_SIZE)?;
        if max_message_size == 0 || max_message_size > MAX_MESSAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_MAX_MESSAGE_SIZE".into(),
                message: format!("must be between 1 and {MAX_MESSAGE_SIZE}"),
            });
        }

        Ok(Self {
            mailbox: MailboxConfig {
                host,
                port,
                protocol,
                username,
                password,
            },
            writer: WriterConfig {
                root,
                subfolder,
                buffer_size,
            },
            poller: PollerConfig {
                folder,
                mark_read: parse_bool_or(&lookup, "MAIL_MARK_READ", true)?,
                delete_processed: parse_bool_or(&lookup, "MAIL_DELETE_PROCESSED", false)?,
                max_fetch_size: (max_fetch > 0).then_some(max_fetch),
                max_message_size,
                strategy: parse_or(&lookup, "MAIL_POLL_STRATEGY", PollStrategy::Direct)?,
            },
            schedule: ScheduleConfig {
                poll_interval: Duration::from_millis(poll_ms),
                tick_timeout: Duration::from_secs(timeout_secs),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
        _ => Ok(default),
    }
}
