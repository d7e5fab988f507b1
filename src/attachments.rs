//! Attachment persistence under `root / subfolder`.
//!
//! Provides:
//! - Idempotent creation of the target directory
//! - File name validation (a name must be a single plain path segment)
//! - Chunked, byte-exact copy of the attachment stream
//! - Removal of partially written files when the copy fails

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::mime::AttachmentPart;

/// Result of a successful [`AttachmentWriter::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The part had no usable name; nothing touched the filesystem.
    Skipped,
    Written { path: PathBuf, bytes: u64 },
}

/// Writes attachment streams to disk.
#[derive(Debug, Clone)]
pub struct AttachmentWriter {
    config: WriterConfig,
}

impl AttachmentWriter {
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    /// Directory attachments are written to.
    pub fn target_dir(&self) -> PathBuf {
        self.config.target_dir()
    }

    /// Persist one attachment. Existing files of the same name are replaced.
    pub async fn write(&self, part: AttachmentPart) -> Result<WriteOutcome, WriteError> {
        let Some(name) = part.file_name().map(str::to_string) else {
            debug!(content_type = %part.content_type, "Skipping attachment without a file name");
            return Ok(WriteOutcome::Skipped);
        };
        validate_file_name(&name)?;

        let dir = self.target_dir();
        ensure_dir(&dir).await?;

        let path = dir.join(&name);
        let bytes = self.copy(part, &path).await?;
        info!(path = %path.display(), bytes, "Attachment file saved");
        Ok(WriteOutcome::Written { path, bytes })
    }

    async fn copy(&self, part: AttachmentPart, path: &Path) -> Result<u64, WriteError> {
        let io_error = |source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = fs::File::create(path).await.map_err(io_error)?;
        let mut stream = part.into_stream();
        let mut buffer = vec![0u8; self.config.buffer_size.max(1)];

        let copied: std::io::Result<u64> = async {
            let mut total = 0u64;
            loop {
                let n = stream.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buffer[..n]).await?;
                total += n as u64;
            }
            file.flush().await?;
            Ok(total)
        }
        .await;

        match copied {
            Ok(total) => Ok(total),
            Err(source) => {
                drop(file);
                if let Err(e) = fs::remove_file(path).await {
                    debug!(path = %path.display(), error = %e, "Could not remove partial file");
                }
                Err(io_error(source))
            }
        }
    }
}

/// Create `path` (and parents) unless it already exists as a directory.
///
/// Succeeds when another writer created it first.
pub async fn ensure_dir(path: &Path) -> Result<(), WriteError> {
    if fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    match fs::create_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Created attachments directory");
            Ok(())
        }
        Err(source) => {
            if source.kind() == std::io::ErrorKind::AlreadyExists
                && fs::metadata(path).await.is_ok_and(|m| m.is_dir())
            {
                return Ok(());
            }
            Err(WriteError::CreateDir {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Accept only names that are exactly one normal path segment.
fn validate_file_name(name: &str) -> Result<(), WriteError> {
    let rejected = || WriteError::UnsafeName {
        name: name.to_string(),
    };
    if name.contains(['/', '\\', '\0']) {
        return Err(rejected());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(rejected()),
    }
}
