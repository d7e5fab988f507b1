//! Per-message processing: decode, log, persist attachments.
//!
//! Nothing here propagates an error. A message that cannot be decoded is
//! logged and dropped for this cycle; a failed attachment is logged and its
//! siblings are still written.

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use crate::attachments::{AttachmentWriter, WriteOutcome};
use crate::mailbox::{MessageId, RawMessage};
use crate::mime::{AttachmentPart, MimeDecoder, ParsedMessage};

/// Receives each message the poller retrieves.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &RawMessage);
}

/// What happened to one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Whether the message decoded at all.
    pub decoded: bool,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Decodes messages and writes their attachments.
#[derive(Debug, Clone)]
pub struct MessageProcessor {
    decoder: MimeDecoder,
    writer: AttachmentWriter,
}

impl MessageProcessor {
    pub fn new(writer: AttachmentWriter) -> Self {
        Self {
            decoder: MimeDecoder::new(),
            writer,
        }
    }

    /// Process one message, best effort.
    pub async fn process(&self, message: &RawMessage) -> ProcessSummary {
        let parsed = match self.decoder.decode(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(uid = %message.id, error = ?e, "Failed to decode message: {e}");
                return ProcessSummary::default();
            }
        };

        debug!(uid = %message.id, "{}", summary_line(&parsed));
        match &parsed.plain_body {
            Some(body) => trace!(uid = %message.id, "Mail content: {body}"),
            None if parsed.html_body.is_some() => {
                trace!(uid = %message.id, "Mail has no plain-text part (HTML only)")
            }
            None => trace!(uid = %message.id, "Mail has no plain-text part"),
        }

        let mut summary = self
            .store_attachments(message.id, parsed.attachments)
            .await;
        summary.decoded = true;
        summary
    }

    /// Write each attachment independently, in order.
    pub async fn store_attachments(
        &self,
        id: MessageId,
        attachments: Vec<AttachmentPart>,
    ) -> ProcessSummary {
        debug!(uid = %id, "Email has {} attachment files", attachments.len());

        let mut summary = ProcessSummary::default();
        for part in attachments {
            let name = part.name.clone();
            match self.writer.write(part).await {
                Ok(WriteOutcome::Written { .. }) => summary.written += 1,
                Ok(WriteOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    warn!(uid = %id, attachment = ?name, error = %e, "Failed to save attachment");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[async_trait]
impl MessageHandler for MessageProcessor {
    async fn handle(&self, message: &RawMessage) {
        let summary = self.process(message).await;
        if summary.failed > 0 {
            warn!(
                uid = %message.id,
                failed = summary.failed,
                written = summary.written,
                "Message processed with attachment failures"
            );
        }
    }
}

/// One-line header summary used in the processing log.
pub fn summary_line(parsed: &ParsedMessage) -> String {
    format!(
        "From: {} To: {} Subject: {}",
        parsed.from,
        parsed.to.join(", "),
        parsed.subject
    )
}
