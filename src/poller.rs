//! Mailbox poller: one pass over the watched folder per scheduler tick.
//!
//! A tick:
//! 1. Opens the folder
//! 2. Lists unseen messages (reduced fetch profile) and drops duplicate ids
//!    and messages over the size limit
//! 3. For each message: fetch → mark \Seen → hand to the processor → flag \Deleted
//! 4. Closes the folder on every exit path, expunging only when deletion is enabled
//!
//! Dedup state lives for a single tick. A message re-delivered on a later tick
//! is processed again (at-least-once).

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{PollStrategy, PollerConfig};
use crate::error::SessionError;
use crate::mailbox::{ListFilter, MailboxSession, MessageHandle, MessageId, RawMessage};
use crate::processor::MessageHandler;

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries returned by the listing, duplicates included.
    pub listed: usize,
    /// Listing entries dropped because their id was already queued.
    pub duplicates: usize,
    /// Messages handed to the processor.
    pub delivered: usize,
    /// Messages whose fetch failed or that exceeded the size limit; they stay
    /// unseen for the next tick.
    pub fetch_failures: usize,
    /// Messages left for later ticks by the fetch cap.
    pub deferred: usize,
    /// Re-list strategy only: fetched messages no longer present in the folder.
    pub vanished: usize,
}

/// Drives one folder pass per tick and forwards messages to a handler.
pub struct MailboxPoller {
    config: PollerConfig,
    handler: Arc<dyn MessageHandler>,
}

impl MailboxPoller {
    pub fn new(config: PollerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self { config, handler }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Direct strategy: forward a message the scheduler already fetched.
    pub async fn deliver(&self, message: &RawMessage) {
        self.handler.handle(message).await;
    }

    /// Re-list strategy: list the whole folder and process `delivered` only if
    /// its id is present. Repeated matches still yield a single invocation.
    ///
    /// Returns whether the message was processed.
    pub async fn relist_and_match(
        &self,
        session: &mut dyn MailboxSession,
        delivered: &RawMessage,
    ) -> Result<bool, SessionError> {
        let listing = session.list(ListFilter::All).await?;
        if listing.iter().any(|h| h.id == delivered.id) {
            self.handler.handle(delivered).await;
            Ok(true)
        } else {
            debug!(uid = %delivered.id, "Delivered message no longer in folder");
            Ok(false)
        }
    }

    /// Run one tick against an authenticated session.
    ///
    /// The folder is closed whether or not the pass succeeds.
    pub async fn poll(&self, session: &mut dyn MailboxSession) -> Result<TickReport, SessionError> {
        session.open(&self.config.folder).await?;

        let outcome = self.drain(session).await;

        let expunge = self.config.delete_processed;
        if let Err(e) = session.close(expunge).await {
            warn!(folder = %self.config.folder, expunge, error = %e, "Failed to close folder");
        }

        if let Ok(report) = &outcome
            && report.delivered > 0
        {
            info!(
                folder = %self.config.folder,
                delivered = report.delivered,
                "Processed {} new message(s)",
                report.delivered
            );
        }
        outcome
    }

    async fn drain(&self, session: &mut dyn MailboxSession) -> Result<TickReport, SessionError> {
        let listing = session.list(ListFilter::Unseen).await?;
        let mut report = TickReport {
            listed: listing.len(),
            ..TickReport::default()
        };

        let mut queue = dedup(listing, &mut report);
        if let Some(max) = self.config.max_fetch_size
            && queue.len() > max
        {
            report.deferred = queue.len() - max;
            queue.truncate(max);
        }

        for handle in &queue {
            if let Some(size) = handle.size
                && size as usize > self.config.max_message_size
            {
                warn!(
                    uid = %handle.id,
                    size,
                    limit = self.config.max_message_size,
                    "Message too large, skipping"
                );
                report.fetch_failures += 1;
                continue;
            }

            let message = match session.fetch(handle).await {
                Ok(message) => message,
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => {
                    warn!(uid = %handle.id, error = %e, "Failed to fetch message");
                    report.fetch_failures += 1;
                    continue;
                }
            };

            if self.config.mark_read {
                self.flag(session.mark_read(handle).await, handle, "\\Seen")?;
            }

            match self.config.strategy {
                PollStrategy::Direct => self.deliver(&message).await,
                PollStrategy::Relist => {
                    if !self.relist_and_match(session, &message).await? {
                        report.vanished += 1;
                        continue;
                    }
                }
            }
            report.delivered += 1;

            if self.config.delete_processed {
                self.flag(session.mark_deleted(handle).await, handle, "\\Deleted")?;
            }
        }

        debug!(?report, "Tick finished");
        Ok(report)
    }

    /// Flag failures are per message unless the connection is gone.
    fn flag(
        &self,
        result: Result<(), SessionError>,
        handle: &MessageHandle,
        flag: &str,
    ) -> Result<(), SessionError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                warn!(uid = %handle.id, flag, error = %e, "Failed to set flag");
                Ok(())
            }
        }
    }
}

/// Keep the first occurrence of each id, preserving listing order.
fn dedup(listing: Vec<MessageHandle>, report: &mut TickReport) -> Vec<MessageHandle> {
    let mut seen: HashSet<MessageId> = HashSet::with_capacity(listing.len());
    listing
        .into_iter()
        .filter(|handle| {
            let fresh = seen.insert(handle.id);
            if !fresh {
                report.duplicates += 1;
            }
            fresh
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let listing = vec![
            MessageHandle::new(3),
            MessageHandle::new(1),
            MessageHandle::new(3),
            MessageHandle::new(2),
            MessageHandle::new(1),
        ];
        let mut report = TickReport::default();
        let queue = dedup(listing, &mut report);
        let ids: Vec<u32> = queue.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(report.duplicates, 2);
    }

    #[test]
    fn connection_loss_classification() {
        assert!(SessionError::Protocol("eof".into()).is_connection_lost());
        assert!(!SessionError::MessageNotFound { uid: 1 }.is_connection_lost());
        assert!(
            !SessionError::CommandFailed {
                command: "UID STORE".into(),
                reason: "NO".into()
            }
            .is_connection_lost()
        );
    }
}
