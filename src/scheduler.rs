//! Fixed-delay scheduler. Drives one poll tick at a time.
//!
//! Each tick connects a fresh session, runs [`MailboxPoller::poll`], and logs
//! out. The next tick starts `poll_interval` after the previous one finished,
//! so ticks never overlap. A tick that exceeds `tick_timeout` is abandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::error::SessionError;
use crate::mailbox::SessionConnector;
use crate::poller::{MailboxPoller, TickReport};

/// Spawn a background task that polls the mailbox on a fixed delay.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_poller(
    schedule: ScheduleConfig,
    connector: Arc<dyn SessionConnector>,
    poller: Arc<MailboxPoller>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Mail poller started, polling {} every {}ms",
            poller.config().folder,
            schedule.poll_interval.as_millis()
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Mail poller shutting down");
                return;
            }

            // Errors are logged inside; the next tick retries.
            let _ = run_tick(connector.as_ref(), &poller, schedule.tick_timeout).await;

            tokio::time::sleep(schedule.poll_interval).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single tick: connect → poll → logout, bounded by `timeout`.
pub async fn run_tick(
    connector: &dyn SessionConnector,
    poller: &MailboxPoller,
    timeout: Duration,
) -> Result<TickReport, SessionError> {
    let span = info_span!("tick", id = %Uuid::new_v4());

    let result = tokio::time::timeout(timeout, poll_with_session(connector, poller))
        .instrument(span)
        .await;

    match result {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(e)) => {
            error!("Mail poll failed: {e}");
            Err(e)
        }
        Err(_) => {
            error!("Mail poll abandoned after {timeout:?}");
            Err(SessionError::Timeout(timeout))
        }
    }
}

async fn poll_with_session(
    connector: &dyn SessionConnector,
    poller: &MailboxPoller,
) -> Result<TickReport, SessionError> {
    let mut session = connector.connect().await?;
    let outcome = poller.poll(session.as_mut()).await;
    if let Err(e) = session.logout().await {
        debug!("Logout failed: {e}");
    }
    outcome
}
