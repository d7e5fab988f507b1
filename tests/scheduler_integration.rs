//! Integration tests for the fixed-delay scheduler against the in-memory mailbox.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::timeout;

use common::{FakeConnector, FakeMailbox, RecordingHandler, TEST_TIMEOUT, plain};
use mail_intake::config::{PollerConfig, ScheduleConfig};
use mail_intake::poller::MailboxPoller;
use mail_intake::scheduler::{run_tick, spawn_poller};

#[tokio::test]
async fn tick_connects_polls_and_logs_out() {
    let mailbox = FakeMailbox::new();
    mailbox.add(4, &plain("Hello"));
    let connector = FakeConnector {
        mailbox: mailbox.clone(),
        delay: Duration::ZERO,
    };
    let handler = Arc::new(RecordingHandler::default());
    let poller = MailboxPoller::new(PollerConfig::default(), handler.clone());

    let report = run_tick(&connector, &poller, TEST_TIMEOUT).await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(handler.ids(), vec![4]);
    assert_eq!(mailbox.calls().last().unwrap(), "logout");
}

#[tokio::test]
async fn ticks_never_overlap_and_new_mail_is_picked_up() {
    let mailbox = FakeMailbox::new();
    mailbox.add(1, &plain("Early"));
    let connector = Arc::new(FakeConnector {
        mailbox: mailbox.clone(),
        delay: Duration::from_millis(15),
    });
    let handler = Arc::new(RecordingHandler::default());
    let poller = Arc::new(MailboxPoller::new(PollerConfig::default(), handler.clone()));
    let schedule = ScheduleConfig {
        poll_interval: Duration::from_millis(1),
        tick_timeout: TEST_TIMEOUT,
    };

    let (handle, shutdown) = spawn_poller(schedule, connector, poller);

    timeout(TEST_TIMEOUT, async {
        while handler.ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first message never delivered");

    mailbox.add(2, &plain("Late"));
    timeout(TEST_TIMEOUT, async {
        while handler.ids().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second message never delivered");

    shutdown.store(true, Ordering::Relaxed);
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

    assert_eq!(handler.ids(), vec![1, 2]);
    assert_eq!(mailbox.with(|s| s.max_open_sessions), 1);
}
