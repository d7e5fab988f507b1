use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_intake::attachments::AttachmentWriter;
use mail_intake::config::IntakeConfig;
use mail_intake::mailbox::ImapConnector;
use mail_intake::poller::MailboxPoller;
use mail_intake::processor::MessageProcessor;
use mail_intake::scheduler::spawn_poller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = IntakeConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Mail Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Mailbox: {}:{} ({})",
        config.mailbox.host,
        config.mailbox.port,
        config.mailbox.protocol.scheme()
    );
    eprintln!("   Folder: {}", config.poller.folder);
    eprintln!("   Attachments: {}", config.writer.target_dir().display());
    eprintln!(
        "   Policies: mark-read={}, delete={}, strategy={:?}\n",
        config.poller.mark_read, config.poller.delete_processed, config.poller.strategy
    );
    tracing::debug!(
        "IMAP url: {}",
        config.mailbox.masked_url(&config.poller.folder)
    );

    let processor = Arc::new(MessageProcessor::new(AttachmentWriter::new(
        config.writer.clone(),
    )));
    let poller = Arc::new(MailboxPoller::new(config.poller.clone(), processor));
    let connector = Arc::new(ImapConnector::new(config.mailbox.clone()));

    let (handle, shutdown) = spawn_poller(config.schedule, connector, poller);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing current tick");
    shutdown.store(true, Ordering::Relaxed);
    handle.await?;

    Ok(())
}

/// Stdout logging, plus a daily-rolling file when `MAIL_INTAKE_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("MAIL_INTAKE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "mail-intake.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(file_writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            None
        }
    }
}
