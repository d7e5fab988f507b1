//! Mail Intake — polls a mailbox, logs each new message, and saves its attachments.

pub mod attachments;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod mime;
pub mod poller;
pub mod processor;
pub mod scheduler;
