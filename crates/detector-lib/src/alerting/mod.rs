//! Alert gating, deduplication and delivery
//!
//! This module provides:
//! - The tiered duration gate deciding when a detection becomes an alert
//! - Hourly deduplication backed by an in-process set and a durable table
//! - A bounded dispatch pool with an explicit drain
//! - Notification delivery with transport and server-error retries

mod alert;
mod dedup;
mod dispatcher;
mod gate;
mod notifier;

pub use alert::{format_bytes, format_count, Alert};
pub use dedup::{AlertDeduplicator, SentAlertRecord};
pub use dispatcher::{AlertDispatcher, DispatchError, DrainReport};
pub use gate::{AlertContext, AlertGate};
pub use notifier::{DeliveryPolicy, NotificationSink, Notifier, TelegramSink, TELEGRAM_API_BASE};
