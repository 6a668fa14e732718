//! Shared type definitions for the notification dispatch pipeline

pub mod notification;
pub mod preference;
pub mod queue;

use thiserror::Error;

pub use notification::{Channel, Notification, NotificationStatus, Priority, StatusUpdate};
pub use preference::{Frequency, Preference};
pub use queue::{DeliveryOutcome, QueueMessage};

/// Error returned when a wire value does not name a known enum variant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
