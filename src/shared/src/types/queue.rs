//! Queue envelope and delivery outcome

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::{Channel, Notification, NotificationStatus, Priority, StatusUpdate};

/// Reduced projection of a [`Notification`] put on the queue.
///
/// Carries no status; workers re-read the authoritative record from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Messages are partitioned by notification id.
    pub fn partition_key(&self) -> String {
        self.id.to_string()
    }
}

impl From<&Notification> for QueueMessage {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            user_id: n.user_id.clone(),
            channel: n.channel,
            recipient: n.recipient.clone(),
            subject: n.subject.clone(),
            body: n.body.clone(),
            metadata: n.metadata.clone(),
            priority: n.priority,
            created_at: n.created_at,
        }
    }
}

/// Result of one provider send attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeliveryOutcome {
    pub fn sent(notification_id: Uuid, external_id: Option<String>) -> Self {
        Self {
            notification_id,
            status: NotificationStatus::Sent,
            external_id,
            error_message: None,
        }
    }

    pub fn failed(notification_id: Uuid, error_message: impl Into<String>) -> Self {
        Self {
            notification_id,
            status: NotificationStatus::Failed,
            external_id: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == NotificationStatus::Failed
    }
}

impl From<DeliveryOutcome> for StatusUpdate {
    fn from(outcome: DeliveryOutcome) -> Self {
        Self {
            status: outcome.status,
            external_id: outcome.external_id,
            error_message: outcome.error_message,
        }
    }
}
