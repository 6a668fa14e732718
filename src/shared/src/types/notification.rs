//! Notification entity and its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// Delivery medium for a notification.
///
/// Adding a channel means adding a variant here plus a provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            other => Err(ParseEnumError::new("channel", other)),
        }
    }
}

/// Lifecycle status of a notification.
///
/// `pending -> sent -> delivered`, `pending -> failed`,
/// `pending | sent -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether `next` is a forward move along the lifecycle graph.
    ///
    /// The store does not enforce this; status writes are last-write-wins.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Sent, Delivered)
                | (Sent, Cancelled)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

/// Dispatch priority, carried on the wire as 1 (high), 2 (medium), 3 (low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn code(&self) -> u8 {
        match self {
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Maps a request priority to a `Priority`, where zero means "unset".
    pub fn from_request(code: Option<u8>) -> Result<Self, ParseEnumError> {
        match code {
            None | Some(0) => Ok(Self::default()),
            Some(code) => Self::try_from(code),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.code()
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseEnumError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::High),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Low),
            other => Err(ParseEnumError::new("priority", other.to_string())),
        }
    }
}

/// The unit of work: one message to one recipient over one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Notification {
    /// Whether the notification should be handed to the queue at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Overwrites status, external id and error message with `update`.
    ///
    /// `sent_at` / `delivered_at` are stamped the first time their status is
    /// reached and kept afterwards, so replaying an update changes nothing
    /// but `updated_at`.
    pub fn apply_status(&mut self, update: &StatusUpdate, at: DateTime<Utc>) {
        self.status = update.status;
        self.external_id = update.external_id.clone();
        self.error_message = update.error_message.clone();
        self.updated_at = at;

        match update.status {
            NotificationStatus::Sent => {
                self.sent_at.get_or_insert(at);
            }
            NotificationStatus::Delivered => {
                self.delivered_at.get_or_insert(at);
            }
            _ => {}
        }
    }
}

/// A status write against a stored notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: NotificationStatus) -> Self {
        Self {
            status,
            external_id: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn notification() -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: Channel::Email,
            recipient: "a@b.com".to_string(),
            subject: None,
            body: "hi".to_string(),
            priority: Priority::Medium,
            status: NotificationStatus::Pending,
            external_id: None,
            error_message: None,
            retry_count: 0,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_channel_round_trips_through_str() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        let err = "fax".parse::<Channel>().unwrap_err();
        assert_eq!(err.to_string(), "unknown channel: fax");
    }

    #[test]
    fn test_lifecycle_graph() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Cancelled));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Sent));
    }

    #[test]
    fn test_priority_wire_format() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Priority>("3").unwrap(), Priority::Low);
        assert!(serde_json::from_str::<Priority>("7").is_err());
        assert_eq!(Priority::from_request(None).unwrap(), Priority::Medium);
        assert_eq!(Priority::from_request(Some(0)).unwrap(), Priority::Medium);
        assert_eq!(Priority::from_request(Some(1)).unwrap(), Priority::High);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut n = notification();
        assert!(n.is_due(now));
        n.scheduled_at = Some(now - Duration::minutes(5));
        assert!(n.is_due(now));
        n.scheduled_at = Some(now + Duration::minutes(5));
        assert!(!n.is_due(now));
    }

    #[test]
    fn test_apply_status_is_idempotent() {
        let mut once = notification();
        let update = StatusUpdate {
            status: NotificationStatus::Sent,
            external_id: Some("ext-1".to_string()),
            error_message: None,
        };
        let first = Utc::now();
        once.apply_status(&update, first);

        let mut twice = once.clone();
        twice.apply_status(&update, first + Duration::seconds(10));
        twice.updated_at = once.updated_at;

        assert_eq!(once, twice);
        assert_eq!(once.sent_at, Some(first));
    }

    #[test]
    fn test_apply_status_last_write_wins() {
        let mut n = notification();
        let now = Utc::now();
        n.apply_status(
            &StatusUpdate {
                status: NotificationStatus::Sent,
                external_id: Some("ext-1".to_string()),
                error_message: None,
            },
            now,
        );
        n.apply_status(
            &StatusUpdate {
                status: NotificationStatus::Failed,
                external_id: None,
                error_message: Some("bounced".to_string()),
            },
            now,
        );

        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.external_id, None);
        assert_eq!(n.error_message.as_deref(), Some("bounced"));
    }
}
