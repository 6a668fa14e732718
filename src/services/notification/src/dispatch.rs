//! Dispatch service
//!
//! Owns the creation path (validate, gate on preferences, persist, publish)
//! and every write against a stored notification's status.

use chrono::{DateTime, Utc};
use dispatch_shared::{
    Channel, DeliveryOutcome, Notification, NotificationStatus, Priority, QueueMessage,
    StatusUpdate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{NotificationError, Result};
use crate::metrics::{MetricsRecorder, MetricsTimer};
use crate::preferences::PreferenceGate;
use crate::queue::QueueProducer;
use crate::store::{stored_timestamp, NotificationFilter, NotificationStore};

/// Failure metric label for `failed` statuses written through the API
const REPORTED_FAILURE: &str = "reported";

/// Inbound creation request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateNotificationRequest {
    #[validate(length(min = 1, max = 255))]
    pub user_id: String,

    #[validate(custom = "validate_channel")]
    pub channel: String,

    #[validate(length(min = 1, max = 500))]
    pub recipient: String,

    #[validate(length(max = 255))]
    #[serde(default)]
    pub subject: Option<String>,

    #[validate(length(min = 1), custom = "validate_not_blank")]
    pub body: String,

    /// 1 (high) to 3 (low); absent or 0 means medium
    #[validate(range(max = 3))]
    #[serde(default)]
    pub priority: Option<u8>,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn validate_channel(channel: &str) -> std::result::Result<(), ValidationError> {
    channel
        .parse::<Channel>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unsupported_channel"))
}

fn validate_not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Parse a path identifier; anything unparseable cannot name a notification
pub fn parse_notification_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| NotificationError::not_found(format!("notification {}", id)))
}

pub struct DispatchService {
    store: Arc<dyn NotificationStore>,
    gate: PreferenceGate,
    producer: Arc<dyn QueueProducer>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gate: PreferenceGate,
        producer: Arc<dyn QueueProducer>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            gate,
            producer,
            metrics,
        }
    }

    pub fn preferences(&self) -> &PreferenceGate {
        &self.gate
    }

    /// Create a notification and hand it to the queue when it is due.
    ///
    /// A publish failure after a successful insert is logged and the record
    /// stays `pending`.
    pub async fn create(&self, request: CreateNotificationRequest) -> Result<Notification> {
        request.validate()?;
        let channel: Channel = request.channel.parse()?;
        let priority = Priority::from_request(request.priority)?;
        let timer = MetricsTimer::start(channel, "create");

        let preference = self.gate.resolve(&request.user_id, channel).await?;
        if !preference.enabled {
            info!(
                user_id = %request.user_id,
                %channel,
                "Notification rejected by user preference"
            );
            return Err(NotificationError::preference_denied(
                request.user_id,
                channel.as_str(),
            ));
        }

        let now = stored_timestamp(Utc::now());
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            channel,
            recipient: request.recipient,
            subject: request.subject,
            body: request.body,
            priority,
            status: NotificationStatus::Pending,
            external_id: None,
            error_message: None,
            retry_count: 0,
            scheduled_at: request.scheduled_at.map(stored_timestamp),
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
            metadata: request.metadata,
        };

        self.store.insert(&notification).await?;
        self.metrics.record_created(channel);

        if notification.is_due(now) {
            let message = QueueMessage::from(&notification);
            if let Err(e) = self.producer.publish(&message).await {
                error!(
                    notification_id = %notification.id,
                    "Failed to publish notification, record left pending: {}", e
                );
            }
        } else {
            info!(
                notification_id = %notification.id,
                scheduled_at = ?notification.scheduled_at,
                "Notification scheduled for later, not published"
            );
        }

        timer.observe(self.metrics.as_ref());
        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            %channel,
            "Notification created"
        );
        Ok(notification)
    }

    pub async fn get(&self, id: &str) -> Result<Notification> {
        let id = parse_notification_id(id)?;
        self.store
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", id)))
    }

    pub async fn list_for_user(&self, filter: NotificationFilter) -> Result<Vec<Notification>> {
        self.store.list(&filter.normalized()).await
    }

    /// Administrative or provider-webhook status write
    pub async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Notification> {
        let id = parse_notification_id(id)?;
        self.write_status(id, &update, REPORTED_FAILURE).await
    }

    /// Fold a provider outcome into the stored record. `failure` is the error
    /// a failed outcome is reported as; its reason labels the failure metric.
    pub async fn apply_outcome(
        &self,
        outcome: &DeliveryOutcome,
        failure: Option<&NotificationError>,
    ) -> Result<Notification> {
        let update = StatusUpdate::from(outcome.clone());
        let reason = failure.map_or("provider", NotificationError::reason);
        self.write_status(outcome.notification_id, &update, reason).await
    }

    /// Cancel a notification that has not reached a terminal state
    pub async fn cancel(&self, id: &str) -> Result<Notification> {
        let current = self.get(id).await?;

        if !current.status.can_transition_to(NotificationStatus::Cancelled) {
            return Err(NotificationError::conflict(format!(
                "notification {} is {} and cannot be cancelled",
                current.id, current.status
            )));
        }

        let update = StatusUpdate {
            status: NotificationStatus::Cancelled,
            external_id: current.external_id.clone(),
            error_message: current.error_message.clone(),
        };
        self.write_status(current.id, &update, REPORTED_FAILURE).await
    }

    async fn write_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
        failure_reason: &str,
    ) -> Result<Notification> {
        let updated = self
            .store
            .update_status(id, update)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", id)))?;

        match update.status {
            NotificationStatus::Sent => self.metrics.record_sent(updated.channel),
            NotificationStatus::Delivered => self.metrics.record_delivered(updated.channel),
            NotificationStatus::Failed => self.metrics.record_failed(updated.channel, failure_reason),
            NotificationStatus::Pending | NotificationStatus::Cancelled => {}
        }

        if update.status == NotificationStatus::Failed {
            warn!(
                notification_id = %id,
                error = update.error_message.as_deref().unwrap_or_default(),
                "Notification marked failed"
            );
        } else {
            info!(notification_id = %id, status = %update.status, "Notification status updated");
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::preferences::InMemoryPreferenceCache;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct FailingProducer;

    #[async_trait]
    impl QueueProducer for FailingProducer {
        async fn publish(&self, _message: &QueueMessage) -> Result<()> {
            Err(NotificationError::queue("broker down"))
        }
    }

    fn request(channel: &str) -> CreateNotificationRequest {
        CreateNotificationRequest {
            user_id: "u1".to_string(),
            channel: channel.to_string(),
            recipient: "a@b.com".to_string(),
            subject: Some("Hello".to_string()),
            body: "hi".to_string(),
            priority: None,
            scheduled_at: None,
            metadata: HashMap::from([("order".to_string(), "42".to_string())]),
        }
    }

    fn service_with(producer: Arc<dyn QueueProducer>) -> (DispatchService, InMemoryStore) {
        let store = InMemoryStore::new();
        let gate = PreferenceGate::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryPreferenceCache::new()),
            Duration::from_secs(3600),
        );
        let service = DispatchService::new(
            Arc::new(store.clone()),
            gate,
            producer,
            Arc::new(NoopMetrics),
        );
        (service, store)
    }

    #[tokio::test]
    async fn test_create_defaults_priority_and_publishes() {
        let queue = InMemoryQueue::new(Duration::from_millis(10));
        let (service, _) = service_with(Arc::new(queue.clone()));

        let created = service.create(request("email")).await.unwrap();
        assert_eq!(created.status, NotificationStatus::Pending);
        assert_eq!(created.priority, Priority::Medium);

        let published = queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, created.id);
    }

    #[tokio::test]
    async fn test_timestamps_use_stored_precision() {
        let (service, _) = service_with(Arc::new(InMemoryQueue::new(Duration::from_millis(10))));

        let mut scheduled = request("sms");
        scheduled.scheduled_at = Some(Utc::now() + ChronoDuration::nanoseconds(123_456_789));
        let created = service.create(scheduled).await.unwrap();

        assert_eq!(created.created_at.timestamp_subsec_nanos() % 1_000, 0);
        assert_eq!(created.created_at, created.updated_at);
        assert_eq!(
            created.scheduled_at.map(|at| at.timestamp_subsec_nanos() % 1_000),
            Some(0)
        );

        let sent = service
            .update_status(
                &created.id.to_string(),
                StatusUpdate {
                    status: NotificationStatus::Sent,
                    external_id: None,
                    error_message: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(sent.sent_at.map(|at| at.timestamp_subsec_nanos() % 1_000), Some(0));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let (service, store) = service_with(Arc::new(InMemoryQueue::new(Duration::from_millis(10))));

        let err = service.create(request("fax")).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let mut blank = request("email");
        blank.body = "   ".to_string();
        assert!(service.create(blank).await.is_err());

        let mut bad_priority = request("email");
        bad_priority.priority = Some(7);
        assert!(service.create(bad_priority).await.is_err());

        assert_eq!(store.notification_count(), 0);
    }

    #[tokio::test]
    async fn test_future_schedule_is_not_published() {
        let queue = InMemoryQueue::new(Duration::from_millis(10));
        let (service, _) = service_with(Arc::new(queue.clone()));

        let mut later = request("sms");
        later.scheduled_at = Some(Utc::now() + ChronoDuration::hours(1));
        service.create(later).await.unwrap();

        let mut earlier = request("sms");
        earlier.scheduled_at = Some(Utc::now() - ChronoDuration::hours(1));
        service.create(earlier).await.unwrap();

        assert_eq!(queue.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_record() {
        let (service, store) = service_with(Arc::new(FailingProducer));

        let created = service.create(request("push")).await.unwrap();
        assert_eq!(store.notification_count(), 1);
        assert_eq!(
            service.get(&created.id.to_string()).await.unwrap().status,
            NotificationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_get_unparseable_id_is_not_found() {
        let (service, _) = service_with(Arc::new(FailingProducer));
        let err = service.get("not-a-uuid").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending_or_sent() {
        let (service, _) = service_with(Arc::new(FailingProducer));
        let created = service.create(request("email")).await.unwrap();
        let id = created.id.to_string();

        let cancelled = service.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, NotificationStatus::Cancelled);

        let err = service.cancel(&id).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_update_status_stamps_delivered_at() {
        let (service, _) = service_with(Arc::new(FailingProducer));
        let created = service.create(request("email")).await.unwrap();

        let updated = service
            .update_status(
                &created.id.to_string(),
                StatusUpdate::new(NotificationStatus::Delivered),
            )
            .await
            .unwrap();
        assert!(updated.delivered_at.is_some());

        let err = service
            .update_status(
                &Uuid::new_v4().to_string(),
                StatusUpdate::new(NotificationStatus::Sent),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
