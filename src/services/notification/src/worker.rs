//! Channel worker
//!
//! One [`DispatchWorker`] runs per channel. It ignores queue messages for
//! other channels, re-reads the full record from the store, routes it through
//! the [`ChannelRegistry`] and persists the outcome.

use async_trait::async_trait;
use dispatch_shared::{Channel, NotificationStatus, QueueMessage};
use std::sync::Arc;
use tracing::{debug, info};

use crate::channels::ChannelRegistry;
use crate::dispatch::DispatchService;
use crate::error::{NotificationError, Result};
use crate::metrics::{MetricsRecorder, MetricsTimer};
use crate::queue::MessageHandler;
use crate::store::NotificationStore;

pub struct DispatchWorker {
    channel: Channel,
    store: Arc<dyn NotificationStore>,
    registry: ChannelRegistry,
    dispatch: Arc<DispatchService>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl DispatchWorker {
    pub fn new(
        channel: Channel,
        store: Arc<dyn NotificationStore>,
        registry: ChannelRegistry,
        dispatch: Arc<DispatchService>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
            dispatch,
            metrics,
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchWorker {
    /// A `failed` outcome is persisted first and then reported as an error so
    /// the consumer's failure policy sees it.
    async fn handle(&self, message: &QueueMessage) -> Result<()> {
        if message.channel != self.channel {
            debug!(
                notification_id = %message.id,
                channel = %message.channel,
                "Skipping message for another channel"
            );
            return Ok(());
        }

        let timer = MetricsTimer::start(self.channel, "handle");

        let notification = self
            .store
            .get(message.id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", message.id)))?;

        if notification.status == NotificationStatus::Cancelled {
            info!(notification_id = %notification.id, "Notification was cancelled, not sending");
            return Ok(());
        }

        let send_timer = MetricsTimer::start(self.channel, "send");
        let outcome = self.registry.route(&notification).await;
        send_timer.observe(self.metrics.as_ref());

        let failure = outcome.is_failed().then(|| {
            if self.registry.supports(notification.channel) {
                NotificationError::provider(
                    notification.channel.as_str(),
                    outcome.error_message.clone().unwrap_or_default(),
                )
            } else {
                NotificationError::unsupported_channel(notification.channel.as_str())
            }
        });

        self.dispatch.apply_outcome(&outcome, failure.as_ref()).await?;
        timer.observe(self.metrics.as_ref());

        match failure {
            Some(err) => Err(err),
            None => {
                info!(
                    notification_id = %notification.id,
                    external_id = outcome.external_id.as_deref().unwrap_or_default(),
                    "Notification sent"
                );
                Ok(())
            }
        }
    }
}
