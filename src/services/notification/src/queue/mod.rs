//! Durable queue between ingestion and the channel workers
//!
//! Producers publish [`QueueMessage`]s keyed by notification id. Each channel
//! worker consumes under its own consumer group, so every group sees every
//! message. Delivery is at-least-once: a message is acknowledged only after
//! its handler returned and the [`FailurePolicy`] has disposed of any error.

use async_trait::async_trait;
use dispatch_shared::QueueMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::{FailurePolicyKind, RetryConfig};
use crate::error::{NotificationError, Result};
use crate::metrics::MetricsRecorder;

pub mod memory;
pub mod redis_streams;

pub use memory::{InMemoryDeadLetters, InMemoryQueue};
pub use redis_streams::{RedisDeadLetterSink, RedisStreamQueue};

/// Processes one message pulled from the queue
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<()>;
}

/// Publishing side of the queue
#[async_trait]
pub trait QueueProducer: Send + Sync {
    /// Publish a message and wait for the broker to acknowledge it
    async fn publish(&self, message: &QueueMessage) -> Result<()>;
}

/// Consuming side of the queue, bound to one consumer group
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Pull and handle messages until `shutdown` is cancelled
    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Holding area for messages that exhausted their retries
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, message: &QueueMessage, error: &NotificationError) -> Result<()>;
}

/// What the consumer should do with a message once the policy is done with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and move on
    Ack,
    /// Leave unacknowledged so the message is redelivered
    Retain,
}

/// Decides how handler failures are treated
#[async_trait]
pub trait FailurePolicy: Send + Sync {
    async fn process(
        &self,
        handler: &dyn MessageHandler,
        message: &QueueMessage,
        shutdown: &CancellationToken,
    ) -> Disposition;
}

/// Log the failure and acknowledge the message
#[derive(Debug, Default, Clone)]
pub struct LogAndContinue;

#[async_trait]
impl FailurePolicy for LogAndContinue {
    async fn process(
        &self,
        handler: &dyn MessageHandler,
        message: &QueueMessage,
        _shutdown: &CancellationToken,
    ) -> Disposition {
        if let Err(e) = handler.handle(message).await {
            error!(
                notification_id = %message.id,
                channel = %message.channel,
                "Error handling message: {}", e
            );
        }
        Disposition::Ack
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Delay schedule for re-handling a message the policy retained
pub(crate) const REDELIVERY_BACKOFF: Backoff = Backoff {
    initial: Duration::from_millis(50),
    max: Duration::from_secs(30),
    multiplier: 2.0,
};

/// Sleep before redelivering a retained message. Returns `false` when
/// shutdown fired while waiting.
pub(crate) async fn wait_for_redelivery(retained: u32, shutdown: &CancellationToken) -> bool {
    let delay = REDELIVERY_BACKOFF.delay(retained);
    warn!("Message retained, redelivering in {:?}", delay);
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}

/// Retry retryable failures with backoff, then hand the message to a
/// dead-letter sink. Non-retryable failures are dead-lettered at once.
pub struct RetryThenDeadLetter {
    max_attempts: u32,
    backoff: Backoff,
    sink: Arc<dyn DeadLetterSink>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RetryThenDeadLetter {
    pub fn new(
        max_attempts: u32,
        backoff: Backoff,
        sink: Arc<dyn DeadLetterSink>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            sink,
            metrics,
        }
    }
}

#[async_trait]
impl FailurePolicy for RetryThenDeadLetter {
    async fn process(
        &self,
        handler: &dyn MessageHandler,
        message: &QueueMessage,
        shutdown: &CancellationToken,
    ) -> Disposition {
        let mut attempt = 1;

        let err = loop {
            let err = match handler.handle(message).await {
                Ok(()) => return Disposition::Ack,
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                break err;
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                notification_id = %message.id,
                attempt,
                "Handler failed, retrying in {:?}: {}", delay, err
            );
            self.metrics.record_retry(message.channel, err.reason());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Disposition::Retain,
            }
            attempt += 1;
        };

        error!(
            notification_id = %message.id,
            attempts = attempt,
            "Giving up on message: {}", err
        );

        match self.sink.dead_letter(message, &err).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(
                    notification_id = %message.id,
                    "Failed to dead-letter message, leaving it pending: {}", e
                );
                Disposition::Retain
            }
        }
    }
}

/// Build the failure policy selected by configuration
pub fn build_failure_policy(
    config: &RetryConfig,
    sink: Arc<dyn DeadLetterSink>,
    metrics: Arc<dyn MetricsRecorder>,
) -> Arc<dyn FailurePolicy> {
    match config.policy {
        FailurePolicyKind::LogAndContinue => Arc::new(LogAndContinue),
        FailurePolicyKind::RetryThenDeadLetter => Arc::new(RetryThenDeadLetter::new(
            config.max_attempts,
            Backoff {
                initial: Duration::from_millis(config.initial_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
                multiplier: config.backoff_multiplier,
            },
            sink,
            metrics,
        )),
    }
}
