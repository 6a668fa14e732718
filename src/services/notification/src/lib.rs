//! # Notification Dispatch
//!
//! Asynchronous multi-channel notification pipeline:
//! - HTTP ingestion that validates requests, checks user preferences,
//!   persists a `pending` record and publishes it to a durable queue
//! - Per-channel workers that consume the queue, send through the provider
//!   adapter for their channel (SMTP, Twilio, FCM) and persist the outcome
//! - Prometheus metrics and structured logging throughout
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notification_dispatch::{NotificationConfig, NotificationService};
//! use notification_dispatch::dispatch::CreateNotificationRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NotificationConfig::from_env()?;
//!     let service = NotificationService::new(config).await?;
//!
//!     let request = CreateNotificationRequest {
//!         user_id: "user123".to_string(),
//!         channel: "email".to_string(),
//!         recipient: "user@example.com".to_string(),
//!         subject: Some("Welcome".to_string()),
//!         body: "Thanks for signing up.".to_string(),
//!         priority: None,
//!         scheduled_at: None,
//!         metadata: Default::default(),
//!     };
//!
//!     let notification = service.dispatch().create(request).await?;
//!     println!("Notification queued: {}", notification.id);
//!
//!     Ok(())
//! }
//! ```

use axum::Router;
use dispatch_shared::Channel;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod preferences;
pub mod queue;
pub mod routes;
pub mod store;
pub mod worker;

pub use crate::config::NotificationConfig;
pub use error::{NotificationError, Result};

pub use dispatch_shared::{
    DeliveryOutcome, Frequency, Notification, NotificationStatus, Preference, Priority,
    QueueMessage, StatusUpdate,
};

use crate::config::{QueueBackend, StoreBackend};
use dispatch::DispatchService;
use handlers::AppState;
use metrics::{build_recorder, MetricsRecorder};
use preferences::PreferenceGate;
use queue::{
    build_failure_policy, DeadLetterSink, InMemoryDeadLetters, InMemoryQueue, QueueConsumer,
    QueueProducer, RedisStreamQueue,
};
use store::{InMemoryStore, NotificationStore, PostgresStore, PreferenceStore};
use worker::DispatchWorker;

/// Queue backend selected by configuration
#[derive(Clone)]
enum QueueHandle {
    Redis(RedisStreamQueue),
    Memory(InMemoryQueue),
}

impl QueueHandle {
    fn producer(&self) -> Arc<dyn QueueProducer> {
        match self {
            QueueHandle::Redis(queue) => Arc::new(queue.clone()),
            QueueHandle::Memory(queue) => Arc::new(queue.clone()),
        }
    }
}

/// Wires the store, cache, queue and metrics recorder selected by
/// configuration into a [`DispatchService`]
#[derive(Clone)]
pub struct NotificationService {
    config: NotificationConfig,
    store: Arc<dyn NotificationStore>,
    queue: QueueHandle,
    metrics: Arc<dyn MetricsRecorder>,
    dispatch: Arc<DispatchService>,
}

impl NotificationService {
    /// Connect every backend named in `config`
    pub async fn new(config: NotificationConfig) -> Result<Self> {
        info!("Initializing notification dispatch service");

        config.validate().map_err(NotificationError::config)?;

        let metrics = build_recorder(&config.metrics)?;

        let (store, preference_store): (Arc<dyn NotificationStore>, Arc<dyn PreferenceStore>) =
            match config.database.backend {
                StoreBackend::Postgres => {
                    let store = PostgresStore::connect(&config.database).await?;
                    (Arc::new(store.clone()), Arc::new(store))
                }
                StoreBackend::Memory => {
                    let store = InMemoryStore::new();
                    (Arc::new(store.clone()), Arc::new(store))
                }
            };

        let cache = preferences::build_cache(&config).await?;
        let gate = PreferenceGate::new(
            preference_store,
            cache,
            Duration::from_secs(config.preferences.cache_ttl_seconds),
        );

        let queue = match config.queue.backend {
            QueueBackend::RedisStreams => {
                QueueHandle::Redis(RedisStreamQueue::connect(&config.redis, &config.queue).await?)
            }
            QueueBackend::Memory => QueueHandle::Memory(InMemoryQueue::new(Duration::from_millis(
                config.queue.block_timeout_ms,
            ))),
        };

        let dispatch = Arc::new(DispatchService::new(
            store.clone(),
            gate,
            queue.producer(),
            metrics.clone(),
        ));

        info!("Notification dispatch service initialized");

        Ok(Self {
            config,
            store,
            queue,
            metrics,
            dispatch,
        })
    }

    pub fn dispatch(&self) -> Arc<DispatchService> {
        self.dispatch.clone()
    }

    /// HTTP router for the API process
    pub fn router(&self) -> Router {
        let state = AppState::new(self.dispatch.clone(), self.store.clone(), self.metrics.clone());
        routes::create_router(state, Duration::from_secs(self.config.server.timeout_seconds))
    }

    /// Build the worker for `channel` and the consumer that feeds it
    pub fn worker(&self, channel: Channel) -> Result<(Arc<DispatchWorker>, Box<dyn QueueConsumer>)> {
        let registry = channels::build_registry(&self.config, &[channel])?;
        let worker = Arc::new(DispatchWorker::new(
            channel,
            self.store.clone(),
            registry,
            self.dispatch.clone(),
            self.metrics.clone(),
        ));

        let group = self.config.consumer_group(channel);
        let consumer: Box<dyn QueueConsumer> = match &self.queue {
            QueueHandle::Redis(streams) => {
                let sink: Arc<dyn DeadLetterSink> = Arc::new(streams.dead_letter_sink());
                let policy = build_failure_policy(&self.config.retry, sink, self.metrics.clone());
                Box::new(streams.consumer(&group, &self.config.worker.consumer_name, policy))
            }
            QueueHandle::Memory(log) => {
                let sink: Arc<dyn DeadLetterSink> = Arc::new(InMemoryDeadLetters::new());
                let policy = build_failure_policy(&self.config.retry, sink, self.metrics.clone());
                Box::new(log.consumer(&group, policy))
            }
        };

        Ok((worker, consumer))
    }

    /// Start the workers that must share this process's queue, one task per
    /// channel from [`NotificationConfig::in_process_channels`]
    pub fn spawn_in_process_workers(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        let mut handles = Vec::new();

        for channel in self.config.in_process_channels() {
            // Built here so the consumer group exists before anything is published.
            let (worker, consumer) = self.worker(channel)?;
            info!("Running {} worker inside the API process", channel);

            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                consumer.consume(worker, shutdown).await
            }));
        }

        Ok(handles)
    }

    /// Consume the queue for `channel` until `shutdown` is cancelled
    pub async fn run_worker(&self, channel: Channel, shutdown: CancellationToken) -> Result<()> {
        let (worker, consumer) = self.worker(channel)?;
        info!(
            "Worker for channel {} consuming as group {}",
            channel,
            self.config.consumer_group(channel)
        );
        consumer.consume(worker, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackend;
    use crate::dispatch::CreateNotificationRequest;

    fn memory_config() -> NotificationConfig {
        let mut config = NotificationConfig::default();
        config.database.backend = StoreBackend::Memory;
        config.queue.backend = QueueBackend::Memory;
        config.preferences.cache_backend = CacheBackend::Memory;
        config.email.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_service_with_memory_backends() {
        let service = NotificationService::new(memory_config()).await.unwrap();
        assert!(service.worker(Channel::Sms).is_ok());
        let _router = service.router();
    }

    #[tokio::test]
    async fn test_in_process_workers_consume_the_memory_queue() {
        let mut config = memory_config();
        config.push.enabled = true;
        config.push.base_url = "http://127.0.0.1:9".to_string();
        config.push.project_id = "demo".to_string();
        config.push.access_token = "token".to_string();
        config.push.timeout_seconds = 1;

        let service = NotificationService::new(config).await.unwrap();
        let shutdown = CancellationToken::new();
        let workers = service.spawn_in_process_workers(&shutdown).unwrap();
        assert_eq!(workers.len(), 1);

        let notification = service
            .dispatch()
            .create(CreateNotificationRequest {
                user_id: "u1".to_string(),
                channel: "push".to_string(),
                recipient: "device-token".to_string(),
                subject: Some("Hello".to_string()),
                body: "hi".to_string(),
                priority: None,
                scheduled_at: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        // Nothing listens on the provider address, so the send fails.
        let mut status = NotificationStatus::Pending;
        for _ in 0..200 {
            status = service.dispatch().get(&notification.id.to_string()).await.unwrap().status;
            if status != NotificationStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, NotificationStatus::Failed);

        shutdown.cancel();
        for worker in workers {
            assert!(worker.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_no_in_process_workers_without_channels() {
        let service = NotificationService::new(memory_config()).await.unwrap();
        let workers = service
            .spawn_in_process_workers(&CancellationToken::new())
            .unwrap();
        assert!(workers.is_empty());
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let service = NotificationService::new(memory_config()).await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(service.run_worker(Channel::Push, shutdown).await.is_ok());
    }
}
