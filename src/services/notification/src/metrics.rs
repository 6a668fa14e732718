//! Metrics collection for the dispatch pipeline
//!
//! Components never reach for a global registry. `main` builds one
//! [`MetricsRecorder`] and hands an `Arc<dyn MetricsRecorder>` to the
//! dispatch service, the worker and the queue consumer.

use crate::config::MetricsConfig;
use crate::error::{NotificationError, Result};
use dispatch_shared::Channel;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Sink for pipeline metrics
pub trait MetricsRecorder: Send + Sync {
    /// A notification record was created
    fn record_created(&self, channel: Channel);

    /// A provider accepted a notification
    fn record_sent(&self, channel: Channel);

    /// A provider confirmed delivery
    fn record_delivered(&self, channel: Channel);

    /// A send attempt or a handler failed
    fn record_failed(&self, channel: Channel, reason: &str);

    /// The consumer is about to retry a message
    fn record_retry(&self, channel: Channel, reason: &str);

    /// Duration of a pipeline operation (`create`, `send`, `handle`, ...)
    fn observe_duration(&self, channel: Channel, operation: &str, seconds: f64);

    /// Text exposition for the `/metrics` endpoint
    fn render(&self) -> Result<String>;
}

/// Recorder that drops everything, for tests and disabled metrics
#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_created(&self, _channel: Channel) {}
    fn record_sent(&self, _channel: Channel) {}
    fn record_delivered(&self, _channel: Channel) {}
    fn record_failed(&self, _channel: Channel, _reason: &str) {}
    fn record_retry(&self, _channel: Channel, _reason: &str) {}
    fn observe_duration(&self, _channel: Channel, _operation: &str, _seconds: f64) {}

    fn render(&self) -> Result<String> {
        Ok(String::new())
    }
}

/// Prometheus-backed recorder with its own registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,

    notifications_created: IntCounterVec,
    notifications_sent: IntCounterVec,
    notifications_delivered: IntCounterVec,
    notifications_failed: IntCounterVec,
    notification_retries: IntCounterVec,

    operation_duration: HistogramVec,
}

impl PrometheusMetrics {
    /// Create a new metrics collector
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        info!("Initializing notification metrics");

        let registry = Registry::new();

        let notifications_created = IntCounterVec::new(
            Opts::new(
                "notifications_created_total",
                "Total number of notification records created",
            )
            .namespace(config.namespace.clone()),
            &["channel"],
        )?;

        let notifications_sent = IntCounterVec::new(
            Opts::new(
                "notifications_sent_total",
                "Total number of notifications accepted by a provider",
            )
            .namespace(config.namespace.clone()),
            &["channel"],
        )?;

        let notifications_delivered = IntCounterVec::new(
            Opts::new(
                "notifications_delivered_total",
                "Total number of notifications confirmed delivered",
            )
            .namespace(config.namespace.clone()),
            &["channel"],
        )?;

        let notifications_failed = IntCounterVec::new(
            Opts::new(
                "notifications_failed_total",
                "Total number of failed notifications",
            )
            .namespace(config.namespace.clone()),
            &["channel", "reason"],
        )?;

        let notification_retries = IntCounterVec::new(
            Opts::new(
                "notification_retries_total",
                "Total number of queue message retries",
            )
            .namespace(config.namespace.clone()),
            &["channel", "reason"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "notification_operation_duration_seconds",
                "Time taken by pipeline operations",
            )
            .namespace(config.namespace.clone())
            .buckets(config.histogram_buckets.clone()),
            &["channel", "operation"],
        )?;

        registry.register(Box::new(notifications_created.clone()))?;
        registry.register(Box::new(notifications_sent.clone()))?;
        registry.register(Box::new(notifications_delivered.clone()))?;
        registry.register(Box::new(notifications_failed.clone()))?;
        registry.register(Box::new(notification_retries.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;

        info!("Notification metrics initialized successfully");

        Ok(Self {
            registry: Arc::new(registry),
            notifications_created,
            notifications_sent,
            notifications_delivered,
            notifications_failed,
            notification_retries,
            operation_duration,
        })
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_created(&self, channel: Channel) {
        self.notifications_created
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    fn record_sent(&self, channel: Channel) {
        self.notifications_sent
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    fn record_delivered(&self, channel: Channel) {
        self.notifications_delivered
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    fn record_failed(&self, channel: Channel, reason: &str) {
        self.notifications_failed
            .with_label_values(&[channel.as_str(), reason])
            .inc();
    }

    fn record_retry(&self, channel: Channel, reason: &str) {
        self.notification_retries
            .with_label_values(&[channel.as_str(), reason])
            .inc();
    }

    fn observe_duration(&self, channel: Channel, operation: &str, seconds: f64) {
        self.operation_duration
            .with_label_values(&[channel.as_str(), operation])
            .observe(seconds);
    }

    fn render(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| NotificationError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

/// Build the recorder selected by configuration
pub fn build_recorder(config: &MetricsConfig) -> Result<Arc<dyn MetricsRecorder>> {
    if config.enabled {
        Ok(Arc::new(PrometheusMetrics::new(config)?))
    } else {
        Ok(Arc::new(NoopMetrics))
    }
}

/// Timer for measuring operation duration
pub struct MetricsTimer {
    channel: Channel,
    operation: &'static str,
    start_time: Instant,
}

impl MetricsTimer {
    pub fn start(channel: Channel, operation: &'static str) -> Self {
        Self {
            channel,
            operation,
            start_time: Instant::now(),
        }
    }

    /// Stop the timer, record the elapsed time and return it in seconds
    pub fn observe(self, recorder: &dyn MetricsRecorder) -> f64 {
        let seconds = self.start_time.elapsed().as_secs_f64();
        recorder.observe_duration(self.channel, self.operation, seconds);
        debug!(
            "Operation '{}' on {} completed in {:.3}s",
            self.operation, self.channel, seconds
        );
        seconds
    }
}
