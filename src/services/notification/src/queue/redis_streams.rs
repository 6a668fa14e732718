//! Redis Streams queue backend
//!
//! Entries carry `key` (notification id), `channel`, `priority` and
//! `payload` (the JSON queue message). Each worker reads through its own
//! consumer group with `XREADGROUP ... BLOCK` and acknowledges with `XACK`
//! once the failure policy has disposed of the entry. On start a consumer
//! first re-reads the entries still pending for it, which covers a crash
//! between handling and acknowledging.

use async_trait::async_trait;
use chrono::Utc;
use dispatch_shared::QueueMessage;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    wait_for_redelivery, DeadLetterSink, Disposition, FailurePolicy, MessageHandler,
    QueueConsumer, QueueProducer,
};
use crate::config::{QueueConfig, RedisConfig};
use crate::error::{NotificationError, Result};

/// Position a consumer reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadCursor {
    /// Entries already delivered to this consumer but not acknowledged
    Pending,
    /// Entries never delivered to the group
    New,
}

impl ReadCursor {
    fn id(self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }

    /// Cursor for the read following a batch of `len` entries
    fn after_batch(self, len: usize) -> Self {
        match self {
            ReadCursor::Pending if len == 0 => ReadCursor::New,
            cursor => cursor,
        }
    }
}

/// Producer side of the Redis Streams queue, and factory for consumers
#[derive(Clone)]
pub struct RedisStreamQueue {
    client: Client,
    connection: ConnectionManager,
    stream: String,
    block_timeout_ms: usize,
    batch_size: usize,
}

impl RedisStreamQueue {
    /// Connect to Redis and verify the connection
    pub async fn connect(redis: &RedisConfig, queue: &QueueConfig) -> Result<Self> {
        info!("Connecting queue to Redis at {}", redis.url);

        let client = Client::open(redis.url.as_str())
            .map_err(|e| NotificationError::queue(format!("Failed to create Redis client: {}", e)))?;

        let connection = tokio::time::timeout(
            Duration::from_secs(redis.connection_timeout_seconds),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| NotificationError::service_unavailable("redis"))?
        .map_err(|e| {
            NotificationError::queue(format!("Failed to create connection manager: {}", e))
        })?;

        Ok(Self {
            client,
            connection,
            stream: queue.stream.clone(),
            block_timeout_ms: queue.block_timeout_ms as usize,
            batch_size: queue.batch_size,
        })
    }

    /// Create a consumer reading through `group` as `consumer_name`
    pub fn consumer(
        &self,
        group: &str,
        consumer_name: &str,
        policy: Arc<dyn FailurePolicy>,
    ) -> RedisStreamConsumer {
        RedisStreamConsumer {
            queue: self.clone(),
            group: group.to_string(),
            consumer_name: consumer_name.to_string(),
            policy,
        }
    }

    /// Dead-letter sink writing to `<stream>:dead_letter`
    pub fn dead_letter_sink(&self) -> RedisDeadLetterSink {
        RedisDeadLetterSink {
            connection: self.connection.clone(),
            stream: format!("{}:dead_letter", self.stream),
        }
    }
}

#[async_trait]
impl QueueProducer for RedisStreamQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let fields = [
            ("key", message.partition_key()),
            ("channel", message.channel.to_string()),
            ("priority", message.priority.code().to_string()),
            ("payload", payload),
        ];

        let mut conn = self.connection.clone();
        let entry_id: String = conn
            .xadd(&self.stream, "*", &fields)
            .await
            .map_err(|e| {
                NotificationError::queue(format!("Failed to add to stream {}: {}", self.stream, e))
            })?;

        debug!(
            "Notification {} published to stream {} with ID {}",
            message.id, self.stream, entry_id
        );
        Ok(())
    }
}

/// Consumer bound to one group of a [`RedisStreamQueue`]
pub struct RedisStreamConsumer {
    queue: RedisStreamQueue,
    group: String,
    consumer_name: String,
    policy: Arc<dyn FailurePolicy>,
}

impl RedisStreamConsumer {
    /// Create the consumer group (and the stream) if it does not exist yet
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.queue.connection.clone();
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.queue.stream, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                info!(
                    "Created consumer group {} on stream {}",
                    self.group, self.queue.stream
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists", self.group);
                Ok(())
            }
            Err(e) => Err(NotificationError::queue(format!(
                "Failed to create consumer group {}: {}",
                self.group, e
            ))),
        }
    }

    async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        cursor: &str,
    ) -> Result<Vec<StreamId>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer_name)
            .count(self.queue.batch_size)
            .block(self.queue.block_timeout_ms);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.queue.stream.as_str()], &[cursor], &opts)
            .await
            .map_err(|e| {
                NotificationError::queue(format!(
                    "Failed to read from stream {}: {}",
                    self.queue.stream, e
                ))
            })?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.queue.connection.clone();
        let _: usize = conn
            .xack(&self.queue.stream, &self.group, &[entry_id])
            .await
            .map_err(|e| NotificationError::queue(format!("Failed to ack {}: {}", entry_id, e)))?;
        Ok(())
    }
}

/// Decode the queue message carried by a stream entry
fn decode_entry(entry: &StreamId) -> Result<QueueMessage> {
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| NotificationError::serialization("stream entry has no payload field"))?;
    Ok(serde_json::from_str(&payload)?)
}

#[async_trait]
impl QueueConsumer for RedisStreamConsumer {
    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.ensure_group().await?;

        // Blocking reads get their own connection so they never stall acks.
        let mut read_conn = self
            .queue
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| NotificationError::queue(format!("Failed to open read connection: {}", e)))?;

        info!(
            "Consuming stream {} as {}/{}",
            self.queue.stream, self.group, self.consumer_name
        );

        let mut cursor = ReadCursor::Pending;
        let mut retained = 0;

        'consume: while !shutdown.is_cancelled() {
            let entries = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.read_batch(&mut read_conn, cursor.id()) => match read {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!("{}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.cancelled() => break,
                        }
                        continue;
                    }
                },
            };

            let next = cursor.after_batch(entries.len());
            if next != cursor {
                debug!("No pending entries left for {}, reading new ones", self.consumer_name);
            }
            cursor = next;

            for entry in entries {
                let disposition = match decode_entry(&entry) {
                    Ok(message) => {
                        self.policy
                            .process(handler.as_ref(), &message, &shutdown)
                            .await
                    }
                    Err(e) => {
                        warn!("Dropping malformed stream entry {}: {}", entry.id, e);
                        Disposition::Ack
                    }
                };

                match disposition {
                    Disposition::Ack => {
                        retained = 0;
                        if let Err(e) = self.ack(&entry.id).await {
                            error!("{}", e);
                        }
                    }
                    Disposition::Retain => {
                        // The entry stays in the pending list; re-read it from there.
                        retained += 1;
                        cursor = ReadCursor::Pending;
                        if !wait_for_redelivery(retained, &shutdown).await {
                            break 'consume;
                        }
                        continue 'consume;
                    }
                }
            }
        }

        info!(
            "Consumer {}/{} on stream {} stopped",
            self.group, self.consumer_name, self.queue.stream
        );
        Ok(())
    }
}

/// Dead-letter sink appending to a Redis stream
#[derive(Clone)]
pub struct RedisDeadLetterSink {
    connection: ConnectionManager,
    stream: String,
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn dead_letter(&self, message: &QueueMessage, error: &NotificationError) -> Result<()> {
        let fields = [
            ("key", message.partition_key()),
            ("channel", message.channel.to_string()),
            ("payload", serde_json::to_string(message)?),
            ("error", error.to_string()),
            ("failed_at", Utc::now().to_rfc3339()),
        ];

        let mut conn = self.connection.clone();
        let _: String = conn.xadd(&self.stream, "*", &fields).await.map_err(|e| {
            NotificationError::queue(format!("Failed to add to stream {}: {}", self.stream, e))
        })?;

        warn!(
            "Notification {} moved to dead-letter stream {}",
            message.id, self.stream
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LogAndContinue;
    use dispatch_shared::{Channel, Priority};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use redis::Value;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn message() -> QueueMessage {
        QueueMessage {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: Channel::Email,
            recipient: "a@b.com".to_string(),
            subject: Some("s".to_string()),
            body: "b".to_string(),
            metadata: Default::default(),
            priority: Priority::Low,
            created_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, message: &QueueMessage) -> Result<()> {
            self.seen.lock().push(message.id);
            Ok(())
        }
    }

    async fn create_test_queue() -> RedisStreamQueue {
        let redis = RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            ..Default::default()
        };
        let queue = QueueConfig {
            stream: format!("notifications:test:{}", Uuid::new_v4()),
            block_timeout_ms: 50,
            ..Default::default()
        };

        RedisStreamQueue::connect(&redis, &queue)
            .await
            .expect("Failed to connect to Redis")
    }

    #[test]
    fn test_cursor_drains_pending_before_new_entries() {
        assert_eq!(ReadCursor::Pending.id(), "0");
        assert_eq!(ReadCursor::New.id(), ">");

        assert_eq!(ReadCursor::Pending.after_batch(3), ReadCursor::Pending);
        assert_eq!(ReadCursor::Pending.after_batch(0), ReadCursor::New);
        assert_eq!(ReadCursor::New.after_batch(0), ReadCursor::New);
        assert_eq!(ReadCursor::New.after_batch(5), ReadCursor::New);
    }

    #[tokio::test]
    #[ignore] // Ignored because it requires a running Redis
    async fn test_consumer_redelivers_unacknowledged_entries_first() {
        let queue = create_test_queue().await;
        let consumer = queue.consumer("email-workers", "email-1", Arc::new(LogAndContinue));
        consumer.ensure_group().await.unwrap();

        // Deliver the first entry to the consumer without acknowledging it.
        let stranded = message();
        queue.publish(&stranded).await.unwrap();
        let mut conn = queue.client.get_multiplexed_async_connection().await.unwrap();
        let delivered = consumer.read_batch(&mut conn, ReadCursor::New.id()).await.unwrap();
        assert_eq!(delivered.len(), 1);

        let fresh = message();
        queue.publish(&fresh).await.unwrap();

        let collector = Arc::new(Collector::default());
        let shutdown = CancellationToken::new();
        let task = {
            let collector = collector.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.consume(collector, shutdown).await })
        };

        for _ in 0..100 {
            if collector.seen.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*collector.seen.lock(), vec![stranded.id, fresh.id]);

        let checker = queue.consumer("email-workers", "email-1", Arc::new(LogAndContinue));
        let pending = checker.read_batch(&mut conn, ReadCursor::Pending.id()).await.unwrap();
        assert!(pending.is_empty());

        let _: () = queue.connection.clone().del(&queue.stream).await.unwrap();
    }

    fn entry_with(fields: Vec<(&str, Value)>) -> StreamId {
        StreamId {
            id: "1-0".to_string(),
            map: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_decode_entry() {
        let message = message();
        let payload = serde_json::to_string(&message).unwrap();
        let entry = entry_with(vec![("payload", Value::Data(payload.into_bytes()))]);

        assert_eq!(decode_entry(&entry).unwrap(), message);
    }

    #[test]
    fn test_decode_entry_rejects_malformed_payloads() {
        let entry = entry_with(vec![("payload", Value::Data(b"not json".to_vec()))]);
        assert!(matches!(
            decode_entry(&entry),
            Err(NotificationError::Serialization { .. })
        ));

        let entry = entry_with(vec![]);
        assert!(decode_entry(&entry).is_err());
    }
}
