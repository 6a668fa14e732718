//! In-process queue with consumer-group fan-out
//!
//! An append-only log plus one committed offset per group. A group that
//! subscribes late starts at the current end of the log, like a Redis
//! consumer group created at `$`.

use async_trait::async_trait;
use dispatch_shared::QueueMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    wait_for_redelivery, DeadLetterSink, Disposition, FailurePolicy, MessageHandler,
    QueueConsumer, QueueProducer,
};
use crate::error::{NotificationError, Result};

#[derive(Default)]
struct Log {
    entries: RwLock<Vec<QueueMessage>>,
    offsets: Mutex<HashMap<String, usize>>,
    appended: Notify,
}

/// In-memory queue shared by producers and consumers in one process
#[derive(Clone)]
pub struct InMemoryQueue {
    log: Arc<Log>,
    block_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(block_timeout: Duration) -> Self {
        Self {
            log: Arc::new(Log::default()),
            block_timeout,
        }
    }

    /// Register a consumer group and return a consumer bound to it
    pub fn consumer(&self, group: &str, policy: Arc<dyn FailurePolicy>) -> InMemoryConsumer {
        let end = self.log.entries.read().len();
        self.log
            .offsets
            .lock()
            .entry(group.to_string())
            .or_insert(end);

        InMemoryConsumer {
            queue: self.clone(),
            group: group.to_string(),
            policy,
        }
    }

    /// Every message published so far
    pub fn published(&self) -> Vec<QueueMessage> {
        self.log.entries.read().clone()
    }

    /// Committed offset of a group, if registered
    pub fn committed(&self, group: &str) -> Option<usize> {
        self.log.offsets.lock().get(group).copied()
    }

    fn next_for(&self, group: &str) -> Option<(usize, QueueMessage)> {
        let offset = self.committed(group)?;
        self.log
            .entries
            .read()
            .get(offset)
            .cloned()
            .map(|message| (offset, message))
    }

    fn commit(&self, group: &str, offset: usize) {
        self.log.offsets.lock().insert(group.to_string(), offset + 1);
    }
}

#[async_trait]
impl QueueProducer for InMemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<()> {
        self.log.entries.write().push(message.clone());
        self.log.appended.notify_waiters();
        debug!("Published notification {} to in-memory queue", message.id);
        Ok(())
    }
}

/// Consumer bound to one group of an [`InMemoryQueue`]
pub struct InMemoryConsumer {
    queue: InMemoryQueue,
    group: String,
    policy: Arc<dyn FailurePolicy>,
}

#[async_trait]
impl QueueConsumer for InMemoryConsumer {
    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Consuming in-memory queue as group {}", self.group);

        let mut retained = 0;

        while !shutdown.is_cancelled() {
            // Register interest before looking so a concurrent publish is not missed.
            let appended = self.queue.log.appended.notified();

            let Some((offset, message)) = self.queue.next_for(&self.group) else {
                tokio::select! {
                    _ = appended => {}
                    _ = tokio::time::sleep(self.queue.block_timeout) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            };

            match self
                .policy
                .process(handler.as_ref(), &message, &shutdown)
                .await
            {
                Disposition::Ack => {
                    retained = 0;
                    self.queue.commit(&self.group, offset);
                }
                Disposition::Retain => {
                    // The offset stays uncommitted, so the next pass sees the same message.
                    retained += 1;
                    if !wait_for_redelivery(retained, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("In-memory consumer for group {} stopped", self.group);
        Ok(())
    }
}

/// Dead-letter sink that keeps messages in memory
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    entries: Arc<Mutex<Vec<(QueueMessage, String)>>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(QueueMessage, String)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn dead_letter(&self, message: &QueueMessage, error: &NotificationError) -> Result<()> {
        self.entries.lock().push((message.clone(), error.to_string()));
        Ok(())
    }
}
