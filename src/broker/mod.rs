pub mod cursor;
pub mod delivery;
pub mod log;
pub mod partitioner;
pub mod retry;
pub mod topics;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam::queue::SegQueue;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::{
        cursor::CursorManager,
        delivery::{DeliveryStateMachine, Settlement, Transition},
        log::LogAppender,
        retry::{RetryPolicy, RetryScheduler},
        topics::TopicRegistry,
    },
    storage::{
        DeadLetterRecord, GroupRecord, MessageId, MessageRecord, MessageStatus, Offset,
        PartitionNumber, PartitionRecord, Storage, StorageError, TopicRecord,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cannot {transition} message {message_id} in state {status}")]
    InvalidTransition {
        message_id: MessageId,
        status: MessageStatus,
        transition: Transition,
    },

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for BrokerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TopicExists(name) => {
                BrokerError::Conflict(format!("topic {name} already exists"))
            }
            StorageError::PartitionNotFound(id) => BrokerError::NotFound(format!("partition {id}")),
            StorageError::MessageNotFound(id) => BrokerError::NotFound(format!("message {id}")),
            other => BrokerError::Storage(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub retry_batch_max: usize,
    pub max_partitions: u32,
    pub max_consume_batch: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: delivery::MAX_RETRIES,
            retry_interval_ms: 10_000,
            retry_batch_max: 10,
            max_partitions: 1024,
            max_consume_batch: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            interval: Duration::from_millis(self.retry_interval_ms.max(1)),
            batch_size: self.retry_batch_max.max(1),
        }
    }
}

// ---------------- Transport-facing descriptors ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducedMessage {
    pub id: MessageId,
    pub topic: String,
    pub partition: PartitionNumber,
    pub offset: Offset,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub partition: PartitionNumber,
    pub offset: Offset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardMetrics {
    pub total_messages: u64,
    pub pending_messages: u64,
    pub acknowledged_messages: u64,
    pub retryable_failed_messages: u64,
    pub dead_letter_messages: u64,
}

// ---------------- Background tasks ----------------

#[derive(Debug)]
struct TaskGroup {
    handles: SegQueue<tokio::task::JoinHandle<()>>,
    closed: AtomicBool,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            handles: SegQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // No tasks after shutdown
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let handle = tokio::spawn(fut);

        if self.closed.load(Ordering::Acquire) {
            handle.abort();
        } else {
            self.handles.push(handle);
        }
    }

    /// Tasks are expected to watch the broker's cancellation token; this only
    /// waits for them to wind down.
    async fn join(&self) {
        self.closed.store(true, Ordering::Release);

        while let Some(h) = self.handles.pop() {
            if let Err(err) = h.await {
                if !err.is_cancelled() {
                    tracing::error!("background task panicked: {err}");
                }
            }
        }
    }
}

// ---------------- Broker ----------------

/// Entry point for the transport layer. Holds no mutable broker state of its
/// own: topics, offsets, cursors and statuses all live in `storage`.
#[derive(Debug)]
pub struct Broker {
    cfg: BrokerConfig,
    storage: Arc<dyn Storage>,
    topics: TopicRegistry,
    log: LogAppender,
    cursors: CursorManager,
    delivery: DeliveryStateMachine,

    shutdown: CancellationToken,
    task_group: TaskGroup,
}

impl Broker {
    pub fn new(storage: Arc<dyn Storage>, cfg: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            topics: TopicRegistry::new(storage.clone(), cfg.max_partitions),
            log: LogAppender::new(storage.clone()),
            cursors: CursorManager::new(storage.clone()),
            delivery: DeliveryStateMachine::new(storage.clone(), cfg.max_retries),
            storage,
            cfg,
            shutdown: CancellationToken::new(),
            task_group: TaskGroup::new(),
        })
    }

    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.storage.clone(), self.cfg.retry_policy())
    }

    /// Starts the retry scheduler. It stops when `shutdown` is called.
    pub fn spawn_retry_scheduler(&self) {
        let scheduler = self.retry_scheduler();
        let token = self.shutdown.child_token();
        self.task_group.spawn(scheduler.run(token));
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.task_group.join().await;
    }

    pub async fn create_topic(
        &self,
        name: &str,
        partitions: i64,
    ) -> Result<TopicRecord, BrokerError> {
        self.topics.create_topic(name, partitions).await
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicRecord>, BrokerError> {
        self.topics.list_topics().await
    }

    pub async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<ProducedMessage, BrokerError> {
        if topic.trim().is_empty() {
            return Err(BrokerError::Validation("topic is required".into()));
        }

        let record = self.topics.lookup(topic).await?;
        let partition = partitioner::select_partition(&record.partitions, key)
            .ok_or_else(|| BrokerError::NotFound(format!("no partitions for topic {topic}")))?;

        let msg = self.log.append(partition.id, payload).await?;

        Ok(ProducedMessage {
            id: msg.id,
            topic: record.name,
            partition: partition.number,
            offset: msg.offset,
            status: msg.status,
        })
    }

    /// Hands out up to `batch` messages (default 1) to `group`, walking the
    /// topic's partitions in number order. Per partition, requeued messages
    /// behind the group's cursor go first, then the log from the cursor on.
    pub async fn consume(
        &self,
        topic: &str,
        group: &str,
        batch: Option<usize>,
    ) -> Result<Vec<DeliveredMessage>, BrokerError> {
        if topic.trim().is_empty() {
            return Err(BrokerError::Validation("topic is required".into()));
        }

        let want = batch
            .filter(|b| *b > 0)
            .unwrap_or(1)
            .min(self.cfg.max_consume_batch.max(1));

        let record = self.topics.lookup(topic).await?;
        let group = self.cursors.resolve_group(group).await?;

        let mut out = Vec::with_capacity(want);
        for partition in &record.partitions {
            if out.len() >= want {
                break;
            }
            self.consume_partition(&group, partition, want, &mut out).await?;
        }

        if out.is_empty() {
            return Err(BrokerError::NotFound("no messages available".into()));
        }

        tracing::debug!(topic, group = %group.name, delivered = out.len(), "consumed");
        Ok(out)
    }

    async fn consume_partition(
        &self,
        group: &GroupRecord,
        partition: &PartitionRecord,
        want: usize,
        out: &mut Vec<DeliveredMessage>,
    ) -> Result<(), BrokerError> {
        let deliver = |m: MessageRecord| DeliveredMessage {
            id: m.id,
            payload: m.payload,
            partition: partition.number,
            offset: m.offset,
        };

        let next = self.cursors.next_offset(group.id, partition.id).await?;

        // Redelivery lane: requeued messages the cursor already passed.
        if next > 0 {
            let retries = self
                .log
                .redeliverable(partition.id, want - out.len())
                .await?;
            out.extend(
                retries
                    .into_iter()
                    .take_while(|m| m.offset < next)
                    .map(deliver),
            );
        }

        // Fresh lane: every examined message moves the cursor. Status is
        // shared across groups, so only dead messages are held back.
        let mut from = next;
        let mut last_seen = None;
        while out.len() < want {
            let page_size = want - out.len();
            let page = self.log.read(partition.id, from, page_size).await?;
            let exhausted = page.len() < page_size;

            for m in page {
                last_seen = Some(m.offset);
                from = m.offset + 1;
                if m.status != MessageStatus::Dead {
                    out.push(deliver(m));
                    if out.len() >= want {
                        break;
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        if let Some(last) = last_seen {
            self.cursors
                .advance_cursor(group.id, partition.id, last)
                .await?;
        }

        Ok(())
    }

    /// `status` is the consumer's report: `acknowledged` or `failed`.
    pub async fn acknowledge(
        &self,
        message_id: MessageId,
        status: &str,
    ) -> Result<MessageRecord, BrokerError> {
        let settlement: Settlement = status.parse()?;
        self.delivery.settle(message_id, settlement).await
    }

    pub async fn dashboard(&self) -> Result<DashboardMetrics, BrokerError> {
        let counts = self.storage.status_counts(self.cfg.max_retries).await?;
        Ok(DashboardMetrics {
            total_messages: counts.total,
            pending_messages: counts.pending,
            acknowledged_messages: counts.acknowledged,
            retryable_failed_messages: counts.failed_retryable,
            dead_letter_messages: counts.dead_letters,
        })
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, BrokerError> {
        Ok(self.storage.dead_letters(limit).await?)
    }
}
