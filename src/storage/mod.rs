pub mod memory_store;
pub mod rocksdb_store;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::UnixMillis;

pub type TopicId = Uuid;
pub type PartitionId = Uuid;
pub type MessageId = Uuid;
pub type GroupId = Uuid;
pub type PartitionNumber = u32;
pub type Offset = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Acknowledged,
    Failed,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Failed => "failed",
            MessageStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub id: PartitionId,
    pub topic_id: TopicId,
    pub number: PartitionNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub id: TopicId,
    pub name: String,
    pub created_at: UnixMillis,
    /// Ordered by partition number, `0..n`.
    pub partitions: Vec<PartitionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub payload: Vec<u8>,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub created_at: UnixMillis,
    pub last_attempt_at: Option<UnixMillis>,
    pub acked_at: Option<UnixMillis>,
}

impl MessageRecord {
    /// Requeued by the retry scheduler and waiting to be handed out again.
    pub fn is_redeliverable(&self) -> bool {
        self.status == MessageStatus::Pending && self.attempt_count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: MessageId,
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub payload: Vec<u8>,
    pub dead_at: UnixMillis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub acknowledged: u64,
    pub failed_retryable: u64,
    pub dead_letters: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("column family not found: {0}")]
    MissingColumnFamily(&'static str),

    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    #[error("topic already exists: {0}")]
    TopicExists(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

pub fn make_rocksdb_store(path: &str) -> Result<rocksdb_store::RocksStorage, StorageError> {
    rocksdb_store::RocksStorage::open(path)
}

pub fn make_memory_store() -> memory_store::MemoryStorage {
    memory_store::MemoryStorage::default()
}

/// Logical storage primitives the broker is built on. Every method is atomic
/// on its own; none of them leave partial state behind on error.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Create a topic together with partitions `0..partitions`. Fails with
    /// `TopicExists` if the name is taken.
    async fn create_topic(
        &self,
        name: &str,
        partitions: u32,
        now: UnixMillis,
    ) -> Result<TopicRecord, StorageError>;

    async fn topic_by_name(&self, name: &str) -> Result<Option<TopicRecord>, StorageError>;

    /// All topics in creation order.
    async fn list_topics(&self) -> Result<Vec<TopicRecord>, StorageError>;

    /// Allocate the next offset of `partition` and store a `pending` message
    /// there. Concurrent appends to one partition never share an offset.
    async fn append(
        &self,
        partition: PartitionId,
        payload: &[u8],
        now: UnixMillis,
    ) -> Result<MessageRecord, StorageError>;

    async fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError>;

    /// Messages of `partition` with offset `>= from`, ascending, at most `max`.
    async fn read_log(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Requeued messages (pending, attempt count above zero) of `partition`,
    /// ascending by offset, at most `max`.
    async fn redeliverable(
        &self,
        partition: PartitionId,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Get-or-create in one step.
    async fn resolve_group(&self, name: &str) -> Result<GroupRecord, StorageError>;

    async fn cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Option<Offset>, StorageError>;

    /// Store `max(current, offset)` and return the stored value.
    async fn advance_cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Offset, StorageError>;

    /// Replace `expected` with `next` only if the stored message still equals
    /// `expected`. A dead letter, when given, is written in the same step.
    /// Returns `false` when the stored message has moved on.
    async fn compare_and_swap_message(
        &self,
        expected: &MessageRecord,
        next: &MessageRecord,
        dead_letter: Option<&DeadLetterRecord>,
    ) -> Result<bool, StorageError>;

    /// Failed messages, oldest `last_attempt_at` first.
    async fn failed_batch(&self, limit: usize) -> Result<Vec<MessageRecord>, StorageError>;

    /// Newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StorageError>;

    async fn status_counts(&self, max_attempts: u32) -> Result<StatusCounts, StorageError>;
}
