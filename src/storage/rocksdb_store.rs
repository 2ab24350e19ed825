use crate::storage::*;
use crate::util::fnv1a_32;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use uuid::Uuid;

const CF_META: &str = "meta";
const CF_TOPICS: &str = "topics";
const CF_TOPIC_NAMES: &str = "topic_names";
const CF_PARTITIONS: &str = "partitions";
const CF_MESSAGES: &str = "messages";
const CF_LOG: &str = "log";
const CF_GROUPS: &str = "groups";
const CF_CURSORS: &str = "cursors";
const CF_FAILED: &str = "failed";
const CF_REDELIVER: &str = "redeliver";
const CF_DEAD_LETTERS: &str = "dead_letters";

const ALL_CFS: [&str; 11] = [
    CF_META,
    CF_TOPICS,
    CF_TOPIC_NAMES,
    CF_PARTITIONS,
    CF_MESSAGES,
    CF_LOG,
    CF_GROUPS,
    CF_CURSORS,
    CF_FAILED,
    CF_REDELIVER,
    CF_DEAD_LETTERS,
];

const TOPIC_SEQ_KEY: &[u8] = b"TOPIC_SEQ";
const LOCK_STRIPES: usize = 64;

/// RocksDB-backed store.
///
/// Layout:
/// - `topics`: creation seq (be u64) -> topic record, so a forward scan is
///   creation order
/// - `log`: partition id ++ offset (be u64) -> message id
/// - `failed`: last attempt (be u64) ++ message id, the retry scan index
/// - `redeliver`: partition id ++ offset, requeued messages
/// - `dead_letters`: dead_at (be u64) ++ message id -> dead letter
///
/// Read-modify-write steps run under an in-process lock and commit with a
/// single `WriteBatch`: one sequencer per partition for appends, one catalog
/// lock for topic and group creation, and striped locks for cursors and
/// message transitions. Each operation takes exactly one lock.
#[derive(Debug)]
pub struct RocksStorage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    sequencers: DashMap<PartitionId, Arc<Mutex<()>>>,
    catalog: Mutex<()>,
    stripes: Box<[Mutex<()>]>,
}

impl RocksStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            sequencers: DashMap::new(),
            catalog: Mutex::new(()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn sequencer(&self, partition: PartitionId) -> Arc<Mutex<()>> {
        self.sequencers
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn stripe(&self, key: &[u8]) -> &Mutex<()> {
        &self.stripes[fnv1a_32(key) as usize % self.stripes.len()]
    }

    fn next_offset_key(partition: PartitionId) -> String {
        format!("NEXT_OFFSET:{}", partition)
    }

    fn encode_log_key(partition: PartitionId, offset: Offset) -> Vec<u8> {
        let mut v = Vec::with_capacity(24);
        v.extend_from_slice(partition.as_bytes());
        v.extend_from_slice(&offset.to_be_bytes());
        v
    }

    fn encode_cursor_key(group: GroupId, partition: PartitionId) -> Vec<u8> {
        let mut v = Vec::with_capacity(32);
        v.extend_from_slice(group.as_bytes());
        v.extend_from_slice(partition.as_bytes());
        v
    }

    fn encode_timed_key(ts: UnixMillis, id: MessageId) -> Vec<u8> {
        let mut v = Vec::with_capacity(24);
        v.extend_from_slice(&ts.to_be_bytes());
        v.extend_from_slice(id.as_bytes());
        v
    }

    fn failed_key(msg: &MessageRecord) -> Option<Vec<u8>> {
        (msg.status == MessageStatus::Failed)
            .then(|| Self::encode_timed_key(msg.last_attempt_at.unwrap_or(0), msg.id))
    }

    fn redeliver_key(msg: &MessageRecord) -> Option<Vec<u8>> {
        msg.is_redeliverable()
            .then(|| Self::encode_log_key(msg.partition_id, msg.offset))
    }

    fn load_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError> {
        let messages_cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(&messages_cf, id.as_bytes())? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    /// Walks an index column family whose values are message ids, starting
    /// at `from` and staying inside `prefix`.
    fn messages_by_index(
        &self,
        cf_name: &'static str,
        prefix: &[u8],
        from: &[u8],
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(from, Direction::Forward));

        let mut out = Vec::new();
        for pair in iter {
            if out.len() >= max {
                break;
            }
            let (key, value) = pair?;
            if !key.starts_with(prefix) {
                break;
            }

            let id = decode_uuid(&value)?;
            let msg = self
                .load_message(id)?
                .ok_or(StorageError::MessageNotFound(id))?;
            out.push(msg);
        }

        Ok(out)
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn create_topic(
        &self,
        name: &str,
        partitions: u32,
        now: UnixMillis,
    ) -> Result<TopicRecord, StorageError> {
        let meta_cf = self.cf(CF_META)?;
        let topics_cf = self.cf(CF_TOPICS)?;
        let names_cf = self.cf(CF_TOPIC_NAMES)?;
        let partitions_cf = self.cf(CF_PARTITIONS)?;

        let _guard = self.catalog.lock();

        if self.db.get_cf(&names_cf, name.as_bytes())?.is_some() {
            return Err(StorageError::TopicExists(name.to_string()));
        }

        let seq = match self.db.get_cf(&meta_cf, TOPIC_SEQ_KEY)? {
            Some(v) => u64::from_be_bytes(to_array(&v)?),
            None => 0,
        };

        let topic_id = Uuid::new_v4();
        let topic = TopicRecord {
            id: topic_id,
            name: name.to_string(),
            created_at: now,
            partitions: (0..partitions.max(1))
                .map(|number| PartitionRecord {
                    id: Uuid::new_v4(),
                    topic_id,
                    number,
                })
                .collect(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&topics_cf, seq.to_be_bytes(), encode(&topic)?);
        batch.put_cf(&names_cf, name.as_bytes(), seq.to_be_bytes());
        for p in &topic.partitions {
            batch.put_cf(&partitions_cf, p.id.as_bytes(), encode(p)?);
        }
        batch.put_cf(&meta_cf, TOPIC_SEQ_KEY, (seq + 1).to_be_bytes());
        self.db.write(batch)?;

        Ok(topic)
    }

    async fn topic_by_name(&self, name: &str) -> Result<Option<TopicRecord>, StorageError> {
        let names_cf = self.cf(CF_TOPIC_NAMES)?;
        let topics_cf = self.cf(CF_TOPICS)?;

        let Some(seq) = self.db.get_cf(&names_cf, name.as_bytes())? else {
            return Ok(None);
        };

        match self.db.get_cf(&topics_cf, &seq)? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Err(StorageError::Internal(format!(
                "topic name {name} points at a missing topic"
            ))),
        }
    }

    async fn list_topics(&self) -> Result<Vec<TopicRecord>, StorageError> {
        let topics_cf = self.cf(CF_TOPICS)?;

        let mut out = Vec::new();
        for pair in self.db.iterator_cf(&topics_cf, IteratorMode::Start) {
            let (_, value) = pair?;
            out.push(decode(&value)?);
        }

        Ok(out)
    }

    async fn append(
        &self,
        partition: PartitionId,
        payload: &[u8],
        now: UnixMillis,
    ) -> Result<MessageRecord, StorageError> {
        let partitions_cf = self.cf(CF_PARTITIONS)?;
        let meta_cf = self.cf(CF_META)?;
        let messages_cf = self.cf(CF_MESSAGES)?;
        let log_cf = self.cf(CF_LOG)?;

        if self.db.get_cf(&partitions_cf, partition.as_bytes())?.is_none() {
            return Err(StorageError::PartitionNotFound(partition));
        }

        let sequencer = self.sequencer(partition);
        let _guard = sequencer.lock();

        // Read next offset, default 0
        let key = Self::next_offset_key(partition);
        let offset = match self.db.get_cf(&meta_cf, key.as_bytes())? {
            Some(v) => u64::from_be_bytes(to_array(&v)?),
            None => 0,
        };

        let msg = MessageRecord {
            id: Uuid::new_v4(),
            partition_id: partition,
            offset,
            payload: payload.to_vec(),
            status: MessageStatus::Pending,
            attempt_count: 0,
            created_at: now,
            last_attempt_at: None,
            acked_at: None,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&messages_cf, msg.id.as_bytes(), encode(&msg)?);
        batch.put_cf(
            &log_cf,
            Self::encode_log_key(partition, offset),
            msg.id.as_bytes(),
        );
        batch.put_cf(&meta_cf, key.as_bytes(), (offset + 1).to_be_bytes());
        self.db.write(batch)?;

        Ok(msg)
    }

    async fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError> {
        self.load_message(id)
    }

    async fn read_log(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let start = Self::encode_log_key(partition, from);
        self.messages_by_index(CF_LOG, partition.as_bytes(), &start, max)
    }

    async fn redeliverable(
        &self,
        partition: PartitionId,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.messages_by_index(CF_REDELIVER, partition.as_bytes(), partition.as_bytes(), max)
    }

    async fn resolve_group(&self, name: &str) -> Result<GroupRecord, StorageError> {
        let groups_cf = self.cf(CF_GROUPS)?;

        if let Some(v) = self.db.get_cf(&groups_cf, name.as_bytes())? {
            return decode(&v);
        }

        let _guard = self.catalog.lock();

        // Re-check under the lock: a concurrent caller may have won.
        if let Some(v) = self.db.get_cf(&groups_cf, name.as_bytes())? {
            return decode(&v);
        }

        let group = GroupRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.db
            .put_cf(&groups_cf, name.as_bytes(), encode(&group)?)?;

        Ok(group)
    }

    async fn cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Option<Offset>, StorageError> {
        let cursors_cf = self.cf(CF_CURSORS)?;
        let key = Self::encode_cursor_key(group, partition);

        match self.db.get_cf(&cursors_cf, key)? {
            Some(v) => Ok(Some(u64::from_be_bytes(to_array(&v)?))),
            None => Ok(None),
        }
    }

    async fn advance_cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Offset, StorageError> {
        let cursors_cf = self.cf(CF_CURSORS)?;
        let key = Self::encode_cursor_key(group, partition);

        let _guard = self.stripe(&key).lock();

        let current = match self.db.get_cf(&cursors_cf, &key)? {
            Some(v) => Some(u64::from_be_bytes(to_array(&v)?)),
            None => None,
        };

        match current {
            Some(stored) if stored >= offset => Ok(stored),
            _ => {
                self.db.put_cf(&cursors_cf, &key, offset.to_be_bytes())?;
                Ok(offset)
            }
        }
    }

    async fn compare_and_swap_message(
        &self,
        expected: &MessageRecord,
        next: &MessageRecord,
        dead_letter: Option<&DeadLetterRecord>,
    ) -> Result<bool, StorageError> {
        if expected.id != next.id {
            return Err(StorageError::Internal(format!(
                "swap of message {} with record of {}",
                expected.id, next.id
            )));
        }

        let messages_cf = self.cf(CF_MESSAGES)?;
        let failed_cf = self.cf(CF_FAILED)?;
        let redeliver_cf = self.cf(CF_REDELIVER)?;
        let dead_cf = self.cf(CF_DEAD_LETTERS)?;

        let _guard = self.stripe(expected.id.as_bytes()).lock();

        let current: MessageRecord = match self.db.get_cf(&messages_cf, expected.id.as_bytes())? {
            Some(v) => decode(&v)?,
            None => return Err(StorageError::MessageNotFound(expected.id)),
        };
        if current != *expected {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&messages_cf, next.id.as_bytes(), encode(next)?);

        if let Some(k) = Self::failed_key(expected) {
            batch.delete_cf(&failed_cf, k);
        }
        if let Some(k) = Self::redeliver_key(expected) {
            batch.delete_cf(&redeliver_cf, k);
        }
        if let Some(k) = Self::failed_key(next) {
            batch.put_cf(&failed_cf, k, next.id.as_bytes());
        }
        if let Some(k) = Self::redeliver_key(next) {
            batch.put_cf(&redeliver_cf, k, next.id.as_bytes());
        }

        if let Some(dl) = dead_letter {
            batch.put_cf(
                &dead_cf,
                Self::encode_timed_key(dl.dead_at, dl.message_id),
                encode(dl)?,
            );
        }

        self.db.write(batch)?;
        Ok(true)
    }

    async fn failed_batch(&self, limit: usize) -> Result<Vec<MessageRecord>, StorageError> {
        let failed_cf = self.cf(CF_FAILED)?;

        let mut out = Vec::new();
        for pair in self.db.iterator_cf(&failed_cf, IteratorMode::Start) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = pair?;
            let id = decode_uuid(&value)?;

            let Some(msg) = self.load_message(id)? else {
                tracing::warn!(message_id = %id, "failed index points at a missing message");
                continue;
            };
            if msg.status == MessageStatus::Failed {
                out.push(msg);
            }
        }

        Ok(out)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let dead_cf = self.cf(CF_DEAD_LETTERS)?;

        let mut out = Vec::new();
        for pair in self.db.iterator_cf(&dead_cf, IteratorMode::End) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = pair?;
            out.push(decode(&value)?);
        }

        Ok(out)
    }

    async fn status_counts(&self, max_attempts: u32) -> Result<StatusCounts, StorageError> {
        let messages_cf = self.cf(CF_MESSAGES)?;
        let dead_cf = self.cf(CF_DEAD_LETTERS)?;

        let mut counts = StatusCounts::default();
        for pair in self.db.iterator_cf(&messages_cf, IteratorMode::Start) {
            let (_, value) = pair?;
            let msg: MessageRecord = decode(&value)?;
            counts.total += 1;
            match msg.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Acknowledged => counts.acknowledged += 1,
                MessageStatus::Failed if msg.attempt_count < max_attempts => {
                    counts.failed_retryable += 1
                }
                MessageStatus::Failed | MessageStatus::Dead => {}
            }
        }

        for pair in self.db.iterator_cf(&dead_cf, IteratorMode::Start) {
            pair?;
            counts.dead_letters += 1;
        }

        Ok(counts)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_uuid(bytes: &[u8]) -> Result<Uuid, StorageError> {
    Uuid::from_slice(bytes).map_err(|e| StorageError::KeyDecode(format!("invalid id: {e}")))
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], StorageError> {
    bytes.try_into().map_err(|_| {
        StorageError::KeyDecode(format!(
            "expected value of length {}, got {}",
            N,
            bytes.len()
        ))
    })
}
