use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::storage::*;

/// Volatile store. One mutex guards the whole state, so every trait method
/// is trivially atomic. Used by tests and by `--storage memory`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    topics: Vec<TopicRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    logs: HashMap<PartitionId, Vec<MessageId>>,
    groups: HashMap<String, GroupRecord>,
    cursors: HashMap<(GroupId, PartitionId), Offset>,
    failed: BTreeSet<(UnixMillis, MessageId)>,
    dead_letters: BTreeMap<(UnixMillis, MessageId), DeadLetterRecord>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_topic(
        &self,
        name: &str,
        partitions: u32,
        now: UnixMillis,
    ) -> Result<TopicRecord, StorageError> {
        let mut state = self.state.lock();
        if state.topics.iter().any(|t| t.name == name) {
            return Err(StorageError::TopicExists(name.to_string()));
        }

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

        for p in &topic.partitions {
            state.logs.insert(p.id, Vec::new());
        }
        state.topics.push(topic.clone());

        Ok(topic)
    }

    async fn topic_by_name(&self, name: &str) -> Result<Option<TopicRecord>, StorageError> {
        let state = self.state.lock();
        Ok(state.topics.iter().find(|t| t.name == name).cloned())
    }

    async fn list_topics(&self) -> Result<Vec<TopicRecord>, StorageError> {
        Ok(self.state.lock().topics.clone())
    }

    async fn append(
        &self,
        partition: PartitionId,
        payload: &[u8],
        now: UnixMillis,
    ) -> Result<MessageRecord, StorageError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let log = state
            .logs
            .get_mut(&partition)
            .ok_or(StorageError::PartitionNotFound(partition))?;

        let msg = MessageRecord {
            id: Uuid::new_v4(),
            partition_id: partition,
            offset: log.len() as Offset,
            payload: payload.to_vec(),
            status: MessageStatus::Pending,
            attempt_count: 0,
            created_at: now,
            last_attempt_at: None,
            acked_at: None,
        };
        log.push(msg.id);
        state.messages.insert(msg.id, msg.clone());

        Ok(msg)
    }

    async fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError> {
        Ok(self.state.lock().messages.get(&id).cloned())
    }

    async fn read_log(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let state = self.state.lock();
        let Some(log) = state.logs.get(&partition) else {
            return Ok(Vec::new());
        };

        log.iter()
            .skip(from as usize)
            .take(max)
            .map(|id| {
                state
                    .messages
                    .get(id)
                    .cloned()
                    .ok_or(StorageError::MessageNotFound(*id))
            })
            .collect()
    }

    async fn redeliverable(
        &self,
        partition: PartitionId,
        max: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let state = self.state.lock();
        let Some(log) = state.logs.get(&partition) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|m| m.is_redeliverable())
            .take(max)
            .cloned()
            .collect())
    }

    async fn resolve_group(&self, name: &str) -> Result<GroupRecord, StorageError> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .entry(name.to_string())
            .or_insert_with(|| GroupRecord {
                id: Uuid::new_v4(),
                name: name.to_string(),
            });
        Ok(group.clone())
    }

    async fn cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Option<Offset>, StorageError> {
        Ok(self.state.lock().cursors.get(&(group, partition)).copied())
    }

    async fn advance_cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Offset, StorageError> {
        let mut state = self.state.lock();
        let stored = state.cursors.entry((group, partition)).or_insert(offset);
        *stored = (*stored).max(offset);
        Ok(*stored)
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

        let mut state = self.state.lock();
        match state.messages.get(&expected.id) {
            None => return Err(StorageError::MessageNotFound(expected.id)),
            Some(current) if current != expected => return Ok(false),
            Some(_) => {}
        }

        if expected.status == MessageStatus::Failed {
            state
                .failed
                .remove(&(expected.last_attempt_at.unwrap_or(0), expected.id));
        }
        if next.status == MessageStatus::Failed {
            state
                .failed
                .insert((next.last_attempt_at.unwrap_or(0), next.id));
        }
        if let Some(dl) = dead_letter {
            state
                .dead_letters
                .insert((dl.dead_at, dl.message_id), dl.clone());
        }
        state.messages.insert(next.id, next.clone());

        Ok(true)
    }

    async fn failed_batch(&self, limit: usize) -> Result<Vec<MessageRecord>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .failed
            .iter()
            .filter_map(|(_, id)| state.messages.get(id))
            .filter(|m| m.status == MessageStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn status_counts(&self, max_attempts: u32) -> Result<StatusCounts, StorageError> {
        let state = self.state.lock();
        let mut counts = StatusCounts {
            total: state.messages.len() as u64,
            dead_letters: state.dead_letters.len() as u64,
            ..StatusCounts::default()
        };

        for msg in state.messages.values() {
            match msg.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Acknowledged => counts.acknowledged += 1,
                MessageStatus::Failed if msg.attempt_count < max_attempts => {
                    counts.failed_retryable += 1
                }
                MessageStatus::Failed | MessageStatus::Dead => {}
            }
        }

        Ok(counts)
    }
}
