use std::sync::Arc;

use crate::{
    broker::BrokerError,
    storage::{MessageRecord, Offset, PartitionId, Storage},
    util::unix_millis,
};

/// Producer side of a partition log. Offset allocation itself lives in the
/// storage adapter, which serialises appends per partition.
#[derive(Debug, Clone)]
pub struct LogAppender {
    storage: Arc<dyn Storage>,
}

impl LogAppender {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn append(
        &self,
        partition: PartitionId,
        payload: &[u8],
    ) -> Result<MessageRecord, BrokerError> {
        let msg = self
            .storage
            .append(partition, payload, unix_millis())
            .await?;

        tracing::debug!(
            message_id = %msg.id,
            partition = %partition,
            offset = msg.offset,
            "appended"
        );
        Ok(msg)
    }

    /// Messages at or after `from`, ascending.
    pub async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<MessageRecord>, BrokerError> {
        Ok(self.storage.read_log(partition, from, max).await?)
    }

    /// Requeued messages waiting for redelivery, ascending by offset.
    pub async fn redeliverable(
        &self,
        partition: PartitionId,
        max: usize,
    ) -> Result<Vec<MessageRecord>, BrokerError> {
        Ok(self.storage.redeliverable(partition, max).await?)
    }
}
