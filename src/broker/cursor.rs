use std::sync::Arc;

use crate::{
    broker::BrokerError,
    storage::{GroupId, GroupRecord, Offset, PartitionId, Storage},
};

/// Per (group, partition) read progress. The stored value is the offset of
/// the last message handed to the group; it only ever moves forward.
#[derive(Debug, Clone)]
pub struct CursorManager {
    storage: Arc<dyn Storage>,
}

impl CursorManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn resolve_group(&self, name: &str) -> Result<GroupRecord, BrokerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::Validation("group name is required".into()));
        }
        Ok(self.storage.resolve_group(name).await?)
    }

    pub async fn next_offset(
        &self,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Offset, BrokerError> {
        let cursor = self.storage.cursor(group, partition).await?;
        Ok(cursor.map_or(0, |c| c + 1))
    }

    /// Returns the cursor after the call, which may be higher than `offset`.
    pub async fn advance_cursor(
        &self,
        group: GroupId,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Offset, BrokerError> {
        Ok(self
            .storage
            .advance_cursor(group, partition, offset)
            .await?)
    }
}
