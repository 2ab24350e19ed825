use std::sync::Arc;

use crate::{
    broker::BrokerError,
    storage::{Storage, TopicRecord},
    util::unix_millis,
};

/// Creates and lists topics. Partition sets are fixed at creation.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    storage: Arc<dyn Storage>,
    max_partitions: u32,
}

impl TopicRegistry {
    pub fn new(storage: Arc<dyn Storage>, max_partitions: u32) -> Self {
        Self {
            storage,
            max_partitions,
        }
    }

    /// A non-positive `partition_count` means one partition.
    pub async fn create_topic(
        &self,
        name: &str,
        partition_count: i64,
    ) -> Result<TopicRecord, BrokerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::Validation("topic name is required".into()));
        }

        let count = if partition_count <= 0 {
            1
        } else {
            u32::try_from(partition_count)
                .ok()
                .filter(|c| *c <= self.max_partitions)
                .ok_or_else(|| {
                    BrokerError::Validation(format!(
                        "partition count {partition_count} exceeds limit {}",
                        self.max_partitions
                    ))
                })?
        };

        let topic = self
            .storage
            .create_topic(name, count, unix_millis())
            .await?;

        tracing::info!(topic = %topic.name, partitions = count, "topic created");
        Ok(topic)
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicRecord>, BrokerError> {
        let mut topics = self.storage.list_topics().await?;
        for t in &mut topics {
            t.partitions.sort_by_key(|p| p.number);
        }
        Ok(topics)
    }

    pub async fn lookup(&self, name: &str) -> Result<TopicRecord, BrokerError> {
        let mut topic = self
            .storage
            .topic_by_name(name)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("topic {name}")))?;
        topic.partitions.sort_by_key(|p| p.number);
        Ok(topic)
    }
}
