use std::collections::HashMap;

use tracing::debug;

use crate::{client::KafkaClient, error::Result, PartitionId};

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new<S: Into<String>>(topic: S, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Node {
    pub id: i32,
    pub host: String,
    pub port: u16,
    address: String,
}

impl Node {
    pub fn new(id: i32, host: String, port: u16) -> Self {
        Self {
            id,
            host: host.clone(),
            port,
            address: format!("{host}:{port}"),
        }
    }

    pub fn address(&self) -> &String {
        &self.address
    }
}

/// Partition inventory of `topics`, loaded by the leader before every assignment. Topics
/// without any partition are left out.
pub async fn partitions_per_topic<'a, I>(
    client: &dyn KafkaClient,
    topics: I,
) -> Result<HashMap<String, Vec<PartitionId>>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut partitions_per_topic = HashMap::new();
    for topic in topics {
        let mut partitions = client.partitions(topic).await?;
        partitions.sort_unstable();
        partitions.dedup();
        if partitions.is_empty() {
            debug!("skipping assignment for topic {topic} since no metadata is available");
            continue;
        }
        partitions_per_topic.insert(topic.clone(), partitions);
    }
    Ok(partitions_per_topic)
}
