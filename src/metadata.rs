use std::{
    fmt::{Debug, Display, Formatter},
    sync::{Arc, Mutex},
};

use dashmap::{DashMap, DashSet};
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        metadata_response::{
            MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
        },
        BrokerId, MetadataResponse, TopicName,
    },
    protocol::StrBytes,
    ResponseError,
};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    NodeId, PartitionId,
};

#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub id: Uuid,
    pub name: StrBytes,
    pub is_internal: bool,
    pub partitions: Vec<Partition>,
}

impl From<(&TopicName, &MetadataResponseTopic)> for Topic {
    fn from((topic_name, topic): (&TopicName, &MetadataResponseTopic)) -> Self {
        Self {
            id: topic.topic_id,
            is_internal: topic.is_internal,
            partitions: topic
                .partitions
                .iter()
                .filter(|p| p.error_code.is_ok())
                .map(Into::into)
                .collect(),
            name: topic_name.0.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Hash)]
pub struct Partition {
    pub partition: PartitionId,
    pub leader: NodeId,
    pub leader_epoch: i32,
}

impl From<&MetadataResponsePartition> for Partition {
    fn from(partition: &MetadataResponsePartition) -> Self {
        Self {
            partition: partition.partition_index,
            leader: partition.leader_id.0,
            leader_epoch: partition.leader_epoch,
        }
    }
}

#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: TopicName, partition: PartitionId) -> Self {
        Self { topic, partition }
    }
}

impl Debug for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPartition")
            .field("topic", &self.topic.0)
            .field("partition", &self.partition)
            .finish()
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition [{} - {}]", self.topic.0.as_str(), self.partition)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Node {
    pub id: NodeId,
    address: String,
}

impl Node {
    pub fn new(id: BrokerId, host: StrBytes, port: i32) -> Self {
        Self {
            id: id.0,
            address: format!("{}:{port}", host.as_str()),
        }
    }

    pub fn address(&self) -> &String {
        &self.address
    }
}

impl From<(&BrokerId, &MetadataResponseBroker)> for Node {
    fn from((id, broker): (&BrokerId, &MetadataResponseBroker)) -> Self {
        Node::new(*id, broker.host.clone(), broker.port)
    }
}

/// Cluster metadata snapshot as last merged from a metadata response.
///
/// The group core reads partition counts and internal-topic flags out of this
/// when reconciling its subscription; the surrounding client refreshes it.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub id: Arc<Mutex<Option<StrBytes>>>,
    pub unauthorized_topics: DashSet<TopicName>,
    pub invalid_topics: DashSet<TopicName>,
    pub internal_topics: DashSet<TopicName>,
    pub topics: DashMap<TopicName, Topic>,
    pub nodes: DashMap<NodeId, Node>,
}

impl Cluster {
    pub fn empty() -> Cluster {
        Default::default()
    }

    pub fn merge_meta(&self, other: MetadataResponse) -> Result<()> {
        let cluster_id = other.cluster_id;
        {
            let mut lock = self.id.lock()?;
            if lock.is_none() {
                *lock = cluster_id;
            } else if *lock != cluster_id {
                return Err(Error::Custom(format!(
                    "cluster id: {cluster_id:?} is not equal to {:?}",
                    *lock
                )));
            }
        }
        for broker in other.brokers.iter() {
            self.nodes.insert(**broker.0, broker.into());
        }
        for (topic_name, res) in other.topics.iter() {
            let error_code = res.error_code;
            if error_code.is_ok() {
                if res.is_internal {
                    self.internal_topics.insert(topic_name.clone());
                }
                let topic: Topic = (topic_name, res).into();
                self.unauthorized_topics.remove(topic_name);
                self.invalid_topics.remove(topic_name);
                self.topics.insert(topic_name.clone(), topic);
            } else {
                self.topics.remove(topic_name);

                match error_code.err() {
                    Some(ResponseError::TopicAuthorizationFailed) => {
                        self.unauthorized_topics.insert(topic_name.clone());
                    }
                    Some(ResponseError::InvalidTopicException) => {
                        self.invalid_topics.insert(topic_name.clone());
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    pub fn num_partitions(&self, topic: &TopicName) -> i32 {
        self.topics
            .get(topic)
            .map(|entry| entry.value().partitions.len() as i32)
            .unwrap_or(0)
    }

    pub fn is_internal(&self, topic: &TopicName) -> bool {
        self.internal_topics.contains(topic)
    }
}
