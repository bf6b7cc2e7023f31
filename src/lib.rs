#![allow(clippy::mutable_key_type)]

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::{
    messages::TopicName,
    protocol::{Encodable, StrBytes},
};

mod client;
pub use client::{Kafka, KafkaOptions, Transport, TxnContext};

mod consumer;
pub use consumer::{
    AssignHow, ConsumerRecord, ConsumerState, GroupOptions, Offset, OffsetResetStrategy,
    PartitionFetch, RebalanceCallback,
};

pub mod balancer {
    pub use crate::consumer::balancer::{
        CooperativeStickyBalancer, GroupBalancer, JoinPlan, MemberSubscription, RangeBalancer,
    };
}

mod coordinator;
pub use coordinator::{
    commit::{CommitDone, EpochOffset, TxnCommitDone, UncommittedOffsets},
    group::GroupConsumer,
};

mod error;
pub use error::{ConsumeError, Error, Result};

mod executor;
#[cfg(feature = "async-std-runtime")]
pub use executor::AsyncStdExecutor;
pub use executor::Executor;
#[cfg(feature = "tokio-runtime")]
pub use executor::TokioExecutor;

mod metadata;
pub use metadata::{Cluster, Node, TopicPartition};

type NodeId = i32;
type PartitionId = i32;
type MemberId = StrBytes;

const UNKNOWN_EPOCH: i32 = -1;
const UNKNOWN_OFFSET: i64 = -1;
const DEFAULT_GENERATION_ID: i32 = -1;

pub trait ToStrBytes {
    fn to_str_bytes(self) -> StrBytes;
}

impl ToStrBytes for String {
    fn to_str_bytes(self) -> StrBytes {
        StrBytes::from_string(self)
    }
}

// bytes utils
fn to_version_prefixed_bytes<M: Encodable>(version: i16, message: M) -> Result<Bytes> {
    let message_size = message.compute_size(version)?;
    let mut bytes = BytesMut::with_capacity(message_size + 2);
    bytes.put_i16(version);
    message.encode(&mut bytes, version)?;
    Ok(bytes.freeze())
}

pub fn topic_name<S: AsRef<str>>(topic: S) -> TopicName {
    let topic = topic.as_ref().to_string().to_str_bytes();
    TopicName(topic)
}
