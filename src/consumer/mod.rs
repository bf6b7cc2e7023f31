pub(crate) mod balancer;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use kafka_protocol::messages::TopicName;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    consumer::balancer::{CooperativeStickyBalancer, GroupBalancer},
    metadata::TopicPartition,
    UNKNOWN_EPOCH,
};

/// A record as delivered to the application, trimmed to what the group core
/// needs for offset bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub offset: i64,
    /// Leader epoch the broker was at when the record was written; `-1` when
    /// unknown (pre-KIP-320 messages).
    pub leader_epoch: i32,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
}

/// One fetched partition's worth of records, handed over by the fetch
/// pipeline after delivery.
#[derive(Debug, Clone)]
pub struct PartitionFetch {
    pub topic: TopicName,
    pub partition: i32,
    pub records: Vec<ConsumerRecord>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum OffsetResetStrategy {
    #[default]
    Earliest,
    Latest,
    None,
}

impl OffsetResetStrategy {
    pub fn strategy_timestamp(&self) -> i64 {
        match self {
            Self::Earliest => -2,
            Self::Latest => -1,
            _ => 0,
        }
    }
}

/// A consume position for one partition. Non-negative `at` is a concrete
/// next-record offset; `-1`/`-2` are the latest/earliest sentinels the fetch
/// pipeline resolves through ListOffsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub at: i64,
    pub epoch: i32,
}

impl Default for Offset {
    fn default() -> Self {
        Self {
            at: -2,
            epoch: UNKNOWN_EPOCH,
        }
    }
}

impl Offset {
    pub fn at(at: i64, epoch: i32) -> Self {
        Self { at, epoch }
    }

    pub fn reset(strategy: OffsetResetStrategy) -> Self {
        Self {
            at: strategy.strategy_timestamp(),
            epoch: UNKNOWN_EPOCH,
        }
    }
}

/// How [`ConsumerState::maybe_assign_partitions`] treats current assignments
/// and buffered fetches when installing offsets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AssignHow {
    /// Drop everything currently assigned and buffered, then install.
    InvalidateAll,
    /// Drop assignments and buffers only for the partitions named in the
    /// offset map; used to knife out lost partitions cooperatively.
    InvalidateMatching,
    /// Merge the given offsets into the current assignment untouched.
    WithoutInvalidating,
}

#[derive(Default)]
struct ConsumerInner {
    /// Bumped on every group attach; group sessions capture it so a late
    /// installation from a dead session is refused.
    seq: u64,
    offsets: HashMap<TopicPartition, Offset>,
    buffered: HashMap<TopicPartition, Vec<ConsumerRecord>>,
}

/// Fetch-side state shared between the group core and the fetch pipeline.
#[derive(Default)]
pub struct ConsumerState {
    inner: Mutex<ConsumerInner>,
}

impl ConsumerState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq(&self) -> u64 {
        self.inner.lock().unwrap().seq
    }

    /// Starts a new assignment era and returns its sequence number.
    pub(crate) fn bump_seq(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        inner.seq
    }

    /// Installs fetch offsets for a group session, refusing stale sessions.
    ///
    /// Returns `false` without side effects when `seq` is not the current
    /// sequence; a Sync that raced a newer assignment must not install
    /// offsets that belong to a prior generation.
    pub fn maybe_assign_partitions(
        &self,
        seq: u64,
        offsets: HashMap<TopicName, HashMap<i32, Offset>>,
        how: AssignHow,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.seq != seq {
            debug!(
                "Refusing stale offset install, seq {} != current {}",
                seq, inner.seq
            );
            return false;
        }

        match how {
            AssignHow::InvalidateAll => {
                inner.offsets.clear();
                inner.buffered.clear();
                for (topic, partitions) in offsets {
                    for (partition, offset) in partitions {
                        inner
                            .offsets
                            .insert(TopicPartition::new(topic.clone(), partition), offset);
                    }
                }
            }
            AssignHow::InvalidateMatching => {
                for (topic, partitions) in offsets {
                    for partition in partitions.into_keys() {
                        let tp = TopicPartition::new(topic.clone(), partition);
                        inner.offsets.remove(&tp);
                        inner.buffered.remove(&tp);
                    }
                }
            }
            AssignHow::WithoutInvalidating => {
                for (topic, partitions) in offsets {
                    for (partition, offset) in partitions {
                        inner
                            .offsets
                            .insert(TopicPartition::new(topic.clone(), partition), offset);
                    }
                }
            }
        }
        true
    }

    /// Called by the fetch pipeline when records arrive but are not yet
    /// polled by the application.
    pub fn buffer_fetch(&self, fetch: PartitionFetch) {
        let tp = TopicPartition::new(fetch.topic.clone(), fetch.partition);
        self.inner
            .lock()
            .unwrap()
            .buffered
            .entry(tp)
            .or_default()
            .extend(fetch.records);
    }

    pub fn buffered_records(&self, tp: &TopicPartition) -> usize {
        self.inner
            .lock()
            .unwrap()
            .buffered
            .get(tp)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    pub fn assigned_offset(&self, tp: &TopicPartition) -> Option<Offset> {
        self.inner.lock().unwrap().offsets.get(tp).copied()
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.inner.lock().unwrap().offsets.keys().cloned().collect()
    }
}

/// A rebalance hook. Called from an internal task with the session scope and
/// the affected partitions; it must not block the task beyond that scope.
pub type RebalanceCallback = Arc<
    dyn Fn(CancellationToken, HashMap<TopicName, Vec<i32>>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Group consuming configuration.
///
/// `topics` holds literal names, or regex patterns when `regex_topics` is
/// set. The default balancer is cooperative-sticky; overriding it with a mix
/// of cooperative and eager balancers is rejected at attach.
#[derive(Clone)]
pub struct GroupOptions {
    pub group_id: String,
    pub topics: HashSet<String>,
    pub regex_topics: bool,
    pub balancers: Vec<Arc<dyn GroupBalancer>>,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub heartbeat_interval_ms: i32,
    pub autocommit_disable: bool,
    pub autocommit_interval_ms: i32,
    pub instance_id: Option<String>,
    pub auto_offset_reset: OffsetResetStrategy,
    pub retry_backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    pub on_assigned: Option<RebalanceCallback>,
    pub on_revoked: Option<RebalanceCallback>,
    pub on_lost: Option<RebalanceCallback>,
}

impl GroupOptions {
    pub fn new<S: AsRef<str>>(group: S) -> Self {
        Self {
            group_id: group.as_ref().to_string(),
            ..Default::default()
        }
    }

    pub fn topic<S: AsRef<str>>(mut self, topic: S) -> Self {
        self.topics.insert(topic.as_ref().to_string());
        self
    }

    pub fn instance_id<S: AsRef<str>>(mut self, id: S) -> Self {
        self.instance_id = Some(id.as_ref().to_string());
        self
    }
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            group_id: Default::default(),
            topics: HashSet::new(),
            regex_topics: false,
            balancers: vec![Arc::new(CooperativeStickyBalancer)],
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 60_000,
            heartbeat_interval_ms: 3_000,
            autocommit_disable: false,
            autocommit_interval_ms: 5_000,
            instance_id: None,
            auto_offset_reset: OffsetResetStrategy::Earliest,
            retry_backoff: Arc::new(default_retry_backoff),
            on_assigned: None,
            on_revoked: None,
            on_lost: None,
        }
    }
}

fn default_retry_backoff(consecutive_errors: u32) -> Duration {
    let backoff = 100u64.saturating_mul(1 << consecutive_errors.min(4));
    Duration::from_millis(backoff.min(1_000))
}
