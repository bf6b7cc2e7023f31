use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::{
    messages::{
        consumer_protocol_assignment::TopicPartition as CpaTopicPartition,
        consumer_protocol_subscription::TopicPartition as CpsTopicPartition,
        sync_group_request::SyncGroupRequestAssignment, ConsumerProtocolAssignment,
        ConsumerProtocolSubscription, TopicName,
    },
    protocol::{buf::ByteBuf, Decodable, Message, StrBytes},
};

use crate::{
    error::{ConsumeError, Result},
    to_version_prefixed_bytes, Error, MemberId, PartitionId,
};

/// A balancing strategy the group advertises in its JoinGroup protocols.
///
/// `metadata_for` produces the bytes sent for this protocol; `balance` runs
/// on the elected leader only and lays every member's partitions out into a
/// plan. Cooperative and eager strategies must never be mixed in one group.
pub trait GroupBalancer: Send + Sync + 'static {
    fn protocol_name(&self) -> &'static str;

    fn is_cooperative(&self) -> bool;

    fn metadata_for(
        &self,
        topics: &HashSet<TopicName>,
        current_assignment: &HashMap<TopicName, Vec<PartitionId>>,
        generation: i32,
    ) -> Result<Bytes>;

    fn balance(
        &self,
        members: &HashMap<MemberId, MemberSubscription>,
        partitions_per_topic: &HashMap<TopicName, i32>,
    ) -> Result<JoinPlan>;
}

/// Selects the balancer the coordinator chose for this generation.
pub(crate) fn look_up_balancer<'a>(
    balancers: &'a [std::sync::Arc<dyn GroupBalancer>],
    name: &str,
) -> Result<&'a std::sync::Arc<dyn GroupBalancer>> {
    balancers
        .iter()
        .find(|balancer| balancer.protocol_name() == name)
        .ok_or_else(|| ConsumeError::BalancerNotAvailable(name.to_string()).into())
}

/// Validates the configured strategies agree on a rebalance protocol and
/// returns whether the group session is cooperative.
pub(crate) fn session_protocol(
    balancers: &[std::sync::Arc<dyn GroupBalancer>],
) -> Result<bool> {
    let any_cooperative = balancers.iter().any(|balancer| balancer.is_cooperative());
    let any_eager = balancers.iter().any(|balancer| !balancer.is_cooperative());
    if any_cooperative && any_eager {
        return Err(ConsumeError::MixedBalancerProtocols.into());
    }
    Ok(!any_eager)
}

/// One member's join metadata, as decoded from `ConsumerProtocolSubscription`.
#[derive(Debug, Clone, Default)]
pub struct MemberSubscription {
    pub topics: HashSet<TopicName>,
    pub user_data: Option<Bytes>,
    pub owned_partitions: HashMap<TopicName, Vec<PartitionId>>,
    pub group_instance_id: Option<StrBytes>,
}

impl MemberSubscription {
    fn check_version(version: i16) -> Result<i16> {
        if version < ConsumerProtocolSubscription::VERSIONS.min {
            Err(Error::InvalidVersion(version))
        } else if version > ConsumerProtocolSubscription::VERSIONS.max {
            Ok(ConsumerProtocolSubscription::VERSIONS.max)
        } else {
            Ok(version)
        }
    }

    pub fn deserialize_from_bytes<B: ByteBuf>(buf: &mut B) -> Result<Self> {
        let version = buf.get_i16();
        let version = Self::check_version(version)?;

        let subscription = ConsumerProtocolSubscription::decode(buf, version)?;
        let mut topics = HashSet::with_capacity(subscription.topics.len());
        for topic in subscription.topics.iter() {
            topics.insert(TopicName(topic.clone()));
        }

        let mut owned_partitions = HashMap::with_capacity(subscription.owned_partitions.len());
        for (topic, partitions) in subscription.owned_partitions {
            owned_partitions.insert(topic, partitions.partitions);
        }

        Ok(MemberSubscription {
            topics,
            user_data: subscription.user_data,
            owned_partitions,
            group_instance_id: None,
        })
    }

    pub fn serialize_to_bytes(self) -> Result<Bytes> {
        let version = ConsumerProtocolSubscription::VERSIONS.max;
        let mut topics = Vec::with_capacity(self.topics.len());
        for topic in self.topics.iter() {
            topics.push(topic.0.clone());
        }
        let mut owned_partitions = IndexMap::with_capacity(self.owned_partitions.len());
        for (topic, partitions) in self.owned_partitions {
            owned_partitions.insert(topic, CpsTopicPartition {
                partitions,
                ..Default::default()
            });
        }

        let subscription = ConsumerProtocolSubscription {
            topics,
            user_data: self.user_data,
            owned_partitions,
            ..Default::default()
        };

        to_version_prefixed_bytes(version, subscription)
    }

    /// Generation carried in the sticky user data, `-1` when absent.
    fn generation(&self) -> i32 {
        match &self.user_data {
            Some(data) if data.len() >= 4 => {
                let mut buf = data.clone();
                buf.get_i32()
            }
            _ => -1,
        }
    }
}

/// The leader-side assignment plan for one generation.
#[derive(Debug, Clone, Default)]
pub struct JoinPlan {
    pub assignments: HashMap<MemberId, HashMap<TopicName, Vec<PartitionId>>>,
}

impl JoinPlan {
    /// Serializes the plan into SyncGroup assignments, one
    /// `ConsumerProtocolAssignment` per member.
    pub fn into_sync_assignment(self) -> Result<Vec<SyncGroupRequestAssignment>> {
        let version = ConsumerProtocolAssignment::VERSIONS.max;
        let mut sync_group_assignments = Vec::with_capacity(self.assignments.len());
        for (member_id, partitions) in self.assignments {
            let mut assigned_partitions = IndexMap::with_capacity(partitions.len());
            for (topic, partitions) in partitions {
                assigned_partitions.insert(topic, CpaTopicPartition {
                    partitions,
                    ..Default::default()
                });
            }
            let assignment = to_version_prefixed_bytes(version, ConsumerProtocolAssignment {
                assigned_partitions,
                ..Default::default()
            })?;

            sync_group_assignments.push(SyncGroupRequestAssignment {
                member_id,
                assignment,
                ..Default::default()
            });
        }
        Ok(sync_group_assignments)
    }
}

fn check_assignment_version(version: i16) -> Result<i16> {
    if version < ConsumerProtocolAssignment::VERSIONS.min {
        Err(Error::InvalidVersion(version))
    } else if version > ConsumerProtocolAssignment::VERSIONS.max {
        Ok(ConsumerProtocolAssignment::VERSIONS.max)
    } else {
        Ok(version)
    }
}

/// Decodes the member assignment bytes a SyncGroup response carries.
pub(crate) fn decode_member_assignment<B: ByteBuf>(
    buf: &mut B,
) -> Result<HashMap<TopicName, Vec<PartitionId>>> {
    let version = buf.get_i16();
    let version = check_assignment_version(version)?;
    let assignment = ConsumerProtocolAssignment::decode(buf, version)?;

    let mut topic_partitions = HashMap::new();
    for (topic_name, partitions) in assignment.assigned_partitions {
        topic_partitions.insert(topic_name, partitions.partitions);
    }
    Ok(topic_partitions)
}

fn subscription_metadata(
    topics: &HashSet<TopicName>,
    owned_partitions: HashMap<TopicName, Vec<PartitionId>>,
    user_data: Option<Bytes>,
) -> Result<Bytes> {
    MemberSubscription {
        topics: topics.clone(),
        user_data,
        owned_partitions,
        group_instance_id: None,
    }
    .serialize_to_bytes()
}

#[derive(Debug, Clone)]
struct MemberInfo<'a> {
    member_id: &'a StrBytes,
    group_instance_id: Option<&'a StrBytes>,
}

impl<'a> MemberInfo<'a> {
    /// Static members order first by instance id so that assignment stays
    /// stable across restarts.
    fn sort(member_a: &MemberInfo, member_b: &MemberInfo) -> Ordering {
        match (member_a.group_instance_id, member_b.group_instance_id) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => member_a.member_id.cmp(member_b.member_id),
        }
    }
}

/// Sticky assignment with cooperative rebalancing.
///
/// Members keep the partitions they already own as long as the topic is
/// still subscribed and the partition still exists; everything unowned is
/// spread to the least-loaded subscriber. When two members claim the same
/// partition, the claim from the higher generation wins; the generation is
/// carried in the subscription user data.
#[derive(Debug, Clone)]
pub struct CooperativeStickyBalancer;

impl GroupBalancer for CooperativeStickyBalancer {
    fn protocol_name(&self) -> &'static str {
        "cooperative-sticky"
    }

    fn is_cooperative(&self) -> bool {
        true
    }

    fn metadata_for(
        &self,
        topics: &HashSet<TopicName>,
        current_assignment: &HashMap<TopicName, Vec<PartitionId>>,
        generation: i32,
    ) -> Result<Bytes> {
        let user_data = if generation >= 0 {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_i32(generation);
            Some(buf.freeze())
        } else {
            None
        };
        subscription_metadata(topics, current_assignment.clone(), user_data)
    }

    fn balance(
        &self,
        members: &HashMap<MemberId, MemberSubscription>,
        partitions_per_topic: &HashMap<TopicName, i32>,
    ) -> Result<JoinPlan> {
        let mut plan = JoinPlan::default();
        for member_id in members.keys() {
            plan.assignments.insert(member_id.clone(), HashMap::new());
        }

        // Owned partitions first. A partition claimed twice goes to the
        // claim from the higher generation; ties break on member id.
        let mut owners: HashMap<(TopicName, PartitionId), (&MemberId, i32)> = HashMap::new();
        for (member_id, subscription) in members {
            let generation = subscription.generation();
            for (topic, partitions) in &subscription.owned_partitions {
                let Some(&count) = partitions_per_topic.get(topic) else {
                    continue;
                };
                if !subscription.topics.contains(topic) {
                    continue;
                }
                for partition in partitions {
                    if *partition >= count {
                        continue;
                    }
                    let key = (topic.clone(), *partition);
                    let replace = match owners.get(&key) {
                        None => true,
                        Some((held_by, held_generation)) => {
                            generation > *held_generation
                                || (generation == *held_generation && member_id < *held_by)
                        }
                    };
                    if replace {
                        owners.insert(key, (member_id, generation));
                    }
                }
            }
        }

        let mut counts: HashMap<MemberId, usize> =
            members.keys().map(|id| (id.clone(), 0)).collect();
        for ((topic, partition), (member_id, _)) in &owners {
            plan.assignments
                .get_mut(*member_id)
                .unwrap()
                .entry(topic.clone())
                .or_default()
                .push(*partition);
            *counts.get_mut(*member_id).unwrap() += 1;
        }

        // Everything unowned goes to the least-loaded subscriber.
        let mut topics: Vec<&TopicName> = partitions_per_topic.keys().collect();
        topics.sort();
        for topic in topics {
            let count = partitions_per_topic[topic];
            for partition in 0..count {
                if owners.contains_key(&((*topic).clone(), partition)) {
                    continue;
                }
                let target = members
                    .iter()
                    .filter(|(_, subscription)| subscription.topics.contains(topic))
                    .map(|(id, _)| id)
                    .min_by_key(|id| (counts[*id], (*id).clone()))
                    .cloned();
                let Some(target) = target else { continue };
                plan.assignments
                    .get_mut(&target)
                    .unwrap()
                    .entry((*topic).clone())
                    .or_default()
                    .push(partition);
                *counts.get_mut(&target).unwrap() += 1;
            }
        }

        for partitions in plan.assignments.values_mut() {
            for list in partitions.values_mut() {
                list.sort_unstable();
            }
        }
        Ok(plan)
    }
}

/// Per-topic range assignment, eager protocol.
///
/// For each topic the partitions are laid out in numeric order and the
/// subscribed members in instance-then-member-id order; partitions divide
/// evenly with the first members taking one extra when it does not.
#[derive(Debug, Clone)]
pub struct RangeBalancer;

impl RangeBalancer {
    fn consumers_per_topic<'a>(
        &'a self,
        members: &'a HashMap<MemberId, MemberSubscription>,
    ) -> HashMap<&'a TopicName, Vec<MemberInfo<'a>>> {
        let mut topic_to_consumers: HashMap<&TopicName, Vec<MemberInfo>> = HashMap::new();
        for (member_id, subscription) in members {
            let member = MemberInfo {
                member_id,
                group_instance_id: subscription.group_instance_id.as_ref(),
            };
            for topic in &subscription.topics {
                topic_to_consumers
                    .entry(topic)
                    .or_default()
                    .push(member.clone());
            }
        }
        topic_to_consumers
    }
}

impl GroupBalancer for RangeBalancer {
    fn protocol_name(&self) -> &'static str {
        "range"
    }

    fn is_cooperative(&self) -> bool {
        false
    }

    fn metadata_for(
        &self,
        topics: &HashSet<TopicName>,
        _current_assignment: &HashMap<TopicName, Vec<PartitionId>>,
        _generation: i32,
    ) -> Result<Bytes> {
        // Eager members drop everything on rebalance; no owned partitions.
        subscription_metadata(topics, HashMap::new(), None)
    }

    fn balance(
        &self,
        members: &HashMap<MemberId, MemberSubscription>,
        partitions_per_topic: &HashMap<TopicName, i32>,
    ) -> Result<JoinPlan> {
        let consumers_per_topic = self.consumers_per_topic(members);

        let mut plan = JoinPlan::default();
        for member_id in members.keys() {
            plan.assignments.insert(member_id.clone(), HashMap::new());
        }

        for (topic, mut consumers) in consumers_per_topic {
            let num_partitions = *partitions_per_topic.get(topic).unwrap_or(&0);
            if num_partitions == 0 {
                continue;
            }
            let num_consumers = consumers.len() as i32;
            consumers.sort_by(MemberInfo::sort);
            let per_consumer = num_partitions / num_consumers;
            let with_extra = num_partitions % num_consumers;

            for (i, member) in consumers.iter().enumerate() {
                let i = i as i32;
                let start = per_consumer * i + i.min(with_extra);
                let length = per_consumer + if i + 1 > with_extra { 0 } else { 1 };
                if length == 0 {
                    continue;
                }
                let assigned = plan
                    .assignments
                    .get_mut(member.member_id)
                    .unwrap()
                    .entry(topic.clone())
                    .or_default();
                for partition in start..start + length {
                    assigned.push(partition);
                }
            }
        }
        Ok(plan)
    }
}
