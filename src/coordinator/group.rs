use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    channel::oneshot,
    future::Shared,
    FutureExt, StreamExt,
};
use indexmap::IndexMap;
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        join_group_request::JoinGroupRequestProtocol,
        join_group_response::JoinGroupResponseMember,
        leave_group_request::MemberIdentity,
        offset_fetch_request::{
            OffsetFetchRequestGroup, OffsetFetchRequestTopic, OffsetFetchRequestTopics,
        },
        ApiKey, GroupId, HeartbeatRequest, JoinGroupRequest, LeaveGroupRequest,
        OffsetFetchRequest, SyncGroupRequest, TopicName,
    },
    protocol::StrBytes,
    ResponseError,
};
use regex::Regex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::Kafka,
    consumer::{
        balancer::{
            decode_member_assignment, look_up_balancer, session_protocol, GroupBalancer,
            JoinPlan, MemberSubscription,
        },
        AssignHow, ConsumerState, GroupOptions, Offset, OffsetResetStrategy, RebalanceCallback,
    },
    coordinator::{commit::UncommittedLedger, find_coordinator, CoordinatorType},
    error::{ConsumeError, Result},
    executor::Executor,
    metadata::Node,
    Error, MemberId, PartitionId, ToStrBytes, DEFAULT_GENERATION_ID, UNKNOWN_EPOCH,
    UNKNOWN_OFFSET,
};

const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

pub(crate) type Assigned = HashMap<TopicName, Vec<PartitionId>>;

type DoneSignal = Shared<oneshot::Receiver<()>>;

/// Mutable group membership and offset state, guarded by one mutex.
///
/// The mutex is never held across an RPC; callers snapshot what they need,
/// release, then go to the wire.
pub(crate) struct GroupState {
    pub(crate) member_id: MemberId,
    pub(crate) generation: i32,
    pub(crate) leader: bool,
    /// Topics the subscription currently spans, with the partition count the
    /// join metadata was last built from.
    pub(crate) using: HashMap<TopicName, i32>,
    /// Topics already tested against the regex subscription; never retested.
    pub(crate) re_seen: HashSet<TopicName>,
    pub(crate) last_assigned: Assigned,
    pub(crate) now_assigned: Assigned,
    pub(crate) uncommitted: UncommittedLedger,
    pub(crate) commit_cancel: Option<CancellationToken>,
    pub(crate) commit_done: Option<oneshot::Receiver<()>>,
    pub(crate) block_auto: bool,
}

impl GroupState {
    fn new() -> Self {
        Self {
            member_id: MemberId::default(),
            generation: DEFAULT_GENERATION_ID,
            leader: false,
            using: HashMap::new(),
            re_seen: HashSet::new(),
            last_assigned: HashMap::new(),
            now_assigned: HashMap::new(),
            uncommitted: UncommittedLedger::new(),
            commit_cancel: None,
            commit_done: None,
            block_auto: false,
        }
    }
}

/// A group member: joins the group, keeps the membership alive with
/// heartbeats, runs the rebalance callbacks in order and commits offsets.
///
/// Created by [`GroupConsumer::new`]; the supervisor starts once the first
/// subscribed topic shows up in metadata.
pub struct GroupConsumer<Exe: Executor> {
    pub(crate) client: Kafka<Exe>,
    pub(crate) consumer: Arc<ConsumerState>,
    /// Consumer sequence captured at attach; offset installs carry it so a
    /// stale session cannot clobber a newer assignment.
    pub(crate) session_seq: u64,
    pub(crate) ctx: CancellationToken,
    pub(crate) node: Node,
    pub(crate) group_id: GroupId,
    topics: HashSet<TopicName>,
    regex_topics: bool,
    re_patterns: Vec<Regex>,
    balancers: Vec<Arc<dyn GroupBalancer>>,
    pub(crate) cooperative: bool,
    pub(crate) instance_id: Option<StrBytes>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    heartbeat_interval: Duration,
    pub(crate) autocommit_disable: bool,
    pub(crate) autocommit_interval: Duration,
    auto_offset_reset: OffsetResetStrategy,
    retry_backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    on_assigned: Option<RebalanceCallback>,
    on_revoked: Option<RebalanceCallback>,
    on_lost: Option<RebalanceCallback>,
    /// Single-slot rejoin signal; writes collapse, reads drain.
    rejoin_slot: Notify,
    pub(crate) state: Mutex<GroupState>,
}

impl<Exe: Executor> GroupConsumer<Exe> {
    /// Attaches to a consumer group: discovers the group coordinator,
    /// validates the balancer protocols and spawns the background tasks.
    /// The group is joined once metadata shows a subscribed topic.
    pub async fn new(client: Kafka<Exe>, options: GroupOptions) -> Result<Arc<Self>> {
        let ctx = CancellationToken::new();
        let group_key = options.group_id.clone().to_str_bytes();
        let node =
            find_coordinator(&client, &ctx, group_key.clone(), CoordinatorType::Group).await?;
        info!(
            "Find coordinator success, group {:?}, node: {:?}",
            options.group_id, node
        );

        let cooperative = session_protocol(&options.balancers)?;

        let mut re_patterns = Vec::new();
        if options.regex_topics {
            for pattern in options.topics.iter() {
                re_patterns.push(
                    Regex::new(pattern)
                        .map_err(|e| Error::Custom(format!("invalid topic pattern: {e}")))?,
                );
            }
        }

        // A transactional client must not autocommit and gets no default
        // revoke; the transaction lifecycle owns the commit points.
        let transactional = client.txn.is_some();
        let autocommit_disable = options.autocommit_disable || transactional;

        let consumer = Arc::new(ConsumerState::new());
        let session_seq = consumer.bump_seq();

        let group = Arc::new(Self {
            client: client.clone(),
            consumer,
            session_seq,
            ctx: ctx.clone(),
            node,
            group_id: GroupId(group_key),
            topics: options
                .topics
                .iter()
                .map(|topic| TopicName(topic.clone().to_str_bytes()))
                .collect(),
            regex_topics: options.regex_topics,
            re_patterns,
            balancers: options.balancers,
            cooperative,
            instance_id: options.instance_id.map(|id| id.to_str_bytes()),
            session_timeout: Duration::from_millis(options.session_timeout_ms as u64),
            rebalance_timeout: Duration::from_millis(options.rebalance_timeout_ms as u64),
            heartbeat_interval: Duration::from_millis(options.heartbeat_interval_ms as u64),
            autocommit_disable,
            autocommit_interval: Duration::from_millis(options.autocommit_interval_ms as u64),
            auto_offset_reset: options.auto_offset_reset,
            retry_backoff: options.retry_backoff,
            on_assigned: options.on_assigned,
            on_revoked: options.on_revoked,
            on_lost: options.on_lost,
            rejoin_slot: Notify::new(),
            state: Mutex::new(GroupState::new()),
        });

        if !group.autocommit_disable && !group.autocommit_interval.is_zero() {
            let autocommit = group.clone();
            group
                .client
                .executor
                .spawn(Box::pin(async move { autocommit.loop_commit().await }))
                .map_err(|_| Error::Custom("failed to spawn autocommit task".into()))?;
        }

        // Reconcile the subscription on every metadata merge.
        let weak = Arc::downgrade(&group);
        let mut watcher = client.meta_watcher();
        let watch_ctx = ctx.clone();
        group
            .client
            .executor
            .spawn(Box::pin(async move {
                loop {
                    tokio::select! {
                        _ = watch_ctx.cancelled() => return,
                        changed = watcher.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            match weak.upgrade() {
                                Some(group) => group.find_new_assignments(),
                                None => return,
                            }
                        }
                    }
                }
            }))
            .map_err(|_| Error::Custom("failed to spawn metadata watch task".into()))?;
        client.transport.trigger_metadata();

        Ok(group)
    }

    /// Cancels the session and, for dynamic members, tells the coordinator
    /// we are gone. Static members never send LeaveGroup on shutdown; their
    /// membership is meant to survive a restart.
    pub async fn leave(&self) -> Result<()> {
        self.ctx.cancel();

        if self.instance_id.is_some() {
            info!(
                "Static member {:?} leaving group {:?} without LeaveGroup",
                self.state.lock()?.member_id,
                self.group_id
            );
            return Ok(());
        }

        let member_id = self.state.lock()?.member_id.clone();
        let version = self
            .client
            .version_range(ApiKey::LeaveGroupKey)
            .ok_or(Error::InvalidApiRequest(ApiKey::LeaveGroupKey))?;
        let mut request = LeaveGroupRequest::default();
        request.group_id = self.group_id.clone();
        if version.max >= 3 {
            request.members = vec![MemberIdentity {
                member_id: member_id.clone(),
                ..Default::default()
            }];
        } else {
            request.member_id = member_id.clone();
        }

        // The session scope is already cancelled; the leave rides its own.
        let leave_ctx = CancellationToken::new();
        let response = self
            .client
            .leave_group(&leave_ctx, &self.node, request)
            .await?;
        if response.error_code.is_ok() {
            info!(
                "Leave group {:?} success, member: {}",
                self.group_id, member_id.as_str()
            );
            Ok(())
        } else {
            Err(Error::response(response.error_code.err().unwrap()))
        }
    }

    pub fn now_assigned(&self) -> Assigned {
        self.state.lock().unwrap().now_assigned.clone()
    }

    /// Fetch-side state shared with the fetch pipeline.
    pub fn consumer_state(&self) -> Arc<ConsumerState> {
        self.consumer.clone()
    }

    /// Signals the heartbeat loop that this member must rejoin.
    pub(crate) fn rejoin(&self) {
        self.rejoin_slot.notify_one();
    }

    fn set_leader(&self) {
        self.state.lock().unwrap().leader = true;
    }

    /// Runs at the start of every join: clears leadership and drains a
    /// pending rejoin signal left over from the prior session.
    fn prejoin(&self) {
        self.state.lock().unwrap().leader = false;
        let _ = self.rejoin_slot.notified().now_or_never();
    }
}

/// Supervisor: join, run the session, classify the exit, back off, repeat.
impl<Exe: Executor> GroupConsumer<Exe> {
    pub(crate) async fn manage(self: Arc<Self>) {
        let mut consecutive_errors = 0u32;
        loop {
            let mut err = self.join_and_sync().await.err();
            if err.is_none() {
                err = match self.setup_assigned().await {
                    Ok(()) => None,
                    Err(e) if e.is_rebalance_in_progress() => None,
                    Err(e) => Some(e),
                };
            }

            match err {
                None => consecutive_errors = 0,
                Some(err) => {
                    error!(
                        "Group {:?} session ended: {err}, rejoining after backoff",
                        self.group_id
                    );
                    if let Some(on_lost) = &self.on_lost {
                        let all = self.now_assigned();
                        on_lost(self.ctx.clone(), all).await;
                    }
                    if err.invalidates_membership() {
                        let mut state = self.state.lock().unwrap();
                        state.member_id = MemberId::default();
                        state.generation = DEFAULT_GENERATION_ID;
                    }
                    consecutive_errors += 1;
                    // The backoff is a good moment to refresh metadata;
                    // stale metadata is a common underlying cause.
                    let backoff = (self.retry_backoff)(consecutive_errors);
                    let wait = async {
                        futures::join!(
                            self.client.wait_meta(&self.ctx, backoff),
                            self.client.executor.delay(backoff),
                        );
                    };
                    tokio::select! {
                        _ = self.ctx.cancelled() => return,
                        _ = wait => {}
                    }
                }
            }
        }
    }

    pub(crate) async fn setup_assigned(self: &Arc<Self>) -> Result<()> {
        let session = AssignRevokeSession::new();
        let (added, lost) = {
            let state = self.state.lock()?;
            diff_assigned(&state.last_assigned, &state.now_assigned)
        };
        session.prerevoke(self, lost);

        let (hb_tx, mut hb_rx) = oneshot::channel();
        let fetch_ctx = self.ctx.child_token();
        let (fetch_tx, fetch_rx) = oneshot::channel::<Result<()>>();
        {
            let group = self.clone();
            let session = session.clone();
            let fetch_ctx = fetch_ctx.clone();
            self.client
                .executor
                .spawn(Box::pin(async move {
                    let res = group.heartbeat(fetch_rx, &session).await;
                    // Heartbeat exit also kills an in-flight offset fetch.
                    fetch_ctx.cancel();
                    let _ = hb_tx.send(res);
                }))
                .map_err(|_| Error::Custom("failed to spawn heartbeat task".into()))?;
        }

        let assign_done = session.assign(self, added.clone());
        tokio::select! {
            res = &mut hb_rx => return res.unwrap_or(Err(ConsumeError::LeftGroup.into())),
            _ = assign_done => {}
        }

        if !added.is_empty() {
            let group = self.clone();
            self.client
                .executor
                .spawn(Box::pin(async move {
                    let res = group.fetch_offsets(&fetch_ctx, added).await;
                    let _ = fetch_tx.send(res);
                }))
                .map_err(|_| Error::Custom("failed to spawn offset fetch task".into()))?;
        } else {
            drop(fetch_tx);
        }

        hb_rx.await.unwrap_or(Err(ConsumeError::LeftGroup.into()))
    }
}

/// Heartbeat loop: demultiplexes everything that can end a group session.
impl<Exe: Executor> GroupConsumer<Exe> {
    /// Heartbeats for the duration of a session.
    ///
    /// Started before offsets are fetched so that `on_assigned` runs before
    /// fetching; if the offset fetch errors, heartbeating continues until
    /// the end-of-session revoke finishes and metadata is refreshed, then
    /// the most recent error is returned.
    async fn heartbeat(
        self: &Arc<Self>,
        fetch_rx: oneshot::Receiver<Result<()>>,
        session: &AssignRevokeSession,
    ) -> Result<()> {
        let mut interval = self.client.executor.interval(self.heartbeat_interval);
        let mut fetch_rx = Some(fetch_rx);
        let mut metadone: Option<DoneSignal> = None;
        let mut revoked: Option<DoneSignal> = None;
        let mut did_metadone = false;
        let mut did_revoke = false;
        let mut last_err: Option<Error> = None;

        loop {
            let mut err: Option<Error> = None;
            tokio::select! {
                _ = interval.next() => {
                    err = self.send_heartbeat().await.err();
                }
                _ = self.rejoin_slot.notified() => {
                    // A subscription change requires rejoining; pretend the
                    // coordinator told us a rebalance is in progress.
                    err = Some(Error::response(ResponseError::RebalanceInProgress));
                }
                res = fetch_rx.as_mut().unwrap(), if fetch_rx.is_some() => {
                    fetch_rx = None;
                    if let Ok(Err(fetch_err)) = res {
                        err = Some(fetch_err);
                    }
                }
                _ = metadone.as_mut().unwrap(), if metadone.is_some() => {
                    metadone = None;
                    did_metadone = true;
                }
                _ = revoked.as_mut().unwrap(), if revoked.is_some() => {
                    revoked = None;
                    did_revoke = true;
                }
                _ = self.ctx.cancelled() => {
                    // Wait for on_assigned so on_lost cannot run concurrently.
                    let _ = session.assign_done.clone().await;
                    return Err(ConsumeError::LeftGroup.into());
                }
            }

            if did_metadone && did_revoke {
                return match last_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            let Some(session_err) = err else { continue };

            // Since we errored, we must revoke.
            if !did_revoke && revoked.is_none() {
                // Eager consumers stop fetching everything they own; it is
                // all about to be revoked.
                if !self.cooperative {
                    self.consumer.maybe_assign_partitions(
                        self.session_seq,
                        HashMap::new(),
                        AssignHow::InvalidateAll,
                    );
                }

                // IllegalGeneration and UnknownMemberId mean the membership
                // is gone; the supervisor calls on_lost with everything, so
                // skip revoking here. Still wait for on_assigned to finish.
                if !session_err.is_rebalance_in_progress() {
                    let _ = session.assign_done.clone().await;
                    return Err(session_err);
                }

                revoked = Some(session.revoke(self));
            }

            // A leader may have rejoined with new metadata; refresh while
            // the revoke drains.
            if !did_metadone && metadone.is_none() {
                let (tx, rx) = oneshot::channel();
                let group = self.clone();
                let spawned = self.client.executor.spawn(Box::pin(async move {
                    group
                        .client
                        .wait_meta(&group.ctx, group.session_timeout)
                        .await;
                    let _ = tx.send(());
                }));
                if spawned.is_err() {
                    return Err(ConsumeError::LeftGroup.into());
                }
                metadone = Some(rx.shared());
            }

            last_err = Some(session_err);
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let version = self
            .client
            .version_range(ApiKey::HeartbeatKey)
            .ok_or(Error::InvalidApiRequest(ApiKey::HeartbeatKey))?;
        let request = self.heartbeat_builder(version.max)?;
        let response = self.client.heartbeat(&self.ctx, &self.node, request).await?;
        if response.error_code.is_ok() {
            debug!(
                "Heartbeat success, group: {}",
                self.group_id.0.as_str()
            );
            Ok(())
        } else {
            Err(Error::response(response.error_code.err().unwrap()))
        }
    }

    fn heartbeat_builder(&self, version: i16) -> Result<HeartbeatRequest> {
        let state = self.state.lock()?;
        let mut request = HeartbeatRequest::default();
        if version <= 4 {
            request.group_id = self.group_id.clone();
            request.member_id = state.member_id.clone();
            request.generation_id = state.generation;

            if version >= 3 {
                request.group_instance_id = self.instance_id.clone();
            }
        }
        Ok(request)
    }
}

/// Join/Sync orchestration.
impl<Exe: Executor> GroupConsumer<Exe> {
    pub(crate) async fn join_and_sync(self: &Arc<Self>) -> Result<()> {
        self.prejoin();

        loop {
            let version = self
                .client
                .version_range(ApiKey::JoinGroupKey)
                .ok_or(Error::InvalidApiRequest(ApiKey::JoinGroupKey))?;
            let request = self.join_group_builder(version.max)?;
            let response = self.client.join_group(&self.ctx, &self.node, request).await?;

            match response.error_code.err() {
                // KIP-394: adopt the member id the coordinator minted for
                // us and rejoin with it.
                Some(ResponseError::MemberIdRequired) => {
                    let mut state = self.state.lock()?;
                    state.member_id = response.member_id.clone();
                    warn!(
                        "Join group {:?} requires a member id, rejoining as {}",
                        self.group_id, response.member_id.as_str()
                    );
                    continue;
                }
                Some(ResponseError::UnknownMemberId) => {
                    self.state.lock()?.member_id = MemberId::default();
                    warn!(
                        "Join group {:?} with unknown member id, rejoining without one",
                        self.group_id
                    );
                    continue;
                }
                Some(error) => return Err(Error::response(error)),
                None => {}
            }

            let generation = response.generation_id;
            {
                let mut state = self.state.lock()?;
                state.member_id = response.member_id.clone();
                state.generation = generation;
            }
            info!(
                "Join group {:?} success, leader = {}, member_id = {}, generation_id = {}",
                self.group_id,
                response.leader == response.member_id,
                response.member_id.as_str(),
                generation
            );

            let mut plan = None;
            if response.leader == response.member_id {
                let protocol = response
                    .protocol_name
                    .as_ref()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| self.balancers[0].protocol_name().to_string());
                plan = Some(self.balance_group(&protocol, response.members)?);
                self.set_leader();
            }

            match self.sync_group(plan, generation).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_rebalance_in_progress() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn sync_group(&self, plan: Option<JoinPlan>, generation: i32) -> Result<()> {
        let version = self
            .client
            .version_range(ApiKey::SyncGroupKey)
            .ok_or(Error::InvalidApiRequest(ApiKey::SyncGroupKey))?;
        let request = self.sync_group_builder(version.max, plan, generation)?;
        let mut response = self.client.sync_group(&self.ctx, &self.node, request).await?;

        if !response.error_code.is_ok() {
            return Err(Error::response(response.error_code.err().unwrap()));
        }

        let assignment = decode_member_assignment(&mut response.assignment)?;
        {
            let mut state = self.state.lock()?;
            // The prerevoke right after us diffs against this snapshot.
            if self.cooperative {
                state.last_assigned = state.now_assigned.clone();
            }
            state.now_assigned = assignment;
            info!(
                "Sync group {:?} success, member_id = {}, generation_id = {}, assigned = {:?}",
                self.group_id, state.member_id.as_str(), state.generation, state.now_assigned
            );
        }
        Ok(())
    }

    fn join_group_builder(&self, version: i16) -> Result<JoinGroupRequest> {
        let (topics, now_assigned, generation, member_id) = {
            let state = self.state.lock()?;
            let topics: HashSet<TopicName> = state.using.keys().cloned().collect();
            (
                topics,
                state.now_assigned.clone(),
                state.generation,
                state.member_id.clone(),
            )
        };

        let mut protocols = IndexMap::with_capacity(self.balancers.len());
        for balancer in self.balancers.iter() {
            let metadata = balancer.metadata_for(&topics, &now_assigned, generation)?;
            protocols.insert(
                balancer.protocol_name().to_string().to_str_bytes(),
                JoinGroupRequestProtocol {
                    metadata,
                    ..Default::default()
                },
            );
        }

        let mut request = JoinGroupRequest::default();
        if version <= 9 {
            request.group_id = self.group_id.clone();
            request.member_id = member_id;
            request.protocol_type = StrBytes::from_static_str(CONSUMER_PROTOCOL_TYPE);
            request.protocols = protocols;
            request.session_timeout_ms = self.session_timeout.as_millis() as i32;
            if version >= 1 {
                request.rebalance_timeout_ms = self.rebalance_timeout.as_millis() as i32;
            }
            if version >= 5 {
                request.group_instance_id = self.instance_id.clone();
            }
        }
        Ok(request)
    }

    fn sync_group_builder(
        &self,
        version: i16,
        plan: Option<JoinPlan>,
        generation: i32,
    ) -> Result<SyncGroupRequest> {
        let mut request = SyncGroupRequest::default();
        if version <= 5 {
            request.group_id = self.group_id.clone();
            request.member_id = self.state.lock()?.member_id.clone();
            request.generation_id = generation;

            if let Some(plan) = plan {
                request.assignments = plan.into_sync_assignment()?;
            }

            if version >= 3 {
                request.group_instance_id = self.instance_id.clone();
            }
        }
        Ok(request)
    }

    /// Leader only: decode every member's subscription and run the chosen
    /// balancer over the current partition counts.
    fn balance_group(
        &self,
        protocol: &str,
        members: Vec<JoinGroupResponseMember>,
    ) -> Result<JoinPlan> {
        let balancer = look_up_balancer(&self.balancers, protocol)?;

        let mut subscriptions = HashMap::with_capacity(members.len());
        for mut member in members {
            let mut subscription =
                MemberSubscription::deserialize_from_bytes(&mut member.metadata)?;
            subscription.group_instance_id = member.group_instance_id;
            subscriptions.insert(member.member_id, subscription);
        }

        let mut partitions_per_topic = HashMap::new();
        for subscription in subscriptions.values() {
            for topic in subscription.topics.iter() {
                if partitions_per_topic.contains_key(topic) {
                    continue;
                }
                let num_partitions = self.client.cluster_meta.num_partitions(topic);
                if num_partitions > 0 {
                    partitions_per_topic.insert(topic.clone(), num_partitions);
                } else {
                    debug!(
                        "Skipping assignment for topic {:?} since no metadata is available",
                        topic
                    );
                }
            }
        }

        balancer.balance(&subscriptions, &partitions_per_topic)
    }
}

/// Initial OffsetFetch for a new assignment.
///
/// The v8+ per-group response shape duplicates the older top-level one with
/// distinct types; this block decodes either.
macro_rules! offset_fetch_block {
    ($self:ident, $version:ident, $source:ident, $offsets:ident) => {
        // Pre-v2 responses carried the error at the partition level.
        let mut error_code = $source.error_code;
        if $version < 2 {
            if let Some(partition) = $source
                .topics
                .first()
                .and_then(|topic| topic.partitions.first())
            {
                error_code = partition.error_code;
            }
        }
        if let Some(error) = error_code.err() {
            if !is_retriable(error) {
                return Err(Error::response(error));
            }
        }

        for topic in $source.topics {
            let mut topic_offsets = HashMap::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                if !partition.error_code.is_ok() {
                    return Err(Error::response(partition.error_code.err().unwrap()));
                }
                let offset = if partition.committed_offset == UNKNOWN_OFFSET {
                    Offset::reset($self.auto_offset_reset)
                } else {
                    // Leader epoch is only on the wire from v5 (KIP-320).
                    let epoch = if $version >= 5 {
                        partition.committed_leader_epoch
                    } else {
                        UNKNOWN_EPOCH
                    };
                    Offset::at(partition.committed_offset, epoch)
                };
                topic_offsets.insert(partition.partition_index, offset);
            }
            $offsets.insert(topic.name, topic_offsets);
        }
    };
}

impl<Exe: Executor> GroupConsumer<Exe> {
    async fn fetch_offsets(self: &Arc<Self>, ctx: &CancellationToken, added: Assigned) -> Result<()> {
        let version = self
            .client
            .version_range(ApiKey::OffsetFetchKey)
            .ok_or(Error::InvalidApiRequest(ApiKey::OffsetFetchKey))?;
        let version = version.max;
        let request = self.offset_fetch_builder(version, &added)?;
        let mut response = self.client.offset_fetch(ctx, &self.node, request).await?;

        let mut offsets: HashMap<TopicName, HashMap<PartitionId, Offset>> = HashMap::new();
        if let Some(group) = response.groups.pop() {
            offset_fetch_block!(self, version, group, offsets);
        } else {
            offset_fetch_block!(self, version, response, offsets);
        }

        // Eager: joining invalidated everything already. Cooperative: merge
        // the newly assigned partitions into what we kept consuming.
        let how = if self.cooperative {
            AssignHow::WithoutInvalidating
        } else {
            AssignHow::InvalidateAll
        };
        if !self
            .consumer
            .maybe_assign_partitions(self.session_seq, offsets, how)
        {
            return Err(ConsumeError::StaleGroup.into());
        }
        Ok(())
    }

    fn offset_fetch_builder(&self, version: i16, added: &Assigned) -> Result<OffsetFetchRequest> {
        let mut request = OffsetFetchRequest::default();
        if version <= 7 {
            let mut topics = Vec::with_capacity(added.len());
            for (topic, partitions) in added {
                topics.push(OffsetFetchRequestTopic {
                    name: topic.clone(),
                    partition_indexes: partitions.clone(),
                    ..Default::default()
                });
            }
            request.group_id = self.group_id.clone();
            request.topics = Some(topics);
        } else {
            let mut topics = Vec::with_capacity(added.len());
            for (topic, partitions) in added {
                topics.push(OffsetFetchRequestTopics {
                    name: topic.clone(),
                    partition_indexes: partitions.clone(),
                    ..Default::default()
                });
            }
            request.groups = vec![OffsetFetchRequestGroup {
                group_id: self.group_id.clone(),
                topics: Some(topics),
                ..Default::default()
            }];
        }
        Ok(request)
    }
}

fn is_retriable(error: ResponseError) -> bool {
    matches!(
        error,
        ResponseError::CoordinatorLoadInProgress
            | ResponseError::CoordinatorNotAvailable
            | ResponseError::NotCoordinator
            | ResponseError::RequestTimedOut
    )
}

/// Revocation, assignment diffing and the rebalance callbacks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RevokeStage {
    /// Revoking what a prior session lost, right after Sync.
    LastSession,
    /// Revoking at the end of the current session.
    ThisSession,
}

impl<Exe: Executor> GroupConsumer<Exe> {
    /// Calls the revoke hook for partitions this member is losing and prunes
    /// the ledger afterwards.
    ///
    /// Eager members revoke everything they own; this only happens at the
    /// end of a session. Cooperative members revoke the passed-in lost set
    /// after Sync; at the end of a session there is nothing to revoke until
    /// subscriptions can change mid-group.
    async fn revoke(self: &Arc<Self>, stage: RevokeStage, lost: Option<Assigned>) {
        if !self.cooperative {
            // stage == ThisSession when not cooperative
            let all = self.now_assigned();
            self.call_on_revoked(all).await;
            let mut state = self.state.lock().unwrap();
            state.now_assigned.clear();
            state.uncommitted.clear();
            return;
        }

        let lost = match stage {
            RevokeStage::LastSession => lost.unwrap_or_default(),
            // Cooperative end-of-session would revoke topics the consumer
            // stopped being interested in; the subscription is immutable
            // after attach, so there is nothing to do yet.
            RevokeStage::ThisSession => return,
        };

        if lost.is_empty() {
            return;
        }

        // Stop fetching what we lost and drop its buffered fetches before
        // the user callback runs; a later poll must not see lost records.
        let mut lost_offsets = HashMap::with_capacity(lost.len());
        for (topic, partitions) in lost.iter() {
            let mut partition_offsets = HashMap::with_capacity(partitions.len());
            for partition in partitions {
                partition_offsets.insert(*partition, Offset::default());
            }
            lost_offsets.insert(topic.clone(), partition_offsets);
        }
        self.consumer.maybe_assign_partitions(
            self.session_seq,
            lost_offsets,
            AssignHow::InvalidateMatching,
        );

        self.call_on_revoked(lost.clone()).await;

        self.prune_revoked(&lost);
        self.rejoin();
    }

    async fn call_on_revoked(self: &Arc<Self>, partitions: Assigned) {
        if let Some(on_revoked) = &self.on_revoked {
            on_revoked(self.ctx.clone(), partitions).await;
        } else if self.client.txn.is_none() {
            self.default_revoke_commit().await;
        }
    }

    fn has_revoke_hook(&self) -> bool {
        self.on_revoked.is_some() || self.client.txn.is_none()
    }
}

/// Diffs two assignments into what was added and what was lost.
///
/// An empty prior assignment means a first session: everything now assigned
/// is added, nothing is lost.
pub(crate) fn diff_assigned(last: &Assigned, now: &Assigned) -> (Assigned, Assigned) {
    if last.is_empty() {
        return (now.clone(), Assigned::new());
    }

    let mut added = Assigned::with_capacity(now.len());
    let mut lost = Assigned::with_capacity(now.len());

    for (topic, last_partitions) in last {
        match now.get(topic) {
            None => {
                lost.insert(topic.clone(), last_partitions.clone());
            }
            Some(now_partitions) => {
                let last_set: HashSet<PartitionId> = last_partitions.iter().copied().collect();
                let now_set: HashSet<PartitionId> = now_partitions.iter().copied().collect();
                for partition in now_partitions {
                    if !last_set.contains(partition) {
                        added.entry(topic.clone()).or_default().push(*partition);
                    }
                }
                for partition in last_partitions {
                    if !now_set.contains(partition) {
                        lost.entry(topic.clone()).or_default().push(*partition);
                    }
                }
            }
        }
    }

    for (topic, now_partitions) in now {
        if !last.contains_key(topic) {
            added.insert(topic.clone(), now_partitions.clone());
        }
    }

    (added, lost)
}

/// Three-phase barrier sequencing prerevoke, on-assigned and the
/// end-of-session revoke across a rebalance.
#[derive(Clone)]
pub(crate) struct AssignRevokeSession {
    prerevoke_done: DoneSignal,
    pub(crate) assign_done: DoneSignal,
    revoke_done: DoneSignal,
    prerevoke_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    assign_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    revoke_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AssignRevokeSession {
    fn new() -> Self {
        let (prerevoke_tx, prerevoke_rx) = oneshot::channel();
        let (assign_tx, assign_rx) = oneshot::channel();
        let (revoke_tx, revoke_rx) = oneshot::channel();
        Self {
            prerevoke_done: prerevoke_rx.shared(),
            assign_done: assign_rx.shared(),
            revoke_done: revoke_rx.shared(),
            prerevoke_tx: Arc::new(Mutex::new(Some(prerevoke_tx))),
            assign_tx: Arc::new(Mutex::new(Some(assign_tx))),
            revoke_tx: Arc::new(Mutex::new(Some(revoke_tx))),
        }
    }

    /// Phase one: cooperative members revoke what the prior session lost.
    /// Completes regardless.
    fn prerevoke<Exe: Executor>(&self, group: &Arc<GroupConsumer<Exe>>, lost: Assigned) -> DoneSignal {
        let tx = self.prerevoke_tx.lock().unwrap().take();
        let group = group.clone();
        let _ = group.client.executor.clone().spawn(Box::pin(async move {
            if group.cooperative {
                group.revoke(RevokeStage::LastSession, Some(lost)).await;
            }
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }));
        self.prerevoke_done.clone()
    }

    /// Phase two: waits for prerevoke, then calls the assigned callback.
    /// Always runs, even with nothing newly assigned, so that transactional
    /// consumers can observe the assignment point.
    fn assign<Exe: Executor>(&self, group: &Arc<GroupConsumer<Exe>>, added: Assigned) -> DoneSignal {
        let tx = self.assign_tx.lock().unwrap().take();
        let prerevoke_done = self.prerevoke_done.clone();
        let group = group.clone();
        let _ = group.client.executor.clone().spawn(Box::pin(async move {
            let _ = prerevoke_done.await;
            if let Some(on_assigned) = &group.on_assigned {
                on_assigned(group.ctx.clone(), added).await;
            }
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }));
        self.assign_done.clone()
    }

    /// Phase three: waits for on-assigned, then runs the end-of-session
    /// revoke.
    fn revoke<Exe: Executor>(&self, group: &Arc<GroupConsumer<Exe>>) -> DoneSignal {
        let tx = self.revoke_tx.lock().unwrap().take();
        let assign_done = self.assign_done.clone();
        let group = group.clone();
        let _ = group.client.executor.clone().spawn(Box::pin(async move {
            let _ = assign_done.await;
            if group.has_revoke_hook() {
                group.revoke(RevokeStage::ThisSession, None).await;
            }
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }));
        self.revoke_done.clone()
    }
}

/// Subscription reconciler: run at the end of every metadata update.
impl<Exe: Executor> GroupConsumer<Exe> {
    /// Updates the topics the group wants to use from fresh metadata.
    ///
    /// Starts the supervisor on the first subscribed topic. Rejoins when a
    /// new topic appears, or, for the leader, when an existing topic grew;
    /// only the leader can translate growth into a new plan.
    pub(crate) fn find_new_assignments(self: &Arc<Self>) {
        struct Change {
            is_new: bool,
            delta: i32,
        }

        let mut state = self.state.lock().unwrap();
        let mut to_change: HashMap<TopicName, Change> = HashMap::new();
        let mut num_new = 0;
        for entry in self.client.cluster_meta.topics.iter() {
            let topic = entry.key();
            let num_partitions = entry.value().partitions.len() as i32;

            if let Some(used) = state.using.get(topic) {
                if num_partitions - used > 0 {
                    to_change.insert(
                        topic.clone(),
                        Change {
                            is_new: false,
                            delta: num_partitions - used,
                        },
                    );
                }
                continue;
            }

            let mut use_topic = false;
            if self.regex_topics {
                if !state.re_seen.contains(topic) {
                    state.re_seen.insert(topic.clone());
                    use_topic = self
                        .re_patterns
                        .iter()
                        .any(|pattern| pattern.is_match(topic.as_str()));
                }
            } else {
                use_topic = self.topics.contains(topic);
            }

            if use_topic {
                if self.regex_topics && entry.value().is_internal {
                    continue;
                }
                to_change.insert(
                    topic.clone(),
                    Change {
                        is_new: true,
                        delta: num_partitions,
                    },
                );
                num_new += 1;
            }
        }

        if to_change.is_empty() {
            return;
        }

        let was_managing = !state.using.is_empty();
        for (topic, change) in to_change {
            *state.using.entry(topic).or_insert(0) += change.delta;
        }
        let leader = state.leader;
        drop(state);

        if !was_managing {
            let group = self.clone();
            if self
                .client
                .executor
                .spawn(Box::pin(async move { group.manage().await }))
                .is_err()
            {
                error!("Failed to spawn group supervisor for {:?}", self.group_id);
                return;
            }
        }

        if num_new > 0 || leader {
            self.rejoin();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kafka_protocol::messages::RequestKind;

    use super::*;
    use crate::{
        client::mock::{
            join_error, join_response, mock_client, offset_fetch_response, sync_response,
            MockTransport,
        },
        consumer::balancer::RangeBalancer,
        consumer::{ConsumerRecord, PartitionFetch},
        metadata::{Partition, Topic, TopicPartition},
        topic_name, ToStrBytes, TokioExecutor,
    };

    fn assigned(entries: &[(&str, &[i32])]) -> Assigned {
        entries
            .iter()
            .map(|(topic, partitions)| (topic_name(topic), partitions.to_vec()))
            .collect()
    }

    type EventLog = Arc<Mutex<Vec<(&'static str, Assigned)>>>;

    fn recording(log: &EventLog, name: &'static str) -> RebalanceCallback {
        let log = log.clone();
        Arc::new(move |_ctx, partitions| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push((name, partitions));
            })
        })
    }

    async fn attach(
        mock: &Arc<MockTransport>,
        options: GroupOptions,
    ) -> Arc<GroupConsumer<TokioExecutor>> {
        GroupConsumer::new(mock_client(mock.clone()), options)
            .await
            .unwrap()
    }

    fn quiet_options() -> GroupOptions {
        let mut options = GroupOptions::new("g1");
        options.autocommit_disable = true;
        options
    }

    fn insert_topic(group: &GroupConsumer<TokioExecutor>, name: &str, partitions: i32, internal: bool) {
        let topic = Topic {
            name: name.to_string().to_str_bytes(),
            is_internal: internal,
            partitions: vec![Partition::default(); partitions as usize],
            ..Default::default()
        };
        group.client.cluster_meta.topics.insert(topic_name(name), topic);
        if internal {
            group
                .client
                .cluster_meta
                .internal_topics
                .insert(topic_name(name));
        }
    }

    fn rejoin_pending(group: &GroupConsumer<TokioExecutor>) -> bool {
        group.rejoin_slot.notified().now_or_never().is_some()
    }

    fn records(offsets: &[i64]) -> Vec<ConsumerRecord> {
        offsets
            .iter()
            .map(|offset| ConsumerRecord {
                offset: *offset,
                leader_epoch: 0,
                key: None,
                value: None,
                timestamp: 0,
            })
            .collect()
    }

    #[tokio::test]
    async fn join_adopts_required_member_id_and_retries() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            join_error(ResponseError::MemberIdRequired, "m1"),
        );
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m1", "someone-else", 1, "cooperative-sticky", vec![]),
        );
        mock.push(ApiKey::SyncGroupKey, sync_response(&[("t", &[0])]));

        let group = attach(&mock, quiet_options()).await;
        group.join_and_sync().await.unwrap();

        let joins = mock.sent_of(ApiKey::JoinGroupKey);
        assert_eq!(joins.len(), 2);
        match &joins[1] {
            RequestKind::JoinGroupRequest(request) => {
                assert_eq!(request.member_id.as_str(), "m1");
            }
            other => panic!("unexpected request: {other:?}"),
        }
        let state = group.state.lock().unwrap();
        assert_eq!(state.member_id.as_str(), "m1");
        assert_eq!(state.generation, 1);
        assert!(!state.leader);
    }

    #[tokio::test]
    async fn join_clears_unknown_member_id_and_retries() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            join_error(ResponseError::UnknownMemberId, "stale"),
        );
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m2", "someone-else", 2, "cooperative-sticky", vec![]),
        );
        mock.push(ApiKey::SyncGroupKey, sync_response(&[("t", &[0])]));

        let group = attach(&mock, quiet_options()).await;
        group.state.lock().unwrap().member_id = "old".to_string().to_str_bytes();
        group.join_and_sync().await.unwrap();

        let joins = mock.sent_of(ApiKey::JoinGroupKey);
        assert_eq!(joins.len(), 2);
        match &joins[1] {
            RequestKind::JoinGroupRequest(request) => {
                assert!(request.member_id.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_surfaces_transport_errors_to_the_supervisor() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            crate::client::mock::Reply::Fail(Error::Custom("wire down".into())),
        );
        let group = attach(&mock, quiet_options()).await;
        assert!(group.join_and_sync().await.is_err());
    }

    #[tokio::test]
    async fn sync_rebalance_in_progress_retries_the_join() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m1", "someone-else", 1, "cooperative-sticky", vec![]),
        );
        mock.push(
            ApiKey::SyncGroupKey,
            crate::client::mock::sync_error(ResponseError::RebalanceInProgress),
        );
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m1", "someone-else", 2, "cooperative-sticky", vec![]),
        );
        mock.push(ApiKey::SyncGroupKey, sync_response(&[("t", &[0])]));

        let group = attach(&mock, quiet_options()).await;
        group.join_and_sync().await.unwrap();
        assert_eq!(mock.sent_of(ApiKey::JoinGroupKey).len(), 2);
        assert_eq!(group.state.lock().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn first_cooperative_session_assigns_then_fetches_offsets() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m1", "someone-else", 1, "cooperative-sticky", vec![]),
        );
        mock.push(ApiKey::SyncGroupKey, sync_response(&[("t", &[0, 1])]));
        mock.push(
            ApiKey::OffsetFetchKey,
            offset_fetch_response(&[("t", &[(0, 5, 2), (1, -1, -1)])]),
        );

        let log: EventLog = Default::default();
        let mut options = quiet_options();
        options.on_assigned = Some(recording(&log, "assigned"));
        let group = attach(&mock, options).await;

        group.join_and_sync().await.unwrap();
        let (added, lost) = {
            let state = group.state.lock().unwrap();
            diff_assigned(&state.last_assigned, &state.now_assigned)
        };
        assert_eq!(added, assigned(&[("t", &[0, 1])]));
        assert!(lost.is_empty());

        let runner = {
            let group = group.clone();
            tokio::spawn(async move { group.setup_assigned().await })
        };

        // Wait for the initial offset fetch to install positions.
        let t0 = TopicPartition::new(topic_name("t"), 0);
        let t1 = TopicPartition::new(topic_name("t"), 1);
        for _ in 0..200 {
            if group.consumer.assigned_offset(&t1).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        group.ctx.cancel();
        let err = runner.await.unwrap().unwrap_err();
        // Cancellation either lands in the select or mid-heartbeat.
        assert!(matches!(err, Error::Consume(ConsumeError::LeftGroup)) || err.is_canceled());

        assert_eq!(
            *log.lock().unwrap(),
            vec![("assigned", assigned(&[("t", &[0, 1])]))]
        );
        assert_eq!(group.consumer.assigned_offset(&t0), Some(Offset::at(5, 2)));
        // A stored offset of -1 falls back to the configured reset.
        assert_eq!(
            group.consumer.assigned_offset(&t1),
            Some(Offset::reset(OffsetResetStrategy::Earliest))
        );

        let fetches = mock.sent_of(ApiKey::OffsetFetchKey);
        assert_eq!(fetches.len(), 1);
        match &fetches[0] {
            RequestKind::OffsetFetchRequest(request) => {
                let topics = request.topics.as_ref().unwrap();
                assert_eq!(topics.len(), 1);
                let mut partitions = topics[0].partition_indexes.clone();
                partitions.sort_unstable();
                assert_eq!(partitions, vec![0, 1]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cooperative_revoke_knifes_out_lost_partitions() {
        let mock = MockTransport::new();
        let log: EventLog = Default::default();
        let mut options = quiet_options();
        options.on_revoked = Some(recording(&log, "revoked"));
        let group = attach(&mock, options).await;

        let mut offsets = HashMap::new();
        offsets.insert(
            topic_name("t"),
            HashMap::from([
                (0, Offset::at(1, -1)),
                (1, Offset::at(2, -1)),
                (2, Offset::at(3, -1)),
            ]),
        );
        group.consumer.maybe_assign_partitions(
            group.session_seq,
            offsets,
            AssignHow::WithoutInvalidating,
        );
        group.consumer.buffer_fetch(PartitionFetch {
            topic: topic_name("t"),
            partition: 1,
            records: records(&[2]),
        });
        group.update_uncommitted(&[
            PartitionFetch {
                topic: topic_name("t"),
                partition: 0,
                records: records(&[1]),
            },
            PartitionFetch {
                topic: topic_name("t"),
                partition: 1,
                records: records(&[2]),
            },
        ]);
        group.state.lock().unwrap().now_assigned = assigned(&[("t", &[0, 2])]);

        group
            .revoke(RevokeStage::LastSession, Some(assigned(&[("t", &[1])])))
            .await;

        let t1 = TopicPartition::new(topic_name("t"), 1);
        assert!(group.consumer.assigned_offset(&t1).is_none());
        assert_eq!(group.consumer.buffered_records(&t1), 0);
        let t0 = TopicPartition::new(topic_name("t"), 0);
        assert!(group.consumer.assigned_offset(&t0).is_some());

        assert_eq!(
            *log.lock().unwrap(),
            vec![("revoked", assigned(&[("t", &[1])]))]
        );

        let snapshot = group.uncommitted();
        let topic = snapshot.get(&topic_name("t")).unwrap();
        assert!(topic.contains_key(&0));
        assert!(!topic.contains_key(&1));

        assert!(rejoin_pending(&group));
    }

    #[tokio::test]
    async fn eager_end_of_session_revokes_everything() {
        let mock = MockTransport::new();
        let log: EventLog = Default::default();
        let mut options = quiet_options();
        options.balancers = vec![Arc::new(RangeBalancer)];
        options.on_revoked = Some(recording(&log, "revoked"));
        let group = attach(&mock, options).await;
        assert!(!group.cooperative);

        group.state.lock().unwrap().now_assigned = assigned(&[("t", &[0, 1])]);
        group.update_uncommitted(&[PartitionFetch {
            topic: topic_name("t"),
            partition: 0,
            records: records(&[4]),
        }]);

        group.revoke(RevokeStage::ThisSession, None).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![("revoked", assigned(&[("t", &[0, 1])]))]
        );
        let state = group.state.lock().unwrap();
        assert!(state.now_assigned.is_empty());
        assert!(state.uncommitted.is_empty());
    }

    #[tokio::test]
    async fn sequencer_runs_prerevoke_then_assign_then_revoke() {
        let mock = MockTransport::new();
        let log: EventLog = Default::default();
        let mut options = quiet_options();
        options.on_assigned = Some(recording(&log, "assigned"));
        options.on_revoked = Some(recording(&log, "revoked"));
        let group = attach(&mock, options).await;

        // Phases scheduled deliberately out of order; completion order must
        // still be prerevoke -> assign -> revoke.
        let session = AssignRevokeSession::new();
        let revoke_done = session.revoke(&group);
        let assign_done = session.assign(&group, assigned(&[("t", &[2])]));
        let prerevoke_done = session.prerevoke(&group, assigned(&[("t", &[1])]));

        let _ = prerevoke_done.await;
        let _ = assign_done.await;
        let _ = revoke_done.await;

        // Cooperative end-of-session revoke is inert, so two events.
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("revoked", assigned(&[("t", &[1])])),
                ("assigned", assigned(&[("t", &[2])])),
            ]
        );
    }

    #[tokio::test]
    async fn membership_invalidation_calls_on_lost_and_resets_the_member() {
        let mock = MockTransport::new();
        mock.push(
            ApiKey::JoinGroupKey,
            join_response("m1", "someone-else", 7, "cooperative-sticky", vec![]),
        );
        mock.push(ApiKey::SyncGroupKey, sync_response(&[("t", &[0])]));
        mock.push(
            ApiKey::HeartbeatKey,
            crate::client::mock::heartbeat_error(ResponseError::IllegalGeneration),
        );

        let log: EventLog = Default::default();
        let mut options = quiet_options();
        options.on_lost = Some(recording(&log, "lost"));
        let group = attach(&mock, options).await;

        let supervisor = {
            let group = group.clone();
            tokio::spawn(async move { group.manage().await })
        };

        for _ in 0..200 {
            if group.state.lock().unwrap().generation == DEFAULT_GENERATION_ID
                && !log.lock().unwrap().is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            log.lock().unwrap().first(),
            Some(&("lost", assigned(&[("t", &[0])])))
        );
        {
            let state = group.state.lock().unwrap();
            assert!(state.member_id.is_empty());
            assert_eq!(state.generation, DEFAULT_GENERATION_ID);
        }

        group.ctx.cancel();
        let _ = supervisor.await;
    }

    #[tokio::test]
    async fn static_member_shutdown_sends_no_leave_group() {
        let mock = MockTransport::new();
        let mut options = quiet_options();
        options.instance_id = Some("svc-0".into());
        let group = attach(&mock, options).await;

        group.leave().await.unwrap();
        assert!(group.ctx.is_cancelled());
        assert!(mock.sent_of(ApiKey::LeaveGroupKey).is_empty());
    }

    #[tokio::test]
    async fn dynamic_member_leaves_with_member_identity() {
        let mock = MockTransport::new();
        let group = attach(&mock, quiet_options()).await;
        group.state.lock().unwrap().member_id = "m1".to_string().to_str_bytes();

        group.leave().await.unwrap();
        let leaves = mock.sent_of(ApiKey::LeaveGroupKey);
        assert_eq!(leaves.len(), 1);
        match &leaves[0] {
            RequestKind::LeaveGroupRequest(request) => {
                assert_eq!(request.members.len(), 1);
                assert_eq!(request.members[0].member_id.as_str(), "m1");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconciler_adopts_new_topics_and_leader_growth() {
        let mock = MockTransport::new();
        let mut options = quiet_options();
        options.topics.insert("t".into());
        let group = attach(&mock, options).await;
        // Attach asks for fresh metadata so the reconciler has input.
        assert!(mock.meta_triggers.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        // Pretend a supervisor already runs so this test only watches the
        // bookkeeping, not the join loop.
        group
            .state
            .lock()
            .unwrap()
            .using
            .insert(topic_name("seed"), 1);

        insert_topic(&group, "t", 2, false);
        insert_topic(&group, "x", 3, false);
        group.find_new_assignments();
        {
            let state = group.state.lock().unwrap();
            assert_eq!(state.using.get(&topic_name("t")), Some(&2));
            assert!(!state.using.contains_key(&topic_name("x")));
        }
        assert!(rejoin_pending(&group));

        // Growth matters, but only the leader can act on it.
        insert_topic(&group, "t", 3, false);
        group.find_new_assignments();
        assert_eq!(
            group.state.lock().unwrap().using.get(&topic_name("t")),
            Some(&3)
        );
        assert!(!rejoin_pending(&group));

        group.state.lock().unwrap().leader = true;
        insert_topic(&group, "t", 4, false);
        group.find_new_assignments();
        assert!(rejoin_pending(&group));
    }

    #[tokio::test]
    async fn reconciler_matches_regexes_once_and_skips_internal_topics() {
        let mock = MockTransport::new();
        let mut options = quiet_options();
        options.topics.insert("foo-.*".into());
        options.regex_topics = true;
        let group = attach(&mock, options).await;
        group
            .state
            .lock()
            .unwrap()
            .using
            .insert(topic_name("seed"), 1);

        insert_topic(&group, "foo-1", 2, false);
        insert_topic(&group, "foo-internal", 2, true);
        insert_topic(&group, "bar", 2, false);
        group.find_new_assignments();
        {
            let state = group.state.lock().unwrap();
            assert_eq!(state.using.get(&topic_name("foo-1")), Some(&2));
            assert!(!state.using.contains_key(&topic_name("bar")));
            assert!(!state.using.contains_key(&topic_name("foo-internal")));
            assert!(state.re_seen.contains(&topic_name("bar")));
        }

        // Once seen, a topic is never re-evaluated.
        group.find_new_assignments();
        assert!(!group.state.lock().unwrap().using.contains_key(&topic_name("bar")));
    }

    #[test]
    fn first_session_adds_everything() {
        let now = assigned(&[("t", &[0, 1])]);
        let (added, lost) = diff_assigned(&Assigned::new(), &now);
        assert_eq!(added, now);
        assert!(lost.is_empty());
    }

    #[test]
    fn identical_assignments_diff_to_nothing() {
        let now = assigned(&[("t", &[0, 1, 2]), ("u", &[3])]);
        let (added, lost) = diff_assigned(&now, &now);
        assert!(added.is_empty());
        assert!(lost.is_empty());
    }

    #[test]
    fn partial_loss_is_detected() {
        let last = assigned(&[("t", &[0, 1, 2])]);
        let now = assigned(&[("t", &[0, 2])]);
        let (added, lost) = diff_assigned(&last, &now);
        assert!(added.is_empty());
        assert_eq!(lost, assigned(&[("t", &[1])]));
    }

    #[test]
    fn topic_disappearing_loses_whole_topic() {
        let last = assigned(&[("t", &[0]), ("gone", &[1, 2])]);
        let now = assigned(&[("t", &[0]), ("fresh", &[5])]);
        let (added, lost) = diff_assigned(&last, &now);
        assert_eq!(added, assigned(&[("fresh", &[5])]));
        assert_eq!(lost, assigned(&[("gone", &[1, 2])]));
    }

    #[test]
    fn growth_within_topic_is_added() {
        let last = assigned(&[("t", &[0])]);
        let now = assigned(&[("t", &[0, 1])]);
        let (added, lost) = diff_assigned(&last, &now);
        assert_eq!(added, assigned(&[("t", &[1])]));
        assert!(lost.is_empty());
    }

    #[test]
    fn member_id_ordering_matters_for_leader_detection() {
        // Sanity check on StrBytes equality used by the leader branch.
        let a = "member-1".to_string().to_str_bytes();
        let b = "member-1".to_string().to_str_bytes();
        assert_eq!(a, b);
    }
}
