use std::{collections::HashMap, sync::Arc};

use futures::{channel::oneshot, StreamExt};
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        offset_commit_request::{OffsetCommitRequestPartition, OffsetCommitRequestTopic},
        txn_offset_commit_request::{TxnOffsetCommitRequestPartition, TxnOffsetCommitRequestTopic},
        ApiKey, OffsetCommitRequest, OffsetCommitResponse, ProducerId, TopicName,
        TxnOffsetCommitRequest, TxnOffsetCommitResponse,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    consumer::PartitionFetch,
    coordinator::group::{GroupConsumer, GroupState},
    error::{ConsumeError, Result},
    executor::Executor,
    Error, MemberId, PartitionId,
};

/// A record offset paired with the leader epoch the broker was at when the
/// record was written. Epoch `-1` means unknown (pre-KIP-320).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochOffset {
    pub epoch: i32,
    pub offset: i64,
}

/// Ledger entry for one partition: `head` points just past the latest
/// consumed record (the offset to resume at), `committed` is what the
/// coordinator last acknowledged. The partition is clean when they match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Uncommit {
    pub(crate) head: EpochOffset,
    pub(crate) committed: EpochOffset,
}

pub(crate) type UncommittedLedger = HashMap<TopicName, HashMap<PartitionId, Uncommit>>;

/// The dirty snapshot handed to the commit pipeline: per-partition heads for
/// partitions where `head != committed`.
pub type UncommittedOffsets = HashMap<TopicName, HashMap<PartitionId, EpochOffset>>;

/// Completion callback for a plain offset commit. Invoked exactly once,
/// including the empty and error paths.
pub type CommitDone =
    Box<dyn FnOnce(OffsetCommitRequest, Result<OffsetCommitResponse>) + Send + 'static>;

/// Completion callback for a transactional offset commit.
pub type TxnCommitDone =
    Box<dyn FnOnce(TxnOffsetCommitRequest, Result<TxnOffsetCommitResponse>) + Send + 'static>;

fn noop_commit_done() -> CommitDone {
    Box::new(|_, _| {})
}

fn noop_txn_done() -> TxnCommitDone {
    Box::new(|_, _| {})
}

impl GroupState {
    /// Dirty heads only; empty when nothing needs committing.
    pub(crate) fn uncommitted_offsets(&self) -> UncommittedOffsets {
        let mut snapshot = UncommittedOffsets::new();
        for (topic, partitions) in &self.uncommitted {
            for (partition, uncommit) in partitions {
                if uncommit.head == uncommit.committed {
                    continue;
                }
                snapshot
                    .entry(topic.clone())
                    .or_default()
                    .insert(*partition, uncommit.head);
            }
        }
        snapshot
    }
}

/// Offset ledger.
impl<Exe: Executor> GroupConsumer<Exe> {
    /// Advances per-partition heads after the fetch pipeline delivered
    /// records. A head never moves backwards; an out-of-order or stale
    /// delivery is ignored.
    pub fn update_uncommitted(&self, fetches: &[PartitionFetch]) {
        let mut state = self.state.lock().unwrap();
        for fetch in fetches {
            let Some(final_record) = fetch.records.last() else {
                continue;
            };
            // Head points just past the final consumed offset: commits name
            // the offset to resume AT, not the one consumed.
            let new_head = final_record.offset + 1;
            let topic_offsets = state.uncommitted.entry(fetch.topic.clone()).or_default();
            let uncommit = topic_offsets.entry(fetch.partition).or_default();
            if uncommit.head.offset > new_head {
                continue;
            }
            uncommit.head = EpochOffset {
                epoch: final_record.leader_epoch,
                offset: new_head,
            };
        }
    }

    /// The latest uncommitted offsets, or empty when everything is clean.
    pub fn uncommitted(&self) -> UncommittedOffsets {
        self.state.lock().unwrap().uncommitted_offsets()
    }

    /// Drops ledger entries for cooperatively revoked partitions, removing
    /// emptied topics along the way.
    pub(crate) fn prune_revoked(&self, lost: &HashMap<TopicName, Vec<PartitionId>>) {
        let mut state = self.state.lock().unwrap();
        if state.uncommitted.is_empty() {
            return;
        }
        for (topic, partitions) in lost {
            let emptied = {
                let Some(topic_offsets) = state.uncommitted.get_mut(topic) else {
                    continue;
                };
                for partition in partitions {
                    topic_offsets.remove(partition);
                }
                topic_offsets.is_empty()
            };
            if emptied {
                state.uncommitted.remove(topic);
            }
        }
    }
}

/// Applies an acknowledged commit to the ledger.
///
/// Request and response are pairwise verified by sorting both on (topic,
/// partition); mismatched or errored partitions are dropped. A length
/// mismatch drops the whole result.
// TODO decide whether a request/response length mismatch should be fatal
// rather than silently dropped.
macro_rules! update_committed_block {
    ($state:ident, $req:ident, $resp:ident) => {
        if $state.uncommitted.is_empty() || $req.topics.len() != $resp.topics.len() {
            return;
        }

        $req.topics.sort_by(|a, b| a.name.cmp(&b.name));
        $resp.topics.sort_by(|a, b| a.name.cmp(&b.name));

        for (req_topic, resp_topic) in $req.topics.iter_mut().zip($resp.topics.iter_mut()) {
            let Some(topic_offsets) = $state.uncommitted.get_mut(&resp_topic.name) else {
                continue;
            };
            if req_topic.name != resp_topic.name
                || req_topic.partitions.len() != resp_topic.partitions.len()
            {
                continue;
            }

            req_topic
                .partitions
                .sort_by_key(|partition| partition.partition_index);
            resp_topic
                .partitions
                .sort_by_key(|partition| partition.partition_index);

            for (req_part, resp_part) in req_topic
                .partitions
                .iter()
                .zip(resp_topic.partitions.iter())
            {
                if !resp_part.error_code.is_ok()
                    || req_part.partition_index != resp_part.partition_index
                {
                    continue;
                }
                let Some(uncommit) = topic_offsets.get_mut(&resp_part.partition_index) else {
                    continue;
                };
                uncommit.committed = EpochOffset {
                    epoch: req_part.committed_leader_epoch,
                    offset: req_part.committed_offset,
                };
            }
        }
    };
}

impl<Exe: Executor> GroupConsumer<Exe> {
    /// Non-transactional path: a commit dispatched under an older generation
    /// must not advance the ledger.
    pub(crate) fn update_committed(
        &self,
        req: &mut OffsetCommitRequest,
        resp: &mut OffsetCommitResponse,
    ) {
        let mut state = self.state.lock().unwrap();
        if req.generation_id_or_member_epoch != state.generation {
            return;
        }
        update_committed_block!(state, req, resp);
    }

    /// Transactional path: the transaction lifecycle is authoritative, so
    /// no generation check.
    pub(crate) fn update_committed_txn(
        &self,
        req: &mut TxnOffsetCommitRequest,
        resp: &mut TxnOffsetCommitResponse,
    ) {
        let mut state = self.state.lock().unwrap();
        update_committed_block!(state, req, resp);
    }
}

/// Commit pipeline.
impl<Exe: Executor> GroupConsumer<Exe> {
    /// Commits `uncommitted`, blocking autocommit until `on_done` returned.
    ///
    /// Commits are absolutely ordered within the group session: a new commit
    /// cancels any in-flight one over the wire, then waits for it to finish
    /// before going to the wire itself. `on_done` may be used to make the
    /// commit synchronous; it is always invoked exactly once.
    pub fn commit_offsets(
        self: &Arc<Self>,
        ctx: CancellationToken,
        uncommitted: UncommittedOffsets,
        on_done: Option<CommitDone>,
    ) {
        let on_done = on_done.unwrap_or_else(noop_commit_done);
        if uncommitted.is_empty() {
            on_done(OffsetCommitRequest::default(), Ok(OffsetCommitResponse::default()));
            return;
        }

        self.state.lock().unwrap().block_auto = true;
        let group = self.clone();
        let unblock: CommitDone = Box::new(move |req, result| {
            on_done(req, result);
            group.state.lock().unwrap().block_auto = false;
        });
        self.commit(ctx, uncommitted, Some(unblock));
    }

    /// Commits offsets inside the current transaction.
    ///
    /// Invalid without a transactional id or outside a transaction. Before
    /// the first commit of a transaction this initializes the producer id if
    /// needed and issues AddOffsetsToTxn; failure at either step surfaces
    /// through `on_done` without submitting the commit.
    pub async fn commit_offsets_for_transaction(
        self: &Arc<Self>,
        ctx: CancellationToken,
        uncommitted: UncommittedOffsets,
        on_done: Option<TxnCommitDone>,
    ) {
        let on_done = on_done.unwrap_or_else(noop_txn_done);
        let Some(txn) = self.client.txn.clone() else {
            on_done(
                TxnOffsetCommitRequest::default(),
                Err(ConsumeError::NotTransactional.into()),
            );
            return;
        };
        {
            let txn_state = txn.inner.lock().await;
            if !txn_state.in_txn {
                on_done(
                    TxnOffsetCommitRequest::default(),
                    Err(ConsumeError::NotInTransaction.into()),
                );
                return;
            }
        }
        if uncommitted.is_empty() {
            on_done(
                TxnOffsetCommitRequest::default(),
                Ok(TxnOffsetCommitResponse::default()),
            );
            return;
        }

        let (producer_id, producer_epoch) = match self.client.ensure_producer_id(&self.ctx).await {
            Ok(ids) => ids,
            Err(err) => {
                on_done(TxnOffsetCommitRequest::default(), Err(err));
                return;
            }
        };

        // One AddOffsetsToTxn per transaction; the txn lock serializes
        // concurrent committers through the preamble.
        {
            let mut txn_state = txn.inner.lock().await;
            if !txn_state.offsets_added {
                match self
                    .client
                    .add_offsets_to_txn(
                        &self.ctx,
                        self.group_id.clone(),
                        producer_id,
                        producer_epoch,
                    )
                    .await
                {
                    Ok(()) => txn_state.offsets_added = true,
                    Err(err) => {
                        drop(txn_state);
                        on_done(TxnOffsetCommitRequest::default(), Err(err));
                        return;
                    }
                }
            }
        }

        self.commit_txn(ctx, uncommitted, on_done, producer_id, producer_epoch);
    }

    /// Cancels the in-flight commit, installs our handles and returns the
    /// prior completion to await. Callers snapshot membership here so the
    /// lock never spans the wire call.
    fn install_commit_handles(
        &self,
    ) -> (
        CancellationToken,
        Option<oneshot::Receiver<()>>,
        oneshot::Sender<()>,
        i32,
        MemberId,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(cancel) = state.commit_cancel.take() {
            cancel.cancel();
        }
        let prior_done = state.commit_done.take();

        let commit_ctx = self.ctx.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        state.commit_cancel = Some(commit_ctx.clone());
        state.commit_done = Some(done_rx);

        (
            commit_ctx,
            prior_done,
            done_tx,
            state.generation,
            state.member_id.clone(),
        )
    }

    fn link_caller_cancel(&self, caller: CancellationToken, commit_ctx: CancellationToken) {
        let _ = self.client.executor.spawn(Box::pin(async move {
            tokio::select! {
                _ = caller.cancelled() => commit_ctx.cancel(),
                _ = commit_ctx.cancelled() => {}
            }
        }));
    }

    pub(crate) fn commit(
        self: &Arc<Self>,
        ctx: CancellationToken,
        uncommitted: UncommittedOffsets,
        on_done: Option<CommitDone>,
    ) {
        let on_done = on_done.unwrap_or_else(noop_commit_done);
        if uncommitted.is_empty() {
            // Only empty through autocommit or the default revoke; skip the
            // wire entirely.
            on_done(OffsetCommitRequest::default(), Ok(OffsetCommitResponse::default()));
            return;
        }

        let (commit_ctx, prior_done, done_tx, generation, member_id) =
            self.install_commit_handles();
        self.link_caller_cancel(ctx, commit_ctx.clone());

        let group = self.clone();
        let _ = self.client.executor.clone().spawn(Box::pin(async move {
            if let Some(prior) = prior_done {
                let _ = prior.await;
            }

            let request =
                match group.offset_commit_builder(generation, member_id, &uncommitted) {
                    Ok(request) => request,
                    Err(err) => {
                        on_done(OffsetCommitRequest::default(), Err(err));
                        commit_ctx.cancel();
                        let _ = done_tx.send(());
                        return;
                    }
                };

            let result = group
                .client
                .offset_commit(&commit_ctx, &group.node, request.clone())
                .await;
            match result {
                Ok(mut response) => {
                    let mut request = request;
                    group.update_committed(&mut request, &mut response);
                    on_done(request, Ok(response));
                }
                Err(err) => on_done(request, Err(err)),
            }
            commit_ctx.cancel();
            let _ = done_tx.send(());
        }));
    }

    pub(crate) fn commit_txn(
        self: &Arc<Self>,
        ctx: CancellationToken,
        uncommitted: UncommittedOffsets,
        on_done: TxnCommitDone,
        producer_id: ProducerId,
        producer_epoch: i16,
    ) {
        let (commit_ctx, prior_done, done_tx, _generation, member_id) =
            self.install_commit_handles();
        self.link_caller_cancel(ctx, commit_ctx.clone());

        let group = self.clone();
        let _ = self.client.executor.clone().spawn(Box::pin(async move {
            if let Some(prior) = prior_done {
                let _ = prior.await;
            }

            let request = match group.txn_offset_commit_builder(
                member_id,
                producer_id,
                producer_epoch,
                &uncommitted,
            ) {
                Ok(request) => request,
                Err(err) => {
                    on_done(TxnOffsetCommitRequest::default(), Err(err));
                    commit_ctx.cancel();
                    let _ = done_tx.send(());
                    return;
                }
            };

            let result = group
                .client
                .txn_offset_commit(&commit_ctx, &group.node, request.clone())
                .await;
            match result {
                Ok(mut response) => {
                    let mut request = request;
                    group.update_committed_txn(&mut request, &mut response);
                    on_done(request, Ok(response));
                }
                Err(err) => on_done(request, Err(err)),
            }
            commit_ctx.cancel();
            let _ = done_tx.send(());
        }));
    }

    fn offset_commit_builder(
        &self,
        generation: i32,
        member_id: MemberId,
        uncommitted: &UncommittedOffsets,
    ) -> Result<OffsetCommitRequest> {
        let version = self
            .client
            .version_range(ApiKey::OffsetCommitKey)
            .ok_or(Error::InvalidApiRequest(ApiKey::OffsetCommitKey))?
            .max;

        let mut request = OffsetCommitRequest::default();
        if version <= 8 {
            request.group_id = self.group_id.clone();

            let mut topics = Vec::with_capacity(uncommitted.len());
            for (topic, partitions) in uncommitted {
                let mut request_partitions = Vec::with_capacity(partitions.len());
                for (partition, eo) in partitions {
                    request_partitions.push(OffsetCommitRequestPartition {
                        partition_index: *partition,
                        committed_offset: eo.offset,
                        committed_leader_epoch: eo.epoch,
                        commit_timestamp: -1,
                        committed_metadata: Some(member_id.clone()),
                        ..Default::default()
                    });
                }
                topics.push(OffsetCommitRequestTopic {
                    name: topic.clone(),
                    partitions: request_partitions,
                    ..Default::default()
                });
            }
            request.topics = topics;

            if version >= 1 {
                request.generation_id_or_member_epoch = generation;
                request.member_id = member_id;
            }
            if version >= 7 {
                request.group_instance_id = self.instance_id.clone();
            }
            if (2..=4).contains(&version) {
                request.retention_time_ms = -1;
            }
        }
        Ok(request)
    }

    fn txn_offset_commit_builder(
        &self,
        member_id: MemberId,
        producer_id: ProducerId,
        producer_epoch: i16,
        uncommitted: &UncommittedOffsets,
    ) -> Result<TxnOffsetCommitRequest> {
        let txn = self
            .client
            .txn
            .as_ref()
            .ok_or(ConsumeError::NotTransactional)?;

        let mut request = TxnOffsetCommitRequest::default();
        request.transactional_id = txn.txn_id.clone();
        request.group_id = self.group_id.clone();
        request.producer_id = producer_id;
        request.producer_epoch = producer_epoch;

        let mut topics = Vec::with_capacity(uncommitted.len());
        for (topic, partitions) in uncommitted {
            let mut request_partitions = Vec::with_capacity(partitions.len());
            for (partition, eo) in partitions {
                request_partitions.push(TxnOffsetCommitRequestPartition {
                    partition_index: *partition,
                    committed_offset: eo.offset,
                    committed_leader_epoch: eo.epoch,
                    committed_metadata: Some(member_id.clone()),
                    ..Default::default()
                });
            }
            topics.push(TxnOffsetCommitRequestTopic {
                name: topic.clone(),
                partitions: request_partitions,
                ..Default::default()
            });
        }
        request.topics = topics;
        Ok(request)
    }

    /// Autocommit ticker; runs for the lifetime of the session scope.
    pub(crate) async fn loop_commit(self: Arc<Self>) {
        let mut interval = self.client.executor.interval(self.autocommit_interval);
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = interval.next() => {}
            }

            let uncommitted = {
                let state = self.state.lock().unwrap();
                if state.block_auto {
                    continue;
                }
                state.uncommitted_offsets()
            };
            debug!(
                "Autocommitting {} dirty topics for group {:?}",
                uncommitted.len(),
                self.group_id
            );
            self.commit(self.ctx.clone(), uncommitted, None);
        }
    }

    /// The default revoke: commit everything consumed and wait, so that
    /// records polled before a rebalance are re-delivered at most once.
    pub(crate) async fn default_revoke_commit(self: &Arc<Self>) {
        if self.autocommit_disable {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let uncommitted = self.uncommitted();
        self.commit_offsets(
            self.ctx.clone(),
            uncommitted,
            Some(Box::new(move |_, _| {
                let _ = tx.send(());
            })),
        );
        let _ = rx.await;
    }
}
