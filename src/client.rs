use std::{sync::Arc, time::Duration};

use futures::{
    channel::oneshot,
    future::{BoxFuture, Shared},
    FutureExt,
};
use kafka_protocol::{
    messages::{
        AddOffsetsToTxnRequest, ApiKey, FindCoordinatorRequest, FindCoordinatorResponse, GroupId,
        HeartbeatRequest, HeartbeatResponse, InitProducerIdRequest, JoinGroupRequest,
        JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse, OffsetCommitRequest,
        OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse, ProducerId, RequestKind,
        ResponseKind, SyncGroupRequest, SyncGroupResponse, TransactionalId, TxnOffsetCommitRequest,
        TxnOffsetCommitResponse,
    },
    protocol::VersionRange,
};
use kafka_protocol::error::ParseResponseErrorCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    error::{ConnectionError, ConsumeError, Error, Result},
    executor::Executor,
    metadata::{Cluster, Node},
    ToStrBytes,
};

/// The opaque RPC seam.
///
/// The surrounding connection layer implements this; the group core never
/// sees sockets. `invoke` with `None` routes to any bootstrap broker,
/// `Some(node)` to that broker. `trigger_metadata` nudges the metadata loop
/// into refreshing; the refreshed response comes back through
/// [`Kafka::merge_meta`].
pub trait Transport: Send + Sync + 'static {
    fn invoke(&self, node: Option<&Node>, request: RequestKind)
        -> BoxFuture<'_, Result<ResponseKind>>;

    fn version_range(&self, api: ApiKey) -> Option<VersionRange>;

    fn trigger_metadata(&self);
}

#[derive(Debug, Clone)]
pub struct KafkaOptions {
    pub client_id: Option<String>,
    pub request_timeout_ms: i32,
    /// Transactional id; set when the owning client produces transactionally.
    pub txn_id: Option<String>,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            client_id: Some("konsume".into()),
            request_timeout_ms: 30_000,
            txn_id: None,
        }
    }
}

/// Client facade over the transport, cluster metadata and transactional
/// state. Cheap to clone; all clones share the same underlying state.
pub struct Kafka<Exe: Executor> {
    pub(crate) transport: Arc<dyn Transport>,
    pub executor: Arc<Exe>,
    pub options: KafkaOptions,
    pub cluster_meta: Arc<Cluster>,
    meta_version: Arc<watch::Sender<u64>>,
    pub(crate) txn: Option<Arc<TxnContext>>,
}

impl<Exe: Executor> Clone for Kafka<Exe> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            executor: self.executor.clone(),
            options: self.options.clone(),
            cluster_meta: self.cluster_meta.clone(),
            meta_version: self.meta_version.clone(),
            txn: self.txn.clone(),
        }
    }
}

impl<Exe: Executor> Kafka<Exe> {
    pub fn new(transport: Arc<dyn Transport>, options: KafkaOptions, executor: Exe) -> Self {
        let txn = options.txn_id.clone().map(|id| {
            Arc::new(TxnContext::new(TransactionalId(id.to_str_bytes())))
        });
        let (meta_version, _) = watch::channel(0u64);
        Self {
            transport,
            executor: Arc::new(executor),
            options,
            cluster_meta: Arc::new(Cluster::empty()),
            meta_version: Arc::new(meta_version),
            txn,
        }
    }

    pub fn version_range(&self, api: ApiKey) -> Option<VersionRange> {
        self.transport.version_range(api)
    }

    /// Merges a metadata response fetched by the surrounding client and
    /// wakes everyone blocked in [`Kafka::wait_meta`].
    pub fn merge_meta(&self, metadata: kafka_protocol::messages::MetadataResponse) -> Result<()> {
        self.cluster_meta.merge_meta(metadata)?;
        self.meta_version.send_modify(|v| *v += 1);
        Ok(())
    }

    pub fn meta_watcher(&self) -> watch::Receiver<u64> {
        self.meta_version.subscribe()
    }

    /// Triggers a metadata refresh and waits for the next merge, bounded by
    /// `timeout` and the session scope.
    pub async fn wait_meta(&self, ctx: &CancellationToken, timeout: Duration) {
        let mut watcher = self.meta_version.subscribe();
        self.transport.trigger_metadata();
        tokio::select! {
            _ = ctx.cancelled() => {}
            _ = self.executor.timeout(timeout, watcher.changed()) => {}
        }
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        node: Option<&Node>,
        request: RequestKind,
    ) -> Result<ResponseKind> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ConnectionError::Canceled.into()),
            response = self.transport.invoke(node, request) => response,
        }
    }
}

/// Coordinator RPCs. Every call consults the session's cancellation scope.
impl<Exe: Executor> Kafka<Exe> {
    pub async fn find_coordinator(
        &self,
        ctx: &CancellationToken,
        request: FindCoordinatorRequest,
    ) -> Result<FindCoordinatorResponse> {
        match self
            .invoke(ctx, None, RequestKind::FindCoordinatorRequest(request))
            .await?
        {
            ResponseKind::FindCoordinatorResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn join_group(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: JoinGroupRequest,
    ) -> Result<JoinGroupResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::JoinGroupRequest(request))
            .await?
        {
            ResponseKind::JoinGroupResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn sync_group(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: SyncGroupRequest,
    ) -> Result<SyncGroupResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::SyncGroupRequest(request))
            .await?
        {
            ResponseKind::SyncGroupResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn heartbeat(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::HeartbeatRequest(request))
            .await?
        {
            ResponseKind::HeartbeatResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn leave_group(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: LeaveGroupRequest,
    ) -> Result<LeaveGroupResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::LeaveGroupRequest(request))
            .await?
        {
            ResponseKind::LeaveGroupResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn offset_fetch(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: OffsetFetchRequest,
    ) -> Result<OffsetFetchResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::OffsetFetchRequest(request))
            .await?
        {
            ResponseKind::OffsetFetchResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn offset_commit(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: OffsetCommitRequest,
    ) -> Result<OffsetCommitResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::OffsetCommitRequest(request))
            .await?
        {
            ResponseKind::OffsetCommitResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }

    pub async fn txn_offset_commit(
        &self,
        ctx: &CancellationToken,
        node: &Node,
        request: TxnOffsetCommitRequest,
    ) -> Result<TxnOffsetCommitResponse> {
        match self
            .invoke(ctx, Some(node), RequestKind::TxnOffsetCommitRequest(request))
            .await?
        {
            ResponseKind::TxnOffsetCommitResponse(response) => Ok(response),
            response => Err(unexpected(response)),
        }
    }
}

/// Transactional hooks: producer id bootstrap and the offsets-to-txn tie-in.
impl<Exe: Executor> Kafka<Exe> {
    /// Ensures the producer id is initialized, coordinating with at most one
    /// concurrent initialization.
    pub(crate) async fn ensure_producer_id(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(ProducerId, i16)> {
        let txn = self
            .txn
            .as_ref()
            .ok_or(ConsumeError::NotTransactional)?
            .clone();

        let waiter: Option<Shared<oneshot::Receiver<()>>> = {
            let mut state = txn.inner.lock().await;
            if state.id_loaded {
                return Ok((state.producer_id, state.producer_epoch));
            }
            match &state.id_loading {
                Some(loading) => Some(loading.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let loading = rx.shared();
                    state.id_loading = Some(loading.clone());

                    let client = self.clone();
                    let ctx = ctx.clone();
                    let txn = txn.clone();
                    let spawned = self.executor.spawn(Box::pin(async move {
                        let loaded = client.init_producer_id(&ctx).await;
                        let mut state = txn.inner.lock().await;
                        state.id_loading = None;
                        match loaded {
                            Ok((id, epoch)) => {
                                state.producer_id = id;
                                state.producer_epoch = epoch;
                                state.id_loaded = true;
                            }
                            Err(err) => error!("Init producer id failed: {err}"),
                        }
                        drop(state);
                        let _ = tx.send(());
                    }));
                    if spawned.is_err() {
                        return Err(ConnectionError::Shutdown.into());
                    }
                    Some(loading)
                }
            }
        };

        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }

        let state = txn.inner.lock().await;
        if state.id_loaded {
            Ok((state.producer_id, state.producer_epoch))
        } else {
            Err(ConsumeError::ProducerIdUninitialized.into())
        }
    }

    async fn init_producer_id(&self, ctx: &CancellationToken) -> Result<(ProducerId, i16)> {
        let txn = self.txn.as_ref().ok_or(ConsumeError::NotTransactional)?;
        let mut request = InitProducerIdRequest::default();
        request.transactional_id = Some(txn.txn_id.clone());
        request.transaction_timeout_ms = self.options.request_timeout_ms;
        match self
            .invoke(ctx, None, RequestKind::InitProducerIdRequest(request))
            .await?
        {
            ResponseKind::InitProducerIdResponse(response) => {
                if response.error_code.is_ok() {
                    Ok((response.producer_id, response.producer_epoch))
                } else {
                    Err(Error::response(response.error_code.err().unwrap()))
                }
            }
            response => Err(unexpected(response)),
        }
    }

    /// Ties the transactional producer to `group` before the first
    /// txn-offset-commit of a transaction. The caller has already ensured
    /// the producer id.
    pub(crate) async fn add_offsets_to_txn(
        &self,
        ctx: &CancellationToken,
        group: GroupId,
        producer_id: ProducerId,
        producer_epoch: i16,
    ) -> Result<()> {
        let txn = self.txn.as_ref().ok_or(ConsumeError::NotTransactional)?;
        let request = AddOffsetsToTxnRequest {
            transactional_id: txn.txn_id.clone(),
            producer_id,
            producer_epoch,
            group_id: group,
            ..Default::default()
        };
        match self
            .invoke(ctx, None, RequestKind::AddOffsetsToTxnRequest(request))
            .await?
        {
            ResponseKind::AddOffsetsToTxnResponse(response) => {
                if response.error_code.is_ok() {
                    Ok(())
                } else {
                    Err(Error::response(response.error_code.err().unwrap()))
                }
            }
            response => Err(unexpected(response)),
        }
    }

    /// Marks a transaction as begun. Normally driven by the producer half of
    /// the owning client.
    pub async fn begin_transaction(&self) -> Result<()> {
        let txn = self.txn.as_ref().ok_or(ConsumeError::NotTransactional)?;
        let mut state = txn.inner.lock().await;
        if state.in_txn {
            return Err(Error::Custom("transaction already in progress".into()));
        }
        state.in_txn = true;
        Ok(())
    }

    pub async fn end_transaction(&self) -> Result<()> {
        let txn = self.txn.as_ref().ok_or(ConsumeError::NotTransactional)?;
        let mut state = txn.inner.lock().await;
        state.in_txn = false;
        state.offsets_added = false;
        Ok(())
    }
}

fn unexpected(response: ResponseKind) -> Error {
    Error::Connection(ConnectionError::UnexpectedResponse(format!("{response:?}")))
}

/// Transactional producer state shared between the producer half and the
/// group committer.
pub struct TxnContext {
    pub txn_id: TransactionalId,
    pub(crate) inner: async_lock::Mutex<TxnState>,
}

impl TxnContext {
    fn new(txn_id: TransactionalId) -> Self {
        Self {
            txn_id,
            inner: async_lock::Mutex::new(TxnState::default()),
        }
    }
}

pub(crate) struct TxnState {
    pub(crate) producer_id: ProducerId,
    pub(crate) producer_epoch: i16,
    pub(crate) id_loaded: bool,
    id_loading: Option<Shared<oneshot::Receiver<()>>>,
    pub(crate) in_txn: bool,
    /// Whether AddOffsetsToTxn was issued for the current transaction.
    pub(crate) offsets_added: bool,
}

impl Default for TxnState {
    fn default() -> Self {
        Self {
            producer_id: ProducerId(-1),
            producer_epoch: -1,
            id_loaded: false,
            id_loading: None,
            in_txn: false,
            offsets_added: false,
        }
    }
}

/// An in-memory scripted coordinator used by the group core's tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use bytes::Bytes;
    use kafka_protocol::messages::{
        join_group_response::JoinGroupResponseMember,
        offset_commit_response::{OffsetCommitResponsePartition, OffsetCommitResponseTopic},
        offset_fetch_response::{OffsetFetchResponsePartition, OffsetFetchResponseTopic},
        txn_offset_commit_response::{
            TxnOffsetCommitResponsePartition, TxnOffsetCommitResponseTopic,
        },
        BrokerId, FindCoordinatorResponse, HeartbeatResponse, InitProducerIdResponse,
        JoinGroupResponse, LeaveGroupResponse, MetadataResponse, OffsetCommitResponse,
        OffsetFetchResponse, SyncGroupResponse, TxnOffsetCommitResponse,
    };
    use kafka_protocol::{protocol::StrBytes, ResponseError};

    use super::*;
    use crate::{consumer::balancer::JoinPlan, topic_name, MemberId, PartitionId};

    pub(crate) enum Reply {
        Respond(ResponseKind),
        Fail(Error),
        /// Leave the request in flight until its cancellation fires.
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct MockTransport {
        replies: Mutex<HashMap<i16, VecDeque<Reply>>>,
        max_versions: Mutex<HashMap<i16, i16>>,
        pub(crate) sent: Mutex<Vec<RequestKind>>,
        pub(crate) meta_triggers: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn push(&self, api: ApiKey, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .entry(api as i16)
                .or_default()
                .push_back(reply);
        }

        pub(crate) fn set_max_version(&self, api: ApiKey, version: i16) {
            self.max_versions.lock().unwrap().insert(api as i16, version);
        }

        pub(crate) fn sent_of(&self, api: ApiKey) -> Vec<RequestKind> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|request| api_key_of(request) == api as i16)
                .cloned()
                .collect()
        }

        fn default_reply(&self, request: &RequestKind) -> Result<ResponseKind> {
            match request {
                RequestKind::FindCoordinatorRequest(_) => {
                    let mut response = FindCoordinatorResponse::default();
                    response.node_id = BrokerId(1);
                    response.host = StrBytes::from_str("localhost");
                    response.port = 9092;
                    Ok(ResponseKind::FindCoordinatorResponse(response))
                }
                RequestKind::HeartbeatRequest(_) => {
                    Ok(ResponseKind::HeartbeatResponse(HeartbeatResponse::default()))
                }
                RequestKind::LeaveGroupRequest(_) => {
                    Ok(ResponseKind::LeaveGroupResponse(LeaveGroupResponse::default()))
                }
                RequestKind::OffsetCommitRequest(request) => {
                    let mut response = OffsetCommitResponse::default();
                    for topic in request.topics.iter() {
                        response.topics.push(OffsetCommitResponseTopic {
                            name: topic.name.clone(),
                            partitions: topic
                                .partitions
                                .iter()
                                .map(|partition| OffsetCommitResponsePartition {
                                    partition_index: partition.partition_index,
                                    ..Default::default()
                                })
                                .collect(),
                            ..Default::default()
                        });
                    }
                    Ok(ResponseKind::OffsetCommitResponse(response))
                }
                RequestKind::TxnOffsetCommitRequest(request) => {
                    let mut response = TxnOffsetCommitResponse::default();
                    for topic in request.topics.iter() {
                        response.topics.push(TxnOffsetCommitResponseTopic {
                            name: topic.name.clone(),
                            partitions: topic
                                .partitions
                                .iter()
                                .map(|partition| TxnOffsetCommitResponsePartition {
                                    partition_index: partition.partition_index,
                                    ..Default::default()
                                })
                                .collect(),
                            ..Default::default()
                        });
                    }
                    Ok(ResponseKind::TxnOffsetCommitResponse(response))
                }
                RequestKind::AddOffsetsToTxnRequest(_) => Ok(
                    ResponseKind::AddOffsetsToTxnResponse(Default::default()),
                ),
                RequestKind::InitProducerIdRequest(_) => {
                    let mut response = InitProducerIdResponse::default();
                    response.producer_id = ProducerId(42);
                    response.producer_epoch = 7;
                    Ok(ResponseKind::InitProducerIdResponse(response))
                }
                RequestKind::MetadataRequest(_) => {
                    Ok(ResponseKind::MetadataResponse(MetadataResponse::default()))
                }
                other => Err(Error::Custom(format!("unscripted request: {other:?}"))),
            }
        }
    }

    impl Transport for MockTransport {
        fn invoke(
            &self,
            _node: Option<&Node>,
            request: RequestKind,
        ) -> BoxFuture<'_, Result<ResponseKind>> {
            self.sent.lock().unwrap().push(request.clone());
            let scripted = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&api_key_of(&request))
                .and_then(|queue| queue.pop_front());
            Box::pin(async move {
                match scripted {
                    Some(Reply::Respond(response)) => Ok(response),
                    Some(Reply::Fail(err)) => Err(err),
                    Some(Reply::Hang) => {
                        futures::future::pending::<Result<ResponseKind>>().await
                    }
                    None => self.default_reply(&request),
                }
            })
        }

        fn version_range(&self, api: ApiKey) -> Option<VersionRange> {
            let max = self
                .max_versions
                .lock()
                .unwrap()
                .get(&(api as i16))
                .copied()
                .unwrap_or(match api {
                    ApiKey::FindCoordinatorKey => 4,
                    ApiKey::JoinGroupKey => 7,
                    ApiKey::SyncGroupKey => 5,
                    ApiKey::HeartbeatKey => 4,
                    ApiKey::LeaveGroupKey => 4,
                    ApiKey::OffsetCommitKey => 8,
                    ApiKey::OffsetFetchKey => 7,
                    ApiKey::TxnOffsetCommitKey => 3,
                    ApiKey::AddOffsetsToTxnKey => 3,
                    ApiKey::InitProducerIdKey => 4,
                    _ => 0,
                });
            Some(VersionRange { min: 0, max })
        }

        fn trigger_metadata(&self) {
            self.meta_triggers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn api_key_of(request: &RequestKind) -> i16 {
        let api = match request {
            RequestKind::FindCoordinatorRequest(_) => ApiKey::FindCoordinatorKey,
            RequestKind::JoinGroupRequest(_) => ApiKey::JoinGroupKey,
            RequestKind::SyncGroupRequest(_) => ApiKey::SyncGroupKey,
            RequestKind::HeartbeatRequest(_) => ApiKey::HeartbeatKey,
            RequestKind::LeaveGroupRequest(_) => ApiKey::LeaveGroupKey,
            RequestKind::OffsetCommitRequest(_) => ApiKey::OffsetCommitKey,
            RequestKind::OffsetFetchRequest(_) => ApiKey::OffsetFetchKey,
            RequestKind::TxnOffsetCommitRequest(_) => ApiKey::TxnOffsetCommitKey,
            RequestKind::AddOffsetsToTxnRequest(_) => ApiKey::AddOffsetsToTxnKey,
            RequestKind::InitProducerIdRequest(_) => ApiKey::InitProducerIdKey,
            RequestKind::MetadataRequest(_) => ApiKey::MetadataKey,
            _ => ApiKey::ApiVersionsKey,
        };
        api as i16
    }

    /// A joinable client over the mock, tokio flavored.
    pub(crate) fn mock_client(mock: Arc<MockTransport>) -> Kafka<crate::TokioExecutor> {
        Kafka::new(mock, KafkaOptions::default(), crate::TokioExecutor)
    }

    pub(crate) fn mock_txn_client(mock: Arc<MockTransport>) -> Kafka<crate::TokioExecutor> {
        let options = KafkaOptions {
            txn_id: Some("txn-0".into()),
            ..Default::default()
        };
        Kafka::new(mock, options, crate::TokioExecutor)
    }

    pub(crate) fn join_response(
        member_id: &str,
        leader_id: &str,
        generation: i32,
        protocol: &str,
        members: Vec<(MemberId, Bytes)>,
    ) -> Reply {
        let mut response = JoinGroupResponse::default();
        response.member_id = member_id.to_string().to_str_bytes();
        response.leader = leader_id.to_string().to_str_bytes();
        response.generation_id = generation;
        response.protocol_name = Some(protocol.to_string().to_str_bytes());
        response.members = members
            .into_iter()
            .map(|(member_id, metadata)| JoinGroupResponseMember {
                member_id,
                metadata,
                ..Default::default()
            })
            .collect();
        Reply::Respond(ResponseKind::JoinGroupResponse(response))
    }

    pub(crate) fn join_error(error: ResponseError, member_id: &str) -> Reply {
        let mut response = JoinGroupResponse::default();
        response.error_code = error.code();
        response.member_id = member_id.to_string().to_str_bytes();
        Reply::Respond(ResponseKind::JoinGroupResponse(response))
    }

    pub(crate) fn sync_response(assigned: &[(&str, &[PartitionId])]) -> Reply {
        let mut partitions = std::collections::HashMap::new();
        for (topic, topic_partitions) in assigned {
            partitions.insert(topic_name(topic), topic_partitions.to_vec());
        }
        let plan = JoinPlan {
            assignments: std::collections::HashMap::from([(
                "self".to_string().to_str_bytes(),
                partitions,
            )]),
        };
        let assignment = plan
            .into_sync_assignment()
            .unwrap()
            .pop()
            .unwrap()
            .assignment;
        let mut response = SyncGroupResponse::default();
        response.assignment = assignment;
        Reply::Respond(ResponseKind::SyncGroupResponse(response))
    }

    pub(crate) fn sync_error(error: ResponseError) -> Reply {
        let mut response = SyncGroupResponse::default();
        response.error_code = error.code();
        Reply::Respond(ResponseKind::SyncGroupResponse(response))
    }

    pub(crate) fn heartbeat_error(error: ResponseError) -> Reply {
        let mut response = HeartbeatResponse::default();
        response.error_code = error.code();
        Reply::Respond(ResponseKind::HeartbeatResponse(response))
    }

    /// v7-shaped offset fetch response.
    pub(crate) fn offset_fetch_response(
        entries: &[(&str, &[(PartitionId, i64, i32)])],
    ) -> Reply {
        let mut response = OffsetFetchResponse::default();
        for (topic, partitions) in entries {
            response.topics.push(OffsetFetchResponseTopic {
                name: topic_name(topic),
                partitions: partitions
                    .iter()
                    .map(|(partition, offset, epoch)| OffsetFetchResponsePartition {
                        partition_index: *partition,
                        committed_offset: *offset,
                        committed_leader_epoch: *epoch,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            });
        }
        Reply::Respond(ResponseKind::OffsetFetchResponse(response))
    }
}
