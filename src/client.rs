//! Collaborators the consumer group drives: the broker client that speaks the group
//! membership protocol and serves fetches, and the store that keeps committed offsets.
//! Responses carry raw kafka error codes which the group interprets through
//! [`ParseResponseErrorCode`](kafka_protocol::error::ParseResponseErrorCode).

use std::collections::HashMap;

use bytes::Bytes;
use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::{
    consumer::{
        partition_assignor::{Assignment, Subscription},
        ConsumerRecord, OffsetResetStrategy,
    },
    error::Result,
    metadata::{Node, TopicPartition},
    MemberId, PartitionId,
};

pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

/// Broker side of the consumer group: coordinator lookup, membership protocol, partition
/// inventory and record fetches.
pub trait KafkaClient: Send + Sync + 'static {
    fn find_coordinator<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Result<Node>>;

    fn partitions<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<PartitionId>>>;

    fn join_group<'a>(
        &'a self,
        node: &'a Node,
        request: JoinGroupRequest,
    ) -> BoxFuture<'a, Result<JoinGroupResponse>>;

    fn sync_group<'a>(
        &'a self,
        node: &'a Node,
        request: SyncGroupRequest,
    ) -> BoxFuture<'a, Result<SyncGroupResponse>>;

    fn heartbeat<'a>(
        &'a self,
        node: &'a Node,
        request: HeartbeatRequest,
    ) -> BoxFuture<'a, Result<HeartbeatResponse>>;

    fn leave_group<'a>(
        &'a self,
        node: &'a Node,
        request: LeaveGroupRequest,
    ) -> BoxFuture<'a, Result<LeaveGroupResponse>>;

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<FetchResponse>>;

    /// Resolve the earliest or latest offset of a partition.
    fn list_offset<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
        strategy: OffsetResetStrategy,
    ) -> BoxFuture<'a, Result<i64>>;
}

/// Offset manager of the group, failures other than generation loss are reported and
/// otherwise ignored.
pub trait OffsetStore: Send + Sync + 'static {
    fn fetch_offset<'a>(
        &'a self,
        group_id: &'a str,
        topic: &'a str,
        partition: PartitionId,
    ) -> BoxFuture<'a, Result<Option<OffsetAndMetadata>>>;

    fn commit(&self, request: OffsetCommitRequest) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Default)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub member_id: MemberId,
    pub client_id: String,
    pub group_instance_id: Option<String>,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub protocol_type: String,
    /// protocol name to member metadata, in priority order
    pub protocols: IndexMap<String, Subscription>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinGroupResponse {
    pub error_code: i16,
    pub generation_id: i32,
    pub protocol_type: Option<String>,
    pub protocol_name: Option<String>,
    pub leader: MemberId,
    pub member_id: MemberId,
    /// only filled for the leader
    pub members: Vec<JoinGroupResponseMember>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinGroupResponseMember {
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
    pub metadata: Subscription,
}

#[derive(Debug, Clone, Default)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
    pub protocol_type: Option<String>,
    pub protocol_name: Option<String>,
    /// empty for every member but the leader
    pub assignments: IndexMap<MemberId, Assignment>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncGroupResponse {
    pub error_code: i16,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatResponse {
    pub error_code: i16,
}

#[derive(Debug, Clone, Default)]
pub struct MemberIdentity {
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub members: Vec<MemberIdentity>,
}

#[derive(Debug, Clone, Default)]
pub struct LeaveGroupResponse {
    pub error_code: i16,
}

#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: i64,
    pub max_bytes: i32,
    pub max_wait_ms: i32,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub error_code: i16,
    pub high_watermark: i64,
    pub records: Vec<ConsumerRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64, metadata: Option<String>) -> Self {
        Self { offset, metadata }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: MemberId,
    pub group_instance_id: Option<String>,
    pub offsets: HashMap<TopicPartition, OffsetAndMetadata>,
}

/// Approximate size of a record, used to honour `max_bytes` of a fetch.
pub fn record_size(record: &ConsumerRecord) -> usize {
    fn len(bytes: &Option<Bytes>) -> usize {
        bytes.as_ref().map(Bytes::len).unwrap_or_default()
    }
    len(&record.key)
        + len(&record.value)
        + record
            .headers
            .iter()
            .map(|(key, value)| key.len() + len(value))
            .sum::<usize>()
}
