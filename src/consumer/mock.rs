//! In-memory broker for tests: one coordinator serving every group, partition logs and an
//! offset store. Blocking protocol calls poll the shared state.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use kafka_protocol::ResponseError;
use tracing::debug;

use crate::{
    client::{
        record_size, FetchRequest, FetchResponse, HeartbeatRequest, HeartbeatResponse,
        JoinGroupRequest, JoinGroupResponse, JoinGroupResponseMember, KafkaClient,
        LeaveGroupRequest, LeaveGroupResponse, OffsetAndMetadata, OffsetCommitRequest,
        OffsetStore, SyncGroupRequest, SyncGroupResponse,
    },
    consumer::{
        partition_assignor::{Assignment, Subscription},
        ConsumerRecord, OffsetResetStrategy,
    },
    error::Result,
    metadata::{Node, TopicPartition},
    Error, MemberId, PartitionId,
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_RECORDS_PER_FETCH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
}

struct Member {
    group_instance_id: Option<String>,
    protocols: IndexMap<String, Subscription>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    last_seen: Instant,
}

#[derive(Default)]
struct Group {
    phase: Phase,
    generation_id: i32,
    leader: Option<MemberId>,
    protocol: Option<String>,
    members: IndexMap<MemberId, Member>,
    joined: HashSet<MemberId>,
    pending_member_ids: HashSet<MemberId>,
    join_responses: HashMap<MemberId, JoinGroupResponse>,
    assignments: HashMap<MemberId, Assignment>,
    static_members: HashMap<String, MemberId>,
    rebalance_deadline: Option<Instant>,
}

impl Group {
    fn begin_rebalance(&mut self, now: Instant) {
        let timeout = self
            .members
            .values()
            .map(|member| member.rebalance_timeout)
            .max()
            .unwrap_or(Duration::from_secs(3));
        debug!("Mock group begins rebalance, generation {}", self.generation_id);
        self.phase = Phase::PreparingRebalance;
        self.joined.clear();
        self.assignments.clear();
        self.rebalance_deadline = Some(now + timeout);
    }

    fn remove_member(&mut self, member_id: &str, now: Instant) {
        if let Some(member) = self.members.shift_remove(member_id) {
            if let Some(instance_id) = member.group_instance_id {
                self.static_members.remove(&instance_id);
            }
            self.joined.remove(member_id);
            self.join_responses.remove(member_id);
            match self.phase {
                Phase::Stable | Phase::CompletingRebalance => {
                    if self.members.is_empty() {
                        self.phase = Phase::Empty;
                        self.leader = None;
                    } else {
                        self.begin_rebalance(now);
                    }
                }
                _ => {}
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, member)| now.duration_since(member.last_seen) > member.session_timeout)
            .map(|(member_id, _)| member_id.clone())
            .collect();
        for member_id in expired {
            debug!("Mock group expires member {member_id}");
            self.remove_member(&member_id, now);
        }
    }

    fn try_complete(&mut self, now: Instant) {
        if self.phase != Phase::PreparingRebalance {
            return;
        }
        let everyone_joined = self
            .members
            .keys()
            .all(|member_id| self.joined.contains(member_id));
        let deadline_passed = self
            .rebalance_deadline
            .map(|deadline| now >= deadline)
            .unwrap_or_default();
        if !everyone_joined && !deadline_passed {
            return;
        }

        let joined = std::mem::take(&mut self.joined);
        self.members.retain(|member_id, _| joined.contains(member_id));
        self.static_members
            .retain(|_, member_id| joined.contains(member_id.as_str()));
        self.generation_id += 1;
        self.rebalance_deadline = None;
        if self.members.is_empty() {
            self.phase = Phase::Empty;
            self.leader = None;
            return;
        }

        let protocol = self.members.values().next().and_then(|first| {
            first
                .protocols
                .keys()
                .find(|name| {
                    self.members
                        .values()
                        .all(|member| member.protocols.contains_key(*name))
                })
                .cloned()
        });
        let leader = match &self.leader {
            Some(leader) if self.members.contains_key(leader) => leader.clone(),
            _ => self.members.keys().next().cloned().unwrap_or_default(),
        };
        self.protocol = protocol.clone();
        self.leader = Some(leader.clone());
        self.phase = Phase::CompletingRebalance;

        let protocol_name = protocol.unwrap_or_default();
        let members: Vec<JoinGroupResponseMember> = self
            .members
            .iter()
            .map(|(member_id, member)| JoinGroupResponseMember {
                member_id: member_id.clone(),
                group_instance_id: member.group_instance_id.clone(),
                metadata: member
                    .protocols
                    .get(&protocol_name)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        for member_id in self.members.keys() {
            let response = JoinGroupResponse {
                error_code: 0,
                generation_id: self.generation_id,
                protocol_type: Some("consumer".into()),
                protocol_name: Some(protocol_name.clone()),
                leader: leader.clone(),
                member_id: member_id.clone(),
                members: if *member_id == leader {
                    members.clone()
                } else {
                    Vec::new()
                },
            };
            self.join_responses.insert(member_id.clone(), response);
        }
        debug!(
            "Mock group completes generation {} with leader {leader}",
            self.generation_id
        );
    }

    fn touch(&mut self, member_id: &str, now: Instant) {
        if let Some(member) = self.members.get_mut(member_id) {
            member.last_seen = now;
        }
    }
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<ConsumerRecord>>>,
    groups: HashMap<String, Group>,
    offsets: HashMap<(String, TopicPartition), OffsetAndMetadata>,
    heartbeats: HashMap<MemberId, usize>,
    heartbeat_failures: VecDeque<ResponseError>,
    join_failures: VecDeque<ResponseError>,
    next_member: usize,
}

impl BrokerState {
    fn group(&mut self, group_id: &str, now: Instant) -> &mut Group {
        let group = self.groups.entry(group_id.to_string()).or_default();
        group.expire(now);
        group.try_complete(now);
        group
    }
}

enum JoinStep {
    Respond(JoinGroupResponse),
    Wait(MemberId),
}

fn error_response(error: ResponseError, member_id: MemberId) -> JoinStep {
    JoinStep::Respond(JoinGroupResponse {
        error_code: error.code(),
        member_id,
        ..Default::default()
    })
}

#[derive(Default)]
pub(crate) struct MockBroker {
    state: Mutex<BrokerState>,
    coordinator_lookups: AtomicUsize,
    coordinator_failures: AtomicUsize,
    coordinator_stalled: AtomicBool,
    commits: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll<T, F>(&self, mut f: F) -> T
    where
        F: FnMut(&mut BrokerState, Instant) -> Option<T>,
    {
        loop {
            let ready = {
                let mut state = self.lock();
                f(&mut state, Instant::now())
            };
            if let Some(value) = ready {
                return value;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.lock()
            .logs
            .insert(topic.to_string(), vec![Vec::new(); partitions]);
    }

    pub fn produce<B: Into<Bytes>>(&self, topic: &str, partition: PartitionId, value: B) -> i64 {
        let mut state = self.lock();
        let log = state
            .logs
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .unwrap_or_else(|| panic!("unknown partition {topic}-{partition}"));
        let offset = log.len() as i64;
        log.push(ConsumerRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
            timestamp: offset,
        });
        offset
    }

    /// Makes the next `n` coordinator lookups fail.
    pub fn fail_coordinator_lookups(&self, n: usize) {
        self.coordinator_failures.store(n, Ordering::SeqCst);
    }

    /// Makes coordinator lookups hang until they are dropped.
    pub fn stall_coordinator_lookups(&self) {
        self.coordinator_stalled.store(true, Ordering::SeqCst);
    }

    /// Answers the next heartbeats with `errors`, in order, without touching the group.
    pub fn fail_heartbeats(&self, errors: &[ResponseError]) {
        self.lock().heartbeat_failures.extend(errors.iter().copied());
    }

    /// Answers the next joins with `errors`, in order, without touching the group.
    pub fn fail_joins(&self, errors: &[ResponseError]) {
        self.lock().join_failures.extend(errors.iter().copied());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.heartbeat_failures.clear();
        state.join_failures.clear();
    }

    /// Installs a stable generation without running the protocol.
    pub fn force_generation(&self, group_id: &str, generation_id: i32, members: &[&str]) {
        let now = Instant::now();
        let mut state = self.lock();
        let group = state.groups.entry(group_id.to_string()).or_default();
        group.generation_id = generation_id;
        group.phase = Phase::Stable;
        group.leader = members.first().map(ToString::to_string);
        for member_id in members {
            group.members.insert(
                member_id.to_string(),
                Member {
                    group_instance_id: None,
                    protocols: IndexMap::new(),
                    session_timeout: Duration::from_secs(60),
                    rebalance_timeout: Duration::from_secs(60),
                    last_seen: now,
                },
            );
        }
    }

    pub fn coordinator_lookups(&self) -> usize {
        self.coordinator_lookups.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self, member_id: &str) -> usize {
        self.lock()
            .heartbeats
            .get(member_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn committed(&self, group_id: &str, topic: &str, partition: PartitionId) -> Option<i64> {
        self.lock()
            .offsets
            .get(&(group_id.to_string(), TopicPartition::new(topic, partition)))
            .map(|offset| offset.offset)
    }

    pub fn generation(&self, group_id: &str) -> i32 {
        self.lock()
            .groups
            .get(group_id)
            .map(|group| group.generation_id)
            .unwrap_or_default()
    }

    pub fn members(&self, group_id: &str) -> Vec<MemberId> {
        self.lock()
            .groups
            .get(group_id)
            .map(|group| group.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn start_join(&self, request: &JoinGroupRequest) -> JoinStep {
        let now = Instant::now();
        let mut state = self.lock();
        state.next_member += 1;
        let candidate_id = format!("{}-{}", request.client_id, state.next_member);
        let group = state.group(&request.group_id, now);

        if !group.members.is_empty()
            && !request.protocols.keys().any(|name| {
                group
                    .members
                    .values()
                    .all(|member| member.protocols.contains_key(name))
            })
        {
            return error_response(ResponseError::InconsistentGroupProtocol, request.member_id.clone());
        }

        let member_id = match &request.group_instance_id {
            Some(instance_id) => match group.static_members.get(instance_id).cloned() {
                Some(existing) => {
                    if !request.member_id.is_empty() && request.member_id != existing {
                        return error_response(ResponseError::FencedInstanceId, request.member_id.clone());
                    }
                    if group.phase == Phase::Stable {
                        if let Some(member) = group.members.get_mut(&existing) {
                            let unchanged = member.protocols.len() == request.protocols.len()
                                && request.protocols.iter().all(|(name, subscription)| {
                                    member
                                        .protocols
                                        .get(name)
                                        .map(|known| known.topics == subscription.topics)
                                        .unwrap_or_default()
                                });
                            if unchanged {
                                member.last_seen = now;
                                debug!("Mock group rejoins static member {existing} without rebalance");
                                return JoinStep::Respond(JoinGroupResponse {
                                    error_code: 0,
                                    generation_id: group.generation_id,
                                    protocol_type: Some("consumer".into()),
                                    protocol_name: group.protocol.clone(),
                                    leader: group.leader.clone().unwrap_or_default(),
                                    member_id: existing,
                                    members: Vec::new(),
                                });
                            }
                        }
                    }
                    existing
                }
                None => {
                    group
                        .static_members
                        .insert(instance_id.clone(), candidate_id.clone());
                    candidate_id
                }
            },
            None if request.member_id.is_empty() => {
                group.pending_member_ids.insert(candidate_id.clone());
                return error_response(ResponseError::MemberIdRequired, candidate_id);
            }
            None => {
                if !group.members.contains_key(&request.member_id)
                    && !group.pending_member_ids.remove(&request.member_id)
                {
                    return error_response(ResponseError::UnknownMemberId, request.member_id.clone());
                }
                request.member_id.clone()
            }
        };

        group.members.insert(
            member_id.clone(),
            Member {
                group_instance_id: request.group_instance_id.clone(),
                protocols: request.protocols.clone(),
                session_timeout: Duration::from_millis(request.session_timeout_ms as u64),
                rebalance_timeout: Duration::from_millis(request.rebalance_timeout_ms as u64),
                last_seen: now,
            },
        );
        if group.phase != Phase::PreparingRebalance {
            group.begin_rebalance(now);
        }
        group.join_responses.remove(&member_id);
        group.joined.insert(member_id.clone());
        group.try_complete(now);
        JoinStep::Wait(member_id)
    }
}

impl KafkaClient for MockBroker {
    fn find_coordinator<'a>(&'a self, _group_id: &'a str) -> BoxFuture<'a, Result<Node>> {
        Box::pin(async move {
            self.coordinator_lookups.fetch_add(1, Ordering::SeqCst);
            if self.coordinator_stalled.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            let failures = self.coordinator_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.coordinator_failures.store(failures - 1, Ordering::SeqCst);
                return Err(ResponseError::CoordinatorNotAvailable.into());
            }
            Ok(Node::new(1, "localhost".into(), 9092))
        })
    }

    fn partitions<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<Vec<PartitionId>>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .logs
                .get(topic)
                .map(|partitions| (0..partitions.len() as PartitionId).collect())
                .unwrap_or_default())
        })
    }

    fn join_group<'a>(
        &'a self,
        _node: &'a Node,
        request: JoinGroupRequest,
    ) -> BoxFuture<'a, Result<JoinGroupResponse>> {
        Box::pin(async move {
            let injected = self.lock().join_failures.pop_front();
            if let Some(error) = injected {
                return Ok(JoinGroupResponse {
                    error_code: error.code(),
                    member_id: request.member_id,
                    ..Default::default()
                });
            }
            let member_id = match self.start_join(&request) {
                JoinStep::Respond(response) => return Ok(response),
                JoinStep::Wait(member_id) => member_id,
            };
            let group_id = request.group_id;
            let response = self
                .poll(|state, now| {
                    let group = state.group(&group_id, now);
                    group.touch(&member_id, now);
                    if let Some(response) = group.join_responses.remove(&member_id) {
                        return Some(response);
                    }
                    if !group.members.contains_key(&member_id) {
                        return Some(JoinGroupResponse {
                            error_code: ResponseError::UnknownMemberId.code(),
                            member_id: member_id.clone(),
                            ..Default::default()
                        });
                    }
                    if group.phase == Phase::PreparingRebalance {
                        group.joined.insert(member_id.clone());
                    }
                    None
                })
                .await;
            Ok(response)
        })
    }

    fn sync_group<'a>(
        &'a self,
        _node: &'a Node,
        request: SyncGroupRequest,
    ) -> BoxFuture<'a, Result<SyncGroupResponse>> {
        Box::pin(async move {
            let mut assignments = Some(request.assignments);
            let response = self
                .poll(|state, now| {
                    let group = state.group(&request.group_id, now);
                    let error = |error: ResponseError| {
                        Some(SyncGroupResponse {
                            error_code: error.code(),
                            ..Default::default()
                        })
                    };
                    if !group.members.contains_key(&request.member_id) {
                        return error(ResponseError::UnknownMemberId);
                    }
                    group.touch(&request.member_id, now);
                    if request.generation_id != group.generation_id {
                        return error(ResponseError::IllegalGeneration);
                    }
                    match group.phase {
                        Phase::Empty => error(ResponseError::UnknownMemberId),
                        Phase::PreparingRebalance => error(ResponseError::RebalanceInProgress),
                        Phase::CompletingRebalance => {
                            if group.leader.as_deref() == Some(request.member_id.as_str()) {
                                if let Some(assignments) = assignments.take() {
                                    group.assignments = assignments.into_iter().collect();
                                    group.phase = Phase::Stable;
                                    return Some(SyncGroupResponse {
                                        error_code: 0,
                                        assignment: group
                                            .assignments
                                            .get(&request.member_id)
                                            .cloned()
                                            .unwrap_or_default(),
                                    });
                                }
                            }
                            None
                        }
                        Phase::Stable => Some(SyncGroupResponse {
                            error_code: 0,
                            assignment: group
                                .assignments
                                .get(&request.member_id)
                                .cloned()
                                .unwrap_or_default(),
                        }),
                    }
                })
                .await;
            Ok(response)
        })
    }

    fn heartbeat<'a>(
        &'a self,
        _node: &'a Node,
        request: HeartbeatRequest,
    ) -> BoxFuture<'a, Result<HeartbeatResponse>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.lock();
            *state
                .heartbeats
                .entry(request.member_id.clone())
                .or_default() += 1;
            if let Some(error) = state.heartbeat_failures.pop_front() {
                return Ok(HeartbeatResponse {
                    error_code: error.code(),
                });
            }
            let group = state.group(&request.group_id, now);
            let error = if !group.members.contains_key(&request.member_id) {
                Some(ResponseError::UnknownMemberId)
            } else if request.generation_id != group.generation_id {
                Some(ResponseError::IllegalGeneration)
            } else if group.phase == Phase::PreparingRebalance {
                Some(ResponseError::RebalanceInProgress)
            } else {
                None
            };
            group.touch(&request.member_id, now);
            Ok(HeartbeatResponse {
                error_code: error.map(|error| error.code()).unwrap_or_default(),
            })
        })
    }

    fn leave_group<'a>(
        &'a self,
        _node: &'a Node,
        request: LeaveGroupRequest,
    ) -> BoxFuture<'a, Result<LeaveGroupResponse>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.lock();
            let group = state.group(&request.group_id, now);
            let mut error_code = 0;
            for member in request.members {
                if group.members.contains_key(&member.member_id) {
                    group.remove_member(&member.member_id, now);
                } else {
                    error_code = ResponseError::UnknownMemberId.code();
                }
            }
            group.try_complete(now);
            Ok(LeaveGroupResponse { error_code })
        })
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<FetchResponse>> {
        Box::pin(async move {
            let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms as u64);
            let response = self
                .poll(|state, now| {
                    let log = match state
                        .logs
                        .get(&request.topic)
                        .and_then(|partitions| partitions.get(request.partition as usize))
                    {
                        Some(log) => log,
                        None => {
                            return Some(FetchResponse {
                                error_code: ResponseError::UnknownTopicOrPartition.code(),
                                ..Default::default()
                            })
                        }
                    };
                    let high_watermark = log.len() as i64;
                    if request.offset < 0 || request.offset > high_watermark {
                        return Some(FetchResponse {
                            error_code: ResponseError::OffsetOutOfRange.code(),
                            high_watermark,
                            ..Default::default()
                        });
                    }
                    if request.offset == high_watermark && now < deadline {
                        return None;
                    }
                    let mut bytes = 0;
                    let records = log[request.offset as usize..]
                        .iter()
                        .take(MAX_RECORDS_PER_FETCH)
                        .take_while(|record| {
                            let first = bytes == 0;
                            bytes += record_size(record).max(1);
                            first || bytes <= request.max_bytes as usize
                        })
                        .cloned()
                        .collect();
                    Some(FetchResponse {
                        error_code: 0,
                        high_watermark,
                        records,
                    })
                })
                .await;
            Ok(response)
        })
    }

    fn list_offset<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
        strategy: OffsetResetStrategy,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let state = self.lock();
            let len = state
                .logs
                .get(topic)
                .and_then(|partitions| partitions.get(partition as usize))
                .map(|log| log.len() as i64)
                .ok_or(Error::TopicNotAvailable {
                    topic: topic.to_string(),
                })?;
            match strategy {
                OffsetResetStrategy::Earliest => Ok(0),
                OffsetResetStrategy::Latest => Ok(len),
                OffsetResetStrategy::None => Err(ResponseError::OffsetOutOfRange.into()),
            }
        })
    }
}

impl OffsetStore for MockBroker {
    fn fetch_offset<'a>(
        &'a self,
        group_id: &'a str,
        topic: &'a str,
        partition: PartitionId,
    ) -> BoxFuture<'a, Result<Option<OffsetAndMetadata>>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .offsets
                .get(&(group_id.to_string(), TopicPartition::new(topic, partition)))
                .cloned())
        })
    }

    fn commit(&self, request: OffsetCommitRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.lock();
            let group = state.group(&request.group_id, now);
            if !group.members.contains_key(&request.member_id) {
                return Err(ResponseError::UnknownMemberId.into());
            }
            if request.generation_id != group.generation_id {
                return Err(ResponseError::IllegalGeneration.into());
            }
            if group.phase == Phase::CompletingRebalance {
                return Err(ResponseError::RebalanceInProgress.into());
            }
            for (tp, offset) in request.offsets {
                state
                    .offsets
                    .insert((request.group_id.clone(), tp), offset);
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
