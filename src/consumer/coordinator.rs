use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{
    future::{select, Either},
    pin_mut, StreamExt,
};
use indexmap::IndexMap;
use kafka_protocol::{error::ParseResponseErrorCode, ResponseError};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{
        HeartbeatRequest, JoinGroupRequest, KafkaClient, LeaveGroupRequest, MemberIdentity,
        SyncGroupRequest, CONSUMER_PROTOCOL_TYPE,
    },
    consumer::{
        partition_assignor::{
            validate_plan, Assignment, PartitionAssigner, PartitionAssignor, Subscription,
        },
        ConsumerGroupMetadata, ConsumerOptions, MemberState,
    },
    error::{ConnectionError, ConsumeError, Result},
    executor::Executor,
    metadata::{partitions_per_topic, Node},
    Error, ErrorReporter, MemberId, PartitionId, DEFAULT_GENERATION_ID,
};

const MAX_BACKOFF_FACTOR: u32 = 32;

/// One generation as seen by this member.
#[derive(Debug, Clone)]
pub(crate) struct Generation {
    pub generation_id: i32,
    pub member_id: MemberId,
    pub assignment: HashMap<String, Vec<PartitionId>>,
}

pub(crate) struct ConsumerCoordinator<Exe: Executor> {
    client: Arc<dyn KafkaClient>,
    executor: Exe,
    options: Arc<ConsumerOptions>,
    node: Option<Node>,
    group_meta: ConsumerGroupMetadata,
    group_subscription: HashMap<MemberId, Subscription>,
    assignors: Vec<PartitionAssignor>,
    state: MemberState,
    topics: HashSet<String>,
    user_data: Option<Bytes>,
    owned_partitions: HashMap<String, Vec<PartitionId>>,
    owned_generation: i32,
}

impl<Exe: Executor> ConsumerCoordinator<Exe> {
    pub fn new(
        client: Arc<dyn KafkaClient>,
        executor: Exe,
        options: Arc<ConsumerOptions>,
        assignors: Vec<PartitionAssignor>,
    ) -> Self {
        let mut group_meta = ConsumerGroupMetadata::new(options.group_id.clone());
        group_meta.group_instance_id = options.group_instance_id.clone();
        Self {
            client,
            executor,
            node: None,
            group_meta,
            group_subscription: HashMap::new(),
            assignors,
            state: MemberState::UnJoined,
            topics: HashSet::new(),
            user_data: options.member_user_data.clone(),
            owned_partitions: HashMap::new(),
            owned_generation: DEFAULT_GENERATION_ID,
            options,
        }
    }

    pub fn group_meta(&self) -> &ConsumerGroupMetadata {
        &self.group_meta
    }

    pub fn subscribe(&mut self, topics: HashSet<String>) {
        if topics != self.topics {
            debug!(
                "Group [{}] subscription changed to {:?}",
                self.group_meta.group_id, topics
            );
            self.topics = topics;
        }
    }

    async fn ensure_coordinator(&mut self) -> Result<Node> {
        if let Some(node) = &self.node {
            return Ok(node.clone());
        }
        let node = self
            .client
            .find_coordinator(&self.group_meta.group_id)
            .await?;
        info!(
            "Find coordinator success, group {}, node: {}",
            self.group_meta.group_id,
            node.address()
        );
        self.node = Some(node.clone());
        Ok(node)
    }

    fn reset_state(&mut self, should_reset_member_id: bool) {
        self.state = MemberState::UnJoined;
        self.group_meta.generation_id = DEFAULT_GENERATION_ID;
        self.group_meta.protocol_name = None;
        if should_reset_member_id {
            self.group_meta.member_id = MemberId::default();
            self.group_meta.leader = MemberId::default();
        }
    }

    /// Join and sync until a generation is established, retrying transient failures with
    /// backoff until the rebalance timeout elapses.
    pub async fn rebalance(&mut self) -> Result<Generation> {
        let timeout_ms = self.options.rebalance_options.rebalance_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut retries = 0u32;

        loop {
            let result = match self.join_group().await {
                Ok(()) => self.sync_group().await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(assignment) => {
                    return Ok(Generation {
                        generation_id: self.group_meta.generation_id,
                        member_id: self.group_meta.member_id.clone(),
                        assignment: assignment.partitions,
                    })
                }
                Err(err) if err.is_fatal() => {
                    error!(
                        "Rebalance of group [{}] failed with fatal error: {err}",
                        self.group_meta.group_id
                    );
                    self.reset_state(false);
                    return Err(err);
                }
                Err(err) => err,
            };

            self.handle_rebalance_error(&err);
            if matches!(err.response_error(), Some(ResponseError::RebalanceInProgress)) {
                debug!(
                    "Group [{}] is rebalancing again, rejoin immediately",
                    self.group_meta.group_id
                );
                if Instant::now() < deadline {
                    continue;
                }
            }

            let backoff = self.backoff(retries);
            if Instant::now() + backoff >= deadline {
                return Err(ConsumeError::RebalanceTimeout {
                    timeout_ms,
                    source: Box::new(err),
                }
                .into());
            }
            retries += 1;
            warn!(
                "Join group [{}] failed, retrying after {}ms: {err}",
                self.group_meta.group_id,
                backoff.as_millis()
            );
            self.executor.delay(backoff).await;
        }
    }

    fn backoff(&self, retries: u32) -> Duration {
        let min_backoff = self.options.rebalance_options.retry_backoff_ms.max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..10);
        let backoff = std::cmp::min(
            min_backoff.saturating_mul(2u64.saturating_pow(retries)),
            min_backoff * MAX_BACKOFF_FACTOR as u64,
        ) + min_backoff * jitter / 10;
        Duration::from_millis(backoff)
    }

    fn handle_rebalance_error(&mut self, err: &Error) {
        if err.is_coordinator_lost() || matches!(err, Error::Connection(_)) {
            info!(
                "Coordinator {:?} of group [{}] is unavailable, will rediscover it",
                self.node.as_ref().map(|node| node.id),
                self.group_meta.group_id
            );
            self.node = None;
        }
        match err.response_error() {
            Some(ResponseError::UnknownMemberId) => self.reset_state(true),
            Some(ResponseError::IllegalGeneration) => self.reset_state(false),
            _ => self.state = MemberState::UnJoined,
        }
    }

    #[async_recursion::async_recursion]
    async fn join_group(&mut self) -> Result<()> {
        self.state = MemberState::PreparingRebalance;
        let node = self.ensure_coordinator().await?;
        let request = self.join_group_request();
        let join_group_response = self.client.join_group(&node, request).await?;

        match join_group_response.error_code.err() {
            Some(ResponseError::MemberIdRequired) => {
                self.group_meta.member_id = join_group_response.member_id;
                warn!(
                    "Join group with unknown member id, will rejoin group [{}] with member id: {}",
                    self.group_meta.group_id, self.group_meta.member_id
                );
                self.join_group().await
            }
            Some(error) => Err(error.into()),
            None => {
                self.group_meta.member_id = join_group_response.member_id;
                self.group_meta.generation_id = join_group_response.generation_id;
                self.group_meta.leader = join_group_response.leader;
                self.group_meta.protocol_name = join_group_response.protocol_name;
                self.group_meta.protocol_type = join_group_response.protocol_type;

                self.group_subscription = join_group_response
                    .members
                    .into_iter()
                    .map(|member| {
                        let mut subscription = member.metadata;
                        subscription.group_instance_id(member.group_instance_id);
                        (member.member_id, subscription)
                    })
                    .collect();
                self.state = MemberState::CompletingRebalance;

                info!(
                    "Join group [{}] success, leader = {}, member_id = {}, generation_id = {}",
                    self.group_meta.group_id,
                    self.group_meta.leader,
                    self.group_meta.member_id,
                    self.group_meta.generation_id
                );
                Ok(())
            }
        }
    }

    async fn sync_group(&mut self) -> Result<Assignment> {
        let assignments = if self.group_meta.is_leader() && !self.group_subscription.is_empty() {
            self.perform_assignment().await?
        } else {
            IndexMap::new()
        };

        let node = self.ensure_coordinator().await?;
        let request = SyncGroupRequest {
            group_id: self.group_meta.group_id.clone(),
            generation_id: self.group_meta.generation_id,
            member_id: self.group_meta.member_id.clone(),
            group_instance_id: self.group_meta.group_instance_id.clone(),
            protocol_type: self.group_meta.protocol_type.clone(),
            protocol_name: self.group_meta.protocol_name.clone(),
            assignments,
        };
        let sync_group_response = self.client.sync_group(&node, request).await?;

        match sync_group_response.error_code.err() {
            None => {
                let assignment = sync_group_response.assignment;
                self.user_data = assignment
                    .user_data
                    .clone()
                    .or_else(|| self.options.member_user_data.clone());
                self.owned_partitions = assignment
                    .partitions
                    .iter()
                    .filter(|(_, partitions)| !partitions.is_empty())
                    .map(|(topic, partitions)| (topic.clone(), partitions.clone()))
                    .collect();
                self.owned_generation = self.group_meta.generation_id;
                self.state = MemberState::Stable;
                info!(
                    "Sync group [{}] success, leader = {}, member_id = {}, generation_id = {}, \
                     protocol_type = {:?}, protocol_name = {:?}, assignment = {:?}",
                    self.group_meta.group_id,
                    self.group_meta.leader,
                    self.group_meta.member_id,
                    self.group_meta.generation_id,
                    self.group_meta.protocol_type.as_ref(),
                    self.group_meta.protocol_name.as_ref(),
                    self.owned_partitions,
                );
                Ok(assignment)
            }
            Some(error) => Err(error.into()),
        }
    }

    /// Runs on the leader only: plan the generation with the protocol the coordinator picked.
    async fn perform_assignment(&mut self) -> Result<IndexMap<MemberId, Assignment>> {
        let protocol = match self.group_meta.protocol_name {
            Some(ref protocol) => protocol.clone(),
            None => {
                return Err(Error::Custom(format!(
                    "Group leader {} has no partition assignor protocol",
                    self.group_meta.leader
                )))
            }
        };

        let subscribed: HashSet<String> = self
            .group_subscription
            .values()
            .flat_map(|subscription| subscription.topics.iter().cloned())
            .collect();
        let partitions = partitions_per_topic(&*self.client, &subscribed).await?;

        let generation_id = self.group_meta.generation_id;
        let members = &self.group_subscription;
        let assignor = self
            .assignors
            .iter_mut()
            .find(|assignor| assignor.name() == protocol)
            .ok_or_else(|| ConsumeError::PartitionAssignorNotAvailable(protocol.clone()))?;

        let mut plan = assignor.plan(members, &partitions)?;
        for member_id in members.keys() {
            plan.entry(member_id.clone()).or_default();
        }
        validate_plan(assignor.name(), &plan, members, &partitions)?;

        let mut member_ids: Vec<MemberId> = plan.keys().cloned().collect();
        member_ids.sort();
        let mut assignments = IndexMap::with_capacity(member_ids.len());
        for member_id in member_ids {
            if let Some(partitions) = plan.remove(&member_id) {
                let user_data = assignor.assignment_data(&member_id, &partitions, generation_id)?;
                let mut assignment = Assignment::new(partitions);
                assignment.user_data = user_data;
                assignments.insert(member_id, assignment);
            }
        }
        debug!(
            "Group [{}] leader {} computed assignment with {}: {:?}",
            self.group_meta.group_id, self.group_meta.member_id, protocol, assignments
        );
        Ok(assignments)
    }

    /// Sends a Leave for dynamic members, static members stay registered so that a
    /// restart within the session timeout keeps their assignment.
    pub async fn leave_group(&mut self) -> Result<()> {
        if self.group_meta.member_id.is_empty() {
            self.reset_state(true);
            return Ok(());
        }
        if self.group_meta.group_instance_id.is_some()
            || !self.options.rebalance_options.leave_group_on_close
        {
            info!(
                "Member {} of group [{}] does not leave on close, instance id: {:?}",
                self.group_meta.member_id,
                self.group_meta.group_id,
                self.group_meta.group_instance_id
            );
            self.reset_state(true);
            return Ok(());
        }

        let request = LeaveGroupRequest {
            group_id: self.group_meta.group_id.clone(),
            members: vec![MemberIdentity {
                member_id: self.group_meta.member_id.clone(),
                group_instance_id: self.group_meta.group_instance_id.clone(),
            }],
        };
        let timeout = Duration::from_millis(self.options.leave_group_timeout_ms.max(0) as u64);
        let executor = self.executor.clone();
        // the coordinator lookup counts against the leave timeout too
        let leave = async {
            let node = self.ensure_coordinator().await?;
            self.client.leave_group(&node, request).await
        };
        let result = executor.timeout(timeout, leave).await;
        let member_id = std::mem::take(&mut self.group_meta.member_id);
        self.reset_state(true);

        let leave_group_response = result.map_err(ConnectionError::from)??;
        match leave_group_response.error_code.err() {
            None => {
                info!(
                    "Leave group [{}] success, member: {}",
                    self.group_meta.group_id, member_id
                );
                Ok(())
            }
            Some(error) => {
                error!(
                    "Member {} leave group [{}] failed: {error}",
                    member_id, self.group_meta.group_id
                );
                Err(error.into())
            }
        }
    }

    pub fn heartbeat(&self, generation: &Generation) -> Heartbeat {
        debug_assert!(!self.state.has_not_joined_group());
        Heartbeat {
            client: self.client.clone(),
            node: self.node.clone(),
            request: HeartbeatRequest {
                group_id: self.group_meta.group_id.clone(),
                generation_id: generation.generation_id,
                member_id: generation.member_id.clone(),
                group_instance_id: self.group_meta.group_instance_id.clone(),
            },
            session_timeout: Duration::from_millis(
                self.options.rebalance_options.session_timeout_ms as u64,
            ),
            interval: Duration::from_millis(
                self.options.rebalance_options.heartbeat_interval_ms as u64,
            ),
        }
    }

    /// Fold the result of a finished heartbeat task back into the protocol state.
    pub fn apply_heartbeat(&mut self, outcome: HeartbeatOutcome) -> Result<()> {
        match outcome {
            HeartbeatOutcome::Stopped { node } | HeartbeatOutcome::Rebalance { node } => {
                self.node = node;
                self.state = MemberState::UnJoined;
                Ok(())
            }
            HeartbeatOutcome::GenerationLost { node, error } => {
                self.node = node;
                self.reset_state(matches!(
                    error,
                    ResponseError::UnknownMemberId | ResponseError::FencedInstanceId
                ));
                if matches!(error, ResponseError::FencedInstanceId) {
                    Err(error.into())
                } else {
                    Ok(())
                }
            }
            HeartbeatOutcome::Failed { node, error } => {
                self.node = node;
                self.state = MemberState::UnJoined;
                if error.is_fatal() {
                    Err(error)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn reset_generation(&mut self) {
        self.reset_state(false);
    }

    fn join_group_request(&self) -> JoinGroupRequest {
        debug!(
            "Joining group [{}] with current subscription: {:?}",
            self.group_meta.group_id, self.topics
        );
        let mut protocols = IndexMap::with_capacity(self.assignors.len());
        for assignor in self.assignors.iter() {
            let mut subscription = Subscription::new(
                self.topics.clone(),
                self.user_data.clone(),
                self.owned_partitions.clone(),
            );
            subscription.generation_id(self.owned_generation);
            subscription.group_instance_id(self.group_meta.group_instance_id.clone());
            protocols.insert(assignor.name().to_string(), subscription);
        }

        JoinGroupRequest {
            group_id: self.group_meta.group_id.clone(),
            member_id: self.group_meta.member_id.clone(),
            client_id: self.options.client_id.clone(),
            group_instance_id: self.group_meta.group_instance_id.clone(),
            session_timeout_ms: self.options.rebalance_options.session_timeout_ms,
            rebalance_timeout_ms: self.options.rebalance_options.rebalance_timeout_ms,
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            protocols,
        }
    }
}

/// Why the heartbeat task of a session stopped, with the coordinator it ended up talking to.
#[derive(Debug)]
pub(crate) enum HeartbeatOutcome {
    Stopped {
        node: Option<Node>,
    },
    Rebalance {
        node: Option<Node>,
    },
    GenerationLost {
        node: Option<Node>,
        error: ResponseError,
    },
    Failed {
        node: Option<Node>,
        error: Error,
    },
}

/// Keeps one generation alive. Runs in its own task, detached from the coordinator, so
/// that slow handlers never delay a heartbeat.
pub(crate) struct Heartbeat {
    client: Arc<dyn KafkaClient>,
    node: Option<Node>,
    request: HeartbeatRequest,
    session_timeout: Duration,
    interval: Duration,
}

impl Heartbeat {
    async fn heartbeat<Exe: Executor>(&mut self, executor: &Exe) -> Result<()> {
        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let node = self.client.find_coordinator(&self.request.group_id).await?;
                info!(
                    "Rediscovered coordinator of group [{}], node: {}",
                    self.request.group_id,
                    node.address()
                );
                self.node = Some(node.clone());
                node
            }
        };
        let heartbeat = self.client.heartbeat(&node, self.request.clone());
        let heartbeat_response = executor
            .timeout(self.session_timeout, heartbeat)
            .await
            .map_err(ConnectionError::from)??;

        match heartbeat_response.error_code.err() {
            None => {
                debug!(
                    "Heartbeat success, group: {}, member: {}",
                    self.request.group_id, self.request.member_id
                );
                Ok(())
            }
            Some(error) => Err(error.into()),
        }
    }

    pub async fn run<Exe: Executor>(
        mut self,
        executor: Exe,
        stop: CancellationToken,
        session: CancellationToken,
        errors: ErrorReporter,
    ) -> HeartbeatOutcome {
        let mut interval = executor.interval(self.interval);
        let mut last_success = Instant::now();
        let mut rebalancing = false;

        loop {
            {
                let tick = interval.next();
                let stopped = stop.cancelled();
                pin_mut!(tick);
                pin_mut!(stopped);
                if let Either::Right(_) = select(tick, stopped).await {
                    break;
                }
            }

            let result = {
                let heartbeat = self.heartbeat(&executor);
                let stopped = stop.cancelled();
                pin_mut!(heartbeat);
                pin_mut!(stopped);
                match select(heartbeat, stopped).await {
                    Either::Left((result, _)) => result,
                    Either::Right(_) => break,
                }
            };

            let err = match result {
                Ok(()) => {
                    last_success = Instant::now();
                    continue;
                }
                Err(err) => err,
            };

            match err.response_error() {
                Some(ResponseError::RebalanceInProgress) => {
                    if !rebalancing {
                        warn!("Request joining group due to: group is already rebalancing");
                        rebalancing = true;
                        session.cancel();
                    }
                    last_success = Instant::now();
                }
                Some(
                    error @ (ResponseError::IllegalGeneration
                    | ResponseError::UnknownMemberId
                    | ResponseError::FencedInstanceId),
                ) => {
                    info!(
                        "Attempt to heartbeat with generation {} and group instance id {:?} \
                         failed due to {error}, resetting generation",
                        self.request.generation_id, self.request.group_instance_id
                    );
                    session.cancel();
                    return HeartbeatOutcome::GenerationLost {
                        node: self.node,
                        error,
                    };
                }
                _ if err.is_fatal() => {
                    error!("Heartbeat of group [{}] failed: {err}", self.request.group_id);
                    session.cancel();
                    return HeartbeatOutcome::Failed {
                        node: self.node,
                        error: err,
                    };
                }
                _ => {
                    if err.is_coordinator_lost() || matches!(err, Error::Connection(_)) {
                        info!(
                            "Attempt to heartbeat failed since coordinator {:?} is either not \
                             started or not valid",
                            self.node.as_ref().map(|node| node.id)
                        );
                        self.node = None;
                    }
                    if last_success.elapsed() >= self.session_timeout {
                        error!(
                            "No successful heartbeat of member {} within the session timeout, \
                             last error: {err}",
                            self.request.member_id
                        );
                        session.cancel();
                        return HeartbeatOutcome::Failed {
                            node: self.node,
                            error: err,
                        };
                    }
                    errors.report(err);
                }
            }
        }

        debug!(
            "Heartbeat task of member {} finished.",
            self.request.member_id
        );
        if rebalancing {
            HeartbeatOutcome::Rebalance { node: self.node }
        } else {
            HeartbeatOutcome::Stopped { node: self.node }
        }
    }
}
