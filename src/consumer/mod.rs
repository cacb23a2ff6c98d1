mod claim;
mod coordinator;
mod group;
#[cfg(test)]
pub(crate) mod mock;
pub mod partition_assignor;
mod session;

use std::collections::HashSet;

use bytes::Bytes;

pub use self::{
    claim::ConsumerGroupClaim,
    group::{ConsumerGroup, ConsumerGroupHandler},
    partition_assignor::{PartitionAssigner, PartitionAssignor},
    session::ConsumerGroupSession,
};
use crate::{Error, MemberId, PartitionId, Result, DEFAULT_GENERATION_ID};

/// High-level consumer record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Option<Bytes>)>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OffsetResetStrategy {
    Latest,
    Earliest,
    None,
}

impl Default for OffsetResetStrategy {
    fn default() -> Self {
        OffsetResetStrategy::Earliest
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceOptions {
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub heartbeat_interval_ms: i32,
    pub retry_backoff_ms: i64,
    pub leave_group_on_close: bool,
}

impl Default for RebalanceOptions {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            // max.poll.interval.ms
            rebalance_timeout_ms: 300_000,
            heartbeat_interval_ms: 3000,
            retry_backoff_ms: 100,
            leave_group_on_close: true,
        }
    }
}

#[derive(Debug)]
pub struct ConsumerOptions {
    pub group_id: String,
    pub client_id: String,
    /// static membership, the instance id survives restarts of the member
    pub group_instance_id: Option<String>,
    /// sent in the join metadata until an assignor hands back its own payload
    pub member_user_data: Option<Bytes>,
    pub rebalance_options: RebalanceOptions,
    /// in priority order, the coordinator picks the first one every member supports
    pub assignors: Vec<PartitionAssignor>,
    pub auto_commit_enabled: bool,
    pub auto_commit_interval_ms: i32,
    pub auto_offset_reset: OffsetResetStrategy,
    pub return_errors: bool,
    pub channel_buffer_size: usize,
    pub fetch_max_bytes: i32,
    pub fetch_max_wait_ms: i32,
    pub fetch_retry_backoff_ms: i64,
    pub leave_group_timeout_ms: i32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            client_id: "kafkas".into(),
            group_instance_id: None,
            member_user_data: None,
            rebalance_options: RebalanceOptions::default(),
            assignors: vec![PartitionAssignor::range()],
            auto_commit_enabled: true,
            auto_commit_interval_ms: 1000,
            auto_offset_reset: OffsetResetStrategy::default(),
            return_errors: false,
            channel_buffer_size: 256,
            fetch_max_bytes: 1024 * 1024,
            fetch_max_wait_ms: 250,
            fetch_retry_backoff_ms: 2000,
            leave_group_timeout_ms: 5000,
        }
    }
}

impl ConsumerOptions {
    pub fn new<S: Into<String>>(group_id: S) -> Self {
        Self {
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    pub fn client_id<S: Into<String>>(&mut self, client_id: S) {
        self.client_id = client_id.into();
    }

    pub fn group_instance_id<S: Into<String>>(&mut self, group_instance_id: S) {
        self.group_instance_id = Some(group_instance_id.into());
    }

    pub fn member_user_data<B: Into<Bytes>>(&mut self, user_data: B) {
        self.member_user_data = Some(user_data.into());
    }

    pub fn assignors(&mut self, assignors: Vec<PartitionAssignor>) {
        self.assignors = assignors;
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::Config("group id must not be empty".into()));
        }
        if matches!(&self.group_instance_id, Some(id) if id.is_empty()) {
            return Err(Error::Config("group instance id must not be empty".into()));
        }
        let rebalance = &self.rebalance_options;
        if rebalance.session_timeout_ms <= 0
            || rebalance.rebalance_timeout_ms <= 0
            || rebalance.heartbeat_interval_ms <= 0
        {
            return Err(Error::Config(format!(
                "timeouts must be positive, session = {}, rebalance = {}, heartbeat = {}",
                rebalance.session_timeout_ms,
                rebalance.rebalance_timeout_ms,
                rebalance.heartbeat_interval_ms
            )));
        }
        if rebalance.heartbeat_interval_ms as i64 * 3 >= rebalance.session_timeout_ms as i64 {
            return Err(Error::Config(format!(
                "heartbeat interval {}ms must be lower than 1/3 of the session timeout {}ms",
                rebalance.heartbeat_interval_ms, rebalance.session_timeout_ms
            )));
        }
        if rebalance.retry_backoff_ms < 0 || self.fetch_retry_backoff_ms < 0 {
            return Err(Error::Config("retry backoff must not be negative".into()));
        }
        if self.assignors.is_empty() {
            return Err(Error::Config("at least one partition assignor is required".into()));
        }
        let mut names = HashSet::with_capacity(self.assignors.len());
        for assignor in self.assignors.iter() {
            if !names.insert(assignor.name()) {
                return Err(Error::Config(format!(
                    "partition assignor {} is configured twice",
                    assignor.name()
                )));
            }
        }
        if self.channel_buffer_size == 0 {
            return Err(Error::Config("channel buffer size must be positive".into()));
        }
        if self.auto_commit_enabled && self.auto_commit_interval_ms <= 0 {
            return Err(Error::Config("auto commit interval must be positive".into()));
        }
        if self.fetch_max_bytes <= 0 || self.fetch_max_wait_ms < 0 {
            return Err(Error::Config(format!(
                "invalid fetch options, max bytes = {}, max wait = {}ms",
                self.fetch_max_bytes, self.fetch_max_wait_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerGroupMetadata {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: MemberId,
    pub leader: MemberId,
    pub group_instance_id: Option<String>,
    pub protocol_name: Option<String>,
    pub protocol_type: Option<String>,
}

impl ConsumerGroupMetadata {
    pub fn new(group_id: String) -> Self {
        Self {
            group_id,
            generation_id: DEFAULT_GENERATION_ID,
            member_id: MemberId::default(),
            leader: MemberId::default(),
            group_instance_id: None,
            protocol_name: None,
            protocol_type: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.member_id == self.leader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// the client is not part of a group
    UnJoined,
    /// the client has sent the join group request, but have not received response
    PreparingRebalance,
    /// the client has received join group response, but have not received assignment
    CompletingRebalance,
    /// the client has joined and is sending heartbeats
    Stable,
}

impl MemberState {
    pub fn has_not_joined_group(&self) -> bool {
        matches!(self, MemberState::UnJoined | MemberState::PreparingRebalance)
    }
}
