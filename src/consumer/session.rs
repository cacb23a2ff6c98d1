use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{
    future::{select, Either},
    pin_mut, StreamExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{OffsetAndMetadata, OffsetCommitRequest, OffsetStore},
    consumer::{coordinator::Generation, ConsumerRecord},
    error::Result,
    executor::Executor,
    metadata::TopicPartition,
    ErrorReporter, MemberId, PartitionId,
};

#[derive(Debug, Clone)]
struct PartitionOffset {
    offset: i64,
    metadata: Option<String>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct OffsetState {
    offsets: HashMap<TopicPartition, PartitionOffset>,
    released: bool,
}

struct SessionInner {
    group_id: String,
    member_id: MemberId,
    generation_id: i32,
    group_instance_id: Option<String>,
    claims: HashMap<String, Vec<PartitionId>>,
    state: Mutex<OffsetState>,
    store: Arc<dyn OffsetStore>,
    token: CancellationToken,
}

/// One generation of group membership, shared by every claim handler of the generation.
///
/// The session ends when the group rebalances, when a handler returns, or when the
/// consume call is cancelled. Handlers observe the end through [`context`](Self::context)
/// and through their claim streams running dry.
#[derive(Clone)]
pub struct ConsumerGroupSession {
    inner: Arc<SessionInner>,
}

impl ConsumerGroupSession {
    pub(crate) fn new(
        group_id: String,
        generation: &Generation,
        group_instance_id: Option<String>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        let claims = generation
            .assignment
            .iter()
            .filter(|(_, partitions)| !partitions.is_empty())
            .map(|(topic, partitions)| {
                let mut partitions = partitions.clone();
                partitions.sort();
                (topic.clone(), partitions)
            })
            .collect();
        Self {
            inner: Arc::new(SessionInner {
                group_id,
                member_id: generation.member_id.clone(),
                generation_id: generation.generation_id,
                group_instance_id,
                claims,
                state: Mutex::new(OffsetState::default()),
                store,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Partitions owned by this member during the generation, by topic.
    pub fn claims(&self) -> &HashMap<String, Vec<PartitionId>> {
        &self.inner.claims
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn generation_id(&self) -> i32 {
        self.inner.generation_id
    }

    /// Cancelled as soon as the session starts to end.
    pub fn context(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn cancel(&self) {
        self.inner.token.cancel();
    }

    fn owns(&self, topic: &str, partition: PartitionId) -> bool {
        self.inner
            .claims
            .get(topic)
            .map(|partitions| partitions.contains(&partition))
            .unwrap_or_default()
    }

    /// Baseline for the forward-only marking, never committed by itself.
    pub(crate) fn init_offset(&self, topic: &str, partition: PartitionId, offset: i64) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .offsets
            .entry(TopicPartition::new(topic, partition))
            .or_insert(PartitionOffset {
                offset,
                metadata: None,
                dirty: false,
            });
    }

    /// Marks `offset` as the next offset to consume. Offsets only move forward, marks on
    /// partitions this member does not own, or made after the session was released, are
    /// ignored.
    pub fn mark_offset(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: i64,
        metadata: Option<&str>,
    ) {
        self.update_offset(topic, partition, offset, metadata, false);
    }

    /// Marks the record as consumed.
    pub fn mark_message(&self, record: &ConsumerRecord, metadata: Option<&str>) {
        self.mark_offset(&record.topic, record.partition, record.offset + 1, metadata);
    }

    /// Moves the offset of a partition to `offset`, also backwards.
    pub fn reset_offset(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: i64,
        metadata: Option<&str>,
    ) {
        self.update_offset(topic, partition, offset, metadata, true);
    }

    fn update_offset(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: i64,
        metadata: Option<&str>,
        allow_backwards: bool,
    ) {
        if !self.owns(topic, partition) {
            debug!(
                "Ignore offset {offset} of {topic}-{partition}, the partition is not claimed by \
                 member {}",
                self.inner.member_id
            );
            return;
        }
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.released {
            debug!("Ignore offset {offset} of {topic}-{partition}, session already released");
            return;
        }
        let entry = state
            .offsets
            .entry(TopicPartition::new(topic, partition))
            .or_insert(PartitionOffset {
                offset: i64::MIN,
                metadata: None,
                dirty: false,
            });
        if allow_backwards || offset > entry.offset {
            entry.offset = offset;
            entry.metadata = metadata.map(ToString::to_string);
            entry.dirty = true;
        }
    }

    /// Offset that would be committed next for the partition.
    pub fn marked_offset(&self, topic: &str, partition: PartitionId) -> Option<i64> {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .offsets
            .get(&TopicPartition::new(topic, partition))
            .map(|offset| offset.offset)
    }

    /// Commits marked offsets synchronously. A commit rejected because the generation
    /// moved on ends the session.
    pub async fn commit(&self) -> Result<()> {
        let offsets: HashMap<TopicPartition, OffsetAndMetadata> = {
            let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .offsets
                .iter()
                .filter(|(_, offset)| offset.dirty)
                .map(|(tp, offset)| {
                    (
                        tp.clone(),
                        OffsetAndMetadata::new(offset.offset, offset.metadata.clone()),
                    )
                })
                .collect()
        };
        if offsets.is_empty() {
            return Ok(());
        }

        let request = OffsetCommitRequest {
            group_id: self.inner.group_id.clone(),
            generation_id: self.inner.generation_id,
            member_id: self.inner.member_id.clone(),
            group_instance_id: self.inner.group_instance_id.clone(),
            offsets: offsets.clone(),
        };
        if let Err(err) = self.inner.store.commit(request).await {
            if err.is_generation_lost() {
                warn!(
                    "Commit of generation {} failed, the group moved on: {err}",
                    self.inner.generation_id
                );
                self.cancel();
            }
            return Err(err);
        }

        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (tp, committed) in offsets {
            if let Some(offset) = state.offsets.get_mut(&tp) {
                if offset.offset == committed.offset {
                    offset.dirty = false;
                }
            }
        }
        debug!(
            "Committed offsets of member {}, generation {}",
            self.inner.member_id, self.inner.generation_id
        );
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.released = true;
    }
}

/// Periodic commit of the marked offsets until `stop` fires.
pub(crate) async fn auto_commit<Exe: Executor>(
    session: ConsumerGroupSession,
    executor: Exe,
    interval_ms: i32,
    stop: CancellationToken,
    errors: ErrorReporter,
) {
    let mut interval = executor.interval(Duration::from_millis(interval_ms as u64));
    // tokio fires the first tick immediately
    interval.next().await;
    loop {
        let tick = interval.next();
        let stopped = stop.cancelled();
        pin_mut!(tick);
        pin_mut!(stopped);
        if let Either::Right(_) = select(tick, stopped).await {
            break;
        }
        if let Err(err) = session.commit().await {
            errors.report(err);
        }
    }
    debug!("Auto commit task of member {} finished.", session.member_id());
}
