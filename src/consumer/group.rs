use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use futures::{
    channel::mpsc,
    future::{select, BoxFuture, Either, RemoteHandle},
    pin_mut,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{KafkaClient, OffsetStore},
    consumer::{
        claim::{ConsumerGroupClaim, PartitionFetcher},
        coordinator::{ConsumerCoordinator, Generation, HeartbeatOutcome},
        session::{auto_commit, ConsumerGroupSession},
        ConsumerOptions,
    },
    error::{ConsumeError, Result},
    executor::Executor,
    Error, ErrorReporter, PartitionId,
};

/// User callbacks of a consumer group.
///
/// `setup` runs once a generation is established, before any claim is consumed.
/// `consume_claim` runs in its own task for every claimed partition. `cleanup` runs after
/// every `consume_claim` returned and before the final offset commit.
pub trait ConsumerGroupHandler: Send + Sync + 'static {
    fn setup(&self, _session: &ConsumerGroupSession) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self, _session: &ConsumerGroupSession) -> Result<()> {
        Ok(())
    }

    /// Must return once the claim stream ends, the first handler to return ends the
    /// session for all claims.
    fn consume_claim<'a>(
        &'a self,
        session: &'a ConsumerGroupSession,
        claim: &'a mut ConsumerGroupClaim,
    ) -> BoxFuture<'a, Result<()>>;
}

pub struct ConsumerGroup<Exe: Executor> {
    client: Arc<dyn KafkaClient>,
    offsets: Arc<dyn OffsetStore>,
    executor: Exe,
    options: Arc<ConsumerOptions>,
    coordinator: futures::lock::Mutex<ConsumerCoordinator<Exe>>,
    errors: ErrorReporter,
    error_stream: Mutex<Option<mpsc::Receiver<Error>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<Exe: Executor> ConsumerGroup<Exe> {
    /// Validates the options, no request is sent before the first [`consume`](Self::consume).
    pub fn new(
        client: Arc<dyn KafkaClient>,
        offsets: Arc<dyn OffsetStore>,
        executor: Exe,
        mut options: ConsumerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let assignors = std::mem::take(&mut options.assignors);
        let (errors, error_stream) =
            ErrorReporter::new(options.return_errors, options.channel_buffer_size);
        let options = Arc::new(options);
        let coordinator =
            ConsumerCoordinator::new(client.clone(), executor.clone(), options.clone(), assignors);
        Ok(Self {
            client,
            offsets,
            executor,
            options,
            coordinator: futures::lock::Mutex::new(coordinator),
            errors,
            error_stream: Mutex::new(error_stream),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Non-fatal errors of the group, only available once and only when `return_errors`
    /// is enabled. The stream ends when the group is closed.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.error_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn group_id(&self) -> &str {
        &self.options.group_id
    }

    /// Joins the group for `topics` and runs one session of `handler`.
    ///
    /// Returns `Ok` when the session ended because of a rebalance or a transient failure,
    /// callers are expected to call `consume` again in a loop. Returns
    /// [`Error::Closed`] once `ctx` was cancelled or the group was closed.
    pub async fn consume<S, H>(
        &self,
        ctx: &CancellationToken,
        topics: &[S],
        handler: Arc<H>,
    ) -> Result<()>
    where
        S: AsRef<str> + Sync,
        H: ConsumerGroupHandler,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let topics: HashSet<String> = topics
            .iter()
            .map(|topic| topic.as_ref().to_string())
            .filter(|topic| !topic.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(Error::Config("no topics provided".into()));
        }

        let mut coordinator = self
            .coordinator
            .try_lock()
            .ok_or(ConsumeError::ConcurrentConsume)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        coordinator.subscribe(topics);

        let joined = {
            let rebalance = coordinator.rebalance();
            let stopped = stopped(ctx, &self.shutdown);
            pin_mut!(rebalance);
            pin_mut!(stopped);
            match select(rebalance, stopped).await {
                Either::Left((result, _)) => Some(result),
                Either::Right(_) => None,
            }
        };
        let generation = match joined {
            Some(Ok(generation)) => generation,
            Some(Err(err)) if err.is_fatal() => return Err(err),
            Some(Err(err)) => {
                warn!(
                    "Consumer group [{}] failed to rebalance: {err}",
                    self.options.group_id
                );
                self.errors.report(err);
                return Ok(());
            }
            None => {
                debug!(
                    "Consumer group [{}] stopped while rebalancing",
                    self.options.group_id
                );
                coordinator.reset_generation();
                return self.exit(&mut coordinator, ctx).await;
            }
        };

        let result = self
            .run_session(&mut coordinator, ctx, generation, handler)
            .await;
        if ctx.is_cancelled() || self.shutdown.is_cancelled() {
            if let Err(err) = result {
                if !err.is_closed() {
                    self.errors.report(err);
                }
            }
            return self.exit(&mut coordinator, ctx).await;
        }
        result
    }

    async fn run_session<H: ConsumerGroupHandler>(
        &self,
        coordinator: &mut ConsumerCoordinator<Exe>,
        ctx: &CancellationToken,
        generation: Generation,
        handler: Arc<H>,
    ) -> Result<()> {
        let group_meta = coordinator.group_meta();
        let session = ConsumerGroupSession::new(
            group_meta.group_id.clone(),
            &generation,
            group_meta.group_instance_id.clone(),
            self.offsets.clone(),
        );
        let session_token = session.context();

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = coordinator.heartbeat(&generation).run(
            self.executor.clone(),
            heartbeat_stop.clone(),
            session_token.clone(),
            self.errors.clone(),
        );
        let heartbeat = self.executor.spawn_task(heartbeat)?;

        let prepared = match self.resolve_offsets(&session).await {
            Ok(offsets) => match handler.setup(&session) {
                Ok(()) => Ok(offsets),
                Err(err) => {
                    error!(
                        "Setup of consumer group [{}] failed: {err}",
                        self.options.group_id
                    );
                    if let Err(cleanup_err) = handler.cleanup(&session) {
                        warn!(
                            "Cleanup of consumer group [{}] failed: {cleanup_err}",
                            self.options.group_id
                        );
                        self.errors.report(cleanup_err);
                    }
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };
        let offsets = match prepared {
            Ok(offsets) => offsets,
            Err(err) => {
                session.cancel();
                session.release();
                heartbeat_stop.cancel();
                coordinator.apply_heartbeat(heartbeat.await)?;
                return if err.is_fatal() {
                    Err(err)
                } else {
                    self.errors.report(err);
                    Ok(())
                };
            }
        };
        info!(
            "Consumer group [{}] member {} starts generation {} with claims {:?}",
            self.options.group_id,
            session.member_id(),
            session.generation_id(),
            session.claims()
        );

        let commit_stop = CancellationToken::new();
        let committer = if self.options.auto_commit_enabled {
            let task = auto_commit(
                session.clone(),
                self.executor.clone(),
                self.options.auto_commit_interval_ms,
                commit_stop.clone(),
                self.errors.clone(),
            );
            Some(self.executor.spawn_task(task)?)
        } else {
            None
        };

        let mut fetchers: Vec<RemoteHandle<()>> = Vec::with_capacity(offsets.len());
        let mut handlers: Vec<RemoteHandle<Result<()>>> = Vec::with_capacity(offsets.len());
        for (topic, partition, offset) in offsets {
            let (fetcher, claim) = PartitionFetcher::new(
                self.client.clone(),
                self.executor.clone(),
                self.options.clone(),
                topic,
                partition,
                offset,
                self.errors.clone(),
            );
            fetchers.push(self.executor.spawn_task(fetcher.run(session_token.clone()))?);

            let handler = handler.clone();
            let session = session.clone();
            let task = async move {
                let mut claim = claim;
                let result = handler.consume_claim(&session, &mut claim).await;
                session.cancel();
                result
            };
            handlers.push(self.executor.spawn_task(task)?);
        }

        {
            let ended = session_token.cancelled();
            let stopped = stopped(ctx, &self.shutdown);
            pin_mut!(ended);
            pin_mut!(stopped);
            select(ended, stopped).await;
        }
        session.cancel();
        debug!(
            "Session of member {} generation {} is ending",
            session.member_id(),
            session.generation_id()
        );

        for fetcher in fetchers {
            fetcher.await;
        }
        for handle in handlers {
            if let Err(err) = handle.await {
                warn!("Consume claim failed: {err}");
                self.errors.report(err);
            }
        }
        let cleanup = handler.cleanup(&session);

        commit_stop.cancel();
        if let Some(committer) = committer {
            committer.await;
        }
        if let Err(err) = session.commit().await {
            if err.is_generation_lost() {
                debug!("Final commit of generation {} skipped: {err}", session.generation_id());
            } else {
                self.errors.report(err);
            }
        }
        session.release();

        heartbeat_stop.cancel();
        let outcome = heartbeat.await;
        if let HeartbeatOutcome::Failed { error, .. } = &outcome {
            if !error.is_fatal() {
                warn!(
                    "Session of member {} failed: {error}",
                    session.member_id()
                );
            }
        }
        coordinator.apply_heartbeat(outcome)?;
        cleanup
    }

    /// Committed offset of every claim, or the reset policy when nothing was committed.
    async fn resolve_offsets(
        &self,
        session: &ConsumerGroupSession,
    ) -> Result<Vec<(String, PartitionId, i64)>> {
        let mut offsets = Vec::new();
        for (topic, partitions) in session.claims() {
            for partition in partitions {
                let committed = self
                    .offsets
                    .fetch_offset(&self.options.group_id, topic, *partition)
                    .await?;
                let offset = match committed {
                    Some(committed) if committed.offset >= 0 => committed.offset,
                    _ => {
                        self.client
                            .list_offset(topic, *partition, self.options.auto_offset_reset)
                            .await?
                    }
                };
                session.init_offset(topic, *partition, offset);
                offsets.push((topic.clone(), *partition, offset));
            }
        }
        Ok(offsets)
    }

    /// Leaves the group when the caller cancelled `ctx`, a closed group leaves in `close`.
    async fn exit(
        &self,
        coordinator: &mut ConsumerCoordinator<Exe>,
        ctx: &CancellationToken,
    ) -> Result<()> {
        if ctx.is_cancelled() && !self.shutdown.is_cancelled() {
            if let Err(err) = coordinator.leave_group().await {
                warn!(
                    "Consumer group [{}] failed to leave after cancellation: {err}",
                    self.options.group_id
                );
            }
        }
        Err(Error::Closed)
    }

    /// Stops the running session, leaves the group and ends the error stream. Calling it
    /// again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing consumer group [{}]", self.options.group_id);
        self.shutdown.cancel();

        let mut coordinator = self.coordinator.lock().await;
        let result = coordinator.leave_group().await;
        self.errors.close();
        result
    }
}

async fn stopped(ctx: &CancellationToken, shutdown: &CancellationToken) {
    let ctx = ctx.cancelled();
    let shutdown = shutdown.cancelled();
    pin_mut!(ctx);
    pin_mut!(shutdown);
    select(ctx, shutdown).await;
}
