use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    channel::mpsc,
    future::{select, Either},
    pin_mut, SinkExt, Stream,
};
use kafka_protocol::{error::ParseResponseErrorCode, ResponseError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{FetchRequest, KafkaClient},
    consumer::{ConsumerOptions, ConsumerRecord},
    executor::Executor,
    ErrorReporter, PartitionId, UNKNOWN_OFFSET,
};

/// Records of one claimed partition, in offset order.
///
/// The stream ends once the session is over and the records already queued were read.
pub struct ConsumerGroupClaim {
    topic: String,
    partition: PartitionId,
    initial_offset: i64,
    high_water_mark: Arc<AtomicI64>,
    records: mpsc::Receiver<ConsumerRecord>,
}

impl ConsumerGroupClaim {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Offset the claim started to consume from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Last high water mark seen by the fetcher, `-1` before the first fetch completed.
    pub fn high_water_mark_offset(&self) -> i64 {
        self.high_water_mark.load(Ordering::Acquire)
    }
}

impl Stream for ConsumerGroupClaim {
    type Item = ConsumerRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.records).poll_next(cx)
    }
}

/// Pulls records of one partition into the claim channel, pausing while the channel is
/// full.
pub(crate) struct PartitionFetcher<Exe: Executor> {
    client: Arc<dyn KafkaClient>,
    executor: Exe,
    options: Arc<ConsumerOptions>,
    topic: String,
    partition: PartitionId,
    offset: i64,
    high_water_mark: Arc<AtomicI64>,
    sender: mpsc::Sender<ConsumerRecord>,
    errors: ErrorReporter,
}

impl<Exe: Executor> PartitionFetcher<Exe> {
    pub fn new(
        client: Arc<dyn KafkaClient>,
        executor: Exe,
        options: Arc<ConsumerOptions>,
        topic: String,
        partition: PartitionId,
        offset: i64,
        errors: ErrorReporter,
    ) -> (Self, ConsumerGroupClaim) {
        let (sender, records) = mpsc::channel(options.channel_buffer_size);
        let high_water_mark = Arc::new(AtomicI64::new(UNKNOWN_OFFSET));
        let claim = ConsumerGroupClaim {
            topic: topic.clone(),
            partition,
            initial_offset: offset,
            high_water_mark: high_water_mark.clone(),
            records,
        };
        let fetcher = Self {
            client,
            executor,
            options,
            topic,
            partition,
            offset,
            high_water_mark,
            sender,
            errors,
        };
        (fetcher, claim)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let backoff = Duration::from_millis(self.options.fetch_retry_backoff_ms as u64);
        loop {
            let request = FetchRequest {
                topic: self.topic.clone(),
                partition: self.partition,
                offset: self.offset,
                max_bytes: self.options.fetch_max_bytes,
                max_wait_ms: self.options.fetch_max_wait_ms,
            };
            let result = {
                let fetch = self.client.fetch(request);
                let cancelled = cancel.cancelled();
                pin_mut!(cancelled);
                match select(fetch, cancelled).await {
                    Either::Left((result, _)) => result,
                    Either::Right(_) => break,
                }
            };

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        "Fetch {}-{} at offset {} failed: {err}",
                        self.topic, self.partition, self.offset
                    );
                    self.errors.report(err);
                    if self.pause(backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            match response.error_code.err() {
                None => {
                    self.high_water_mark
                        .store(response.high_watermark, Ordering::Release);
                    for record in response.records {
                        if record.offset < self.offset {
                            continue;
                        }
                        let next_offset = record.offset + 1;
                        let sent = {
                            let send = self.sender.send(record);
                            let cancelled = cancel.cancelled();
                            pin_mut!(cancelled);
                            match select(send, cancelled).await {
                                Either::Left((result, _)) => Some(result.is_ok()),
                                Either::Right(_) => None,
                            }
                        };
                        match sent {
                            Some(true) => self.offset = next_offset,
                            // the claim was dropped
                            Some(false) => return,
                            None => {
                                self.finish();
                                return;
                            }
                        }
                    }
                }
                Some(ResponseError::OffsetOutOfRange) => {
                    let strategy = self.options.auto_offset_reset;
                    match self
                        .client
                        .list_offset(&self.topic, self.partition, strategy)
                        .await
                    {
                        Ok(offset) => {
                            warn!(
                                "Offset {} of {}-{} is out of range, reset to {} with {:?}",
                                self.offset, self.topic, self.partition, offset, strategy
                            );
                            self.offset = offset;
                        }
                        Err(err) => {
                            self.errors.report(err);
                            if self.pause(backoff, &cancel).await {
                                break;
                            }
                        }
                    }
                }
                Some(error) => {
                    warn!(
                        "Fetch {}-{} at offset {} failed: {error}",
                        self.topic, self.partition, self.offset
                    );
                    self.errors.report(error.into());
                    if self.pause(backoff, &cancel).await {
                        break;
                    }
                }
            }
        }
        self.finish();
    }

    /// Returns true when cancelled during the pause.
    async fn pause(&self, backoff: Duration, cancel: &CancellationToken) -> bool {
        let delay = self.executor.delay(backoff);
        let cancelled = cancel.cancelled();
        pin_mut!(cancelled);
        matches!(select(delay, cancelled).await, Either::Right(_))
    }

    fn finish(&self) {
        debug!(
            "Stop fetching {}-{} at offset {}",
            self.topic, self.partition, self.offset
        );
    }
}
