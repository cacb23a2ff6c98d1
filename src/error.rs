use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::mpsc;
use kafka_protocol::ResponseError;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Custom(String),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Consume error: {0}")]
    Consume(#[from] ConsumeError),
    #[error("Error code: {error:?}, msg: {msg:?}")]
    Response {
        error: ResponseError,
        msg: Option<String>,
    },
    /// The partition assignor broke the assignment invariant. This is a defect in the
    /// assignor, never a transient condition.
    #[error("Partition assignor {assignor} produced an invalid plan: {reason}")]
    Assignment { assignor: String, reason: String },
    #[error("Topic not available, topic: {topic}")]
    TopicNotAvailable { topic: String },
    #[error("Consumer group is closed")]
    Closed,
}

impl From<ResponseError> for Error {
    fn from(error: ResponseError) -> Self {
        Error::Response { error, msg: None }
    }
}

impl Error {
    pub fn response_error(&self) -> Option<ResponseError> {
        match self {
            Error::Response { error, .. } => Some(*error),
            Error::Consume(ConsumeError::RebalanceTimeout { source, .. }) => {
                source.response_error()
            }
            _ => None,
        }
    }

    /// The sentinel returned once the group was closed or the caller's context was cancelled.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Errors that terminate the consume loop instead of triggering another rejoin.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_) | Error::Assignment { .. } | Error::Closed => true,
            Error::Consume(ConsumeError::PartitionAssignorNotAvailable(_)) => true,
            Error::Consume(ConsumeError::RebalanceTimeout { source, .. }) => source.is_fatal(),
            Error::Response { error, .. } => matches!(
                error,
                ResponseError::GroupAuthorizationFailed
                    | ResponseError::TopicAuthorizationFailed
                    | ResponseError::InconsistentGroupProtocol
                    | ResponseError::InvalidSessionTimeout
                    | ResponseError::FencedInstanceId
                    | ResponseError::GroupMaxSizeReached
                    | ResponseError::UnsupportedVersion
            ),
            _ => false,
        }
    }

    /// Responses telling the member that its generation is no longer current.
    pub fn is_generation_lost(&self) -> bool {
        matches!(
            self.response_error(),
            Some(
                ResponseError::IllegalGeneration
                    | ResponseError::UnknownMemberId
                    | ResponseError::FencedInstanceId
                    | ResponseError::RebalanceInProgress
            )
        )
    }

    /// Responses that invalidate the cached coordinator node.
    pub fn is_coordinator_lost(&self) -> bool {
        matches!(
            self.response_error(),
            Some(
                ResponseError::NotCoordinator
                    | ResponseError::CoordinatorNotAvailable
                    | ResponseError::CoordinatorLoadInProgress
            )
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection timeout")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("PartitionAssignor: {0} not available")]
    PartitionAssignorNotAvailable(String),
    #[error("Another consume call is already running on this consumer group")]
    ConcurrentConsume,
    #[error("Rebalance did not finish within {timeout_ms}ms, last error: {source}")]
    RebalanceTimeout { timeout_ms: i32, source: Box<Error> },
}

/// Delivers non-fatal errors to the caller. When error reporting is disabled, or the
/// receiver lags behind, errors are logged and dropped.
#[derive(Clone)]
pub struct ErrorReporter {
    enabled: bool,
    sender: Arc<Mutex<Option<mpsc::Sender<Error>>>>,
}

impl ErrorReporter {
    pub fn new(enabled: bool, buffer: usize) -> (ErrorReporter, Option<mpsc::Receiver<Error>>) {
        if enabled {
            let (tx, rx) = mpsc::channel(buffer);
            let reporter = ErrorReporter {
                enabled,
                sender: Arc::new(Mutex::new(Some(tx))),
            };
            (reporter, Some(rx))
        } else {
            let reporter = ErrorReporter {
                enabled,
                sender: Arc::new(Mutex::new(None)),
            };
            (reporter, None)
        }
    }

    pub fn report(&self, error: Error) {
        if !self.enabled {
            warn!("Consumer group error: {error}");
            return;
        }
        let mut lock = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match lock.as_mut() {
            Some(sender) => {
                if let Err(err) = sender.try_send(error) {
                    if err.is_full() {
                        warn!(
                            "Error channel is full, dropping error: {}",
                            err.into_inner()
                        );
                    } else {
                        debug!("Error channel disconnected, dropping error: {}", err.into_inner());
                    }
                }
            }
            None => debug!("Error channel closed, dropping error: {error}"),
        }
    }

    pub fn close(&self) {
        let mut lock = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut sender) = lock.take() {
            sender.close_channel();
        }
    }
}
