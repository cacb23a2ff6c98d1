#![allow(clippy::mutable_key_type)]

pub mod client;
pub mod consumer;

mod error;
pub use error::{ConnectionError, ConsumeError, Error, ErrorReporter, Result};
pub mod executor;
pub mod metadata;

// kafka protocol
pub use kafka_protocol::{error::ParseResponseErrorCode, ResponseError};
pub use tokio_util::sync::CancellationToken;

pub type PartitionId = i32;
pub type MemberId = String;

pub const DEFAULT_GENERATION_ID: i32 = -1;
pub const UNKNOWN_OFFSET: i64 = -1;
