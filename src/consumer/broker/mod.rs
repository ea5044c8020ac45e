//! Client side of the broker HTTP surface

mod framing;
mod http;

#[cfg(test)]
pub(crate) mod mock;

pub use self::http::HyperBrokerClient;
pub use framing::frame_lines;

use crate::domain::{Cursor, EventType, PartitionInfo, SubscriptionCursor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use hyper::body::Bytes;
use thiserror::Error;

/// Lines of a partition stream, each containing one serialized batch
pub type BatchStream = BoxStream<'static, Result<Bytes, BrokerError>>;

/// Failure while talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport level failure
    #[error("transport failure")]
    Http(#[from] hyper::Error),
    /// Request could not be constructed
    #[error("invalid request")]
    Request(#[from] hyper::http::Error),
    /// Broker responded with a non-successful status code
    #[error("broker responded with status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, usually a problem description
        body: String,
    },
    /// Response body could not be decoded
    #[error("malformed response")]
    Decode(#[from] serde_json::Error),
    /// Broker did not respond in time
    #[error("request timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for BrokerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BrokerError::Timeout
    }
}

/// Operations the consumer requires from the broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Lists the partitions of an event type
    async fn partitions(&self, event_type: &EventType) -> Result<Vec<PartitionInfo>, BrokerError>;

    /// Opens a stream of batches for a single partition, starting after the given cursor
    async fn stream(&self, event_type: &EventType, cursor: &Cursor) -> Result<BatchStream, BrokerError>;

    /// Reads the cursors committed for a subscription
    async fn fetch_cursors(&self, subscription: &str) -> Result<Vec<SubscriptionCursor>, BrokerError>;

    /// Commits cursors for a subscription
    async fn commit_cursors(&self, subscription: &str, cursors: Vec<SubscriptionCursor>) -> Result<(), BrokerError>;
}
