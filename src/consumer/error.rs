use super::broker::BrokerError;
use crate::library::coordination::CoordinationError;
use thiserror::Error;

/// Invalid consumer configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Consumer name is empty
    #[error("consumer name must not be empty")]
    EmptyConsumerName,
    /// Not a single event type has a handler
    #[error("at least one event type handler is required")]
    NoHandlers,
    /// A name would span multiple levels in the coordination store
    #[error("name must be a non-empty single path segment: '{0}'")]
    InvalidName(String),
    /// A duration that has to be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// Handler pool can't run anything
    #[error("max_parallel_handlers must be greater than zero")]
    NoHandlerCapacity,
}

/// Failure to read or persist offsets
#[derive(Debug, Error)]
pub enum OffsetError {
    /// Coordination store operation failed
    #[error("coordination store failure")]
    Coordination(#[from] CoordinationError),
    /// Broker cursor endpoint failed
    #[error("broker failure")]
    Broker(#[from] BrokerError),
    /// Persisted value could not be decoded
    #[error("stored cursor at {path} is malformed")]
    Corrupt {
        /// Location of the malformed value
        path: String,
        /// Decoding error
        #[source]
        source: serde_json::Error,
    },
    /// Cursor could not be encoded
    #[error("unable to encode cursor")]
    Encode(#[source] serde_json::Error),
}

/// Failure of a [`Consumer`](super::Consumer) lifecycle operation
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Configuration has been rejected
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    /// Coordination store is unusable
    #[error("coordination store failure")]
    Coordination(#[from] CoordinationError),
    /// Member could not be registered within the session timeout
    #[error("unable to register member {0}, the identifier is still in use")]
    MemberIdInUse(String),
    /// Consumer has already been started
    #[error("consumer has already been started")]
    AlreadyStarted,
    /// Consumer has been stopped and can't be restarted
    #[error("consumer has been stopped")]
    Stopped,
}
