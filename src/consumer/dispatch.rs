use crate::domain::{Batch, Cursor, EventType, PartitionId, PartitionKey};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Future;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{trace, warn};

/// Information about the batch passed to a [`BatchHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    /// Event type the batch belongs to
    pub event_type: EventType,
    /// Partition the batch belongs to
    pub partition: PartitionId,
    /// Cursor that is committed once the handler succeeds
    pub cursor: Cursor,
}

/// User code processing the events of a batch
///
/// Returning an error prevents the batch cursor from being committed and triggers the configured
/// [`HandlerErrorPolicy`](crate::domain::HandlerErrorPolicy).
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Processes the events of one batch, in broker order
    async fn handle(&self, context: BatchContext, events: Vec<Value>) -> EmptyResult;
}

/// [`BatchHandler`] backed by a closure, created by [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a closure returning a future into a [`BatchHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(BatchContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = EmptyResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> BatchHandler for FnHandler<F>
where
    F: Fn(BatchContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = EmptyResult> + Send,
{
    async fn handle(&self, context: BatchContext, events: Vec<Value>) -> EmptyResult {
        (self.f)(context, events).await
    }
}

/// Failure to deliver a batch
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Line received from the broker is not a valid batch
    #[error("malformed batch")]
    Decode(#[source] serde_json::Error),
    /// Batch belongs to a different partition than the stream it arrived on
    #[error("batch for partition {found} arrived on the stream of partition {expected}")]
    PartitionMismatch {
        /// Partition of the stream
        expected: PartitionId,
        /// Partition named by the batch cursor
        found: PartitionId,
    },
    /// Event type has no handler
    #[error("no handler registered for event type {0}")]
    NoHandler(EventType),
    /// User handler returned an error
    #[error("handler failed to process batch at {cursor}")]
    Handler {
        /// Cursor of the failed batch
        cursor: Cursor,
        /// Error returned by the handler
        #[source]
        source: BoxedError,
    },
}

impl DispatchError {
    /// Cursor of the affected batch, if it could be decoded
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            DispatchError::Handler { cursor, .. } => Some(cursor),
            _ => None,
        }
    }
}

/// Receiver of batches that could not be delivered
pub trait ErrorSink: Send + Sync {
    /// Called once per failed batch, before the error policy is applied
    fn report(&self, key: &PartitionKey, error: &DispatchError);
}

/// [`ErrorSink`] which logs every failure at `WARN`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, key: &PartitionKey, error: &DispatchError) {
        match std::error::Error::source(error) {
            Some(source) => warn!(partition = %key, %error, %source, "Unable to process batch"),
            None => warn!(partition = %key, %error, "Unable to process batch"),
        }
    }
}

/// Result of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Events have been handled and the cursor may be committed
    Events {
        /// Cursor to commit
        cursor: Cursor,
        /// Number of handled events
        count: usize,
    },
    /// Batch carried no events
    KeepAlive {
        /// Current position reported by the broker
        cursor: Cursor,
    },
}

/// Decodes batches and invokes the user handlers
///
/// Handlers of one partition never run concurrently. Across partitions, at most
/// `max_parallel_handlers` run at the same time.
pub struct EventDispatcher {
    handlers: HashMap<EventType, Arc<dyn BatchHandler>>,
    pool: Semaphore,
    lanes: DashMap<PartitionKey, Arc<Mutex<()>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher for the given handlers
    pub fn new(handlers: HashMap<EventType, Arc<dyn BatchHandler>>, max_parallel_handlers: usize) -> Self {
        Self {
            handlers,
            pool: Semaphore::new(max_parallel_handlers.max(1)),
            lanes: DashMap::new(),
        }
    }

    fn lane(&self, key: &PartitionKey) -> Arc<Mutex<()>> {
        self.lanes.entry(key.clone()).or_default().value().clone()
    }

    /// Decodes a raw line and hands its events to the handler of the partition's event type
    pub async fn dispatch(&self, key: &PartitionKey, raw: &[u8]) -> Result<Dispatched, DispatchError> {
        let batch = Batch::from_line(raw).map_err(DispatchError::Decode)?;

        if batch.cursor.partition != key.partition {
            return Err(DispatchError::PartitionMismatch {
                expected: key.partition.clone(),
                found: batch.cursor.partition,
            });
        }

        if batch.is_keep_alive() {
            trace!(partition = %key, cursor = %batch.cursor, "Keep-alive");
            return Ok(Dispatched::KeepAlive {
                cursor: batch.cursor,
            });
        }

        let handler = self
            .handlers
            .get(&key.event_type)
            .ok_or_else(|| DispatchError::NoHandler(key.event_type.clone()))?;

        let events = batch.events.unwrap_or_default();
        let count = events.len();
        let cursor = batch.cursor;
        let context = BatchContext {
            event_type: key.event_type.clone(),
            partition: key.partition.clone(),
            cursor: cursor.clone(),
        };

        let lane = self.lane(key);
        let _lane = lane.lock().await;
        let _permit = self.pool.acquire().await;

        handler
            .handle(context, events)
            .await
            .map_err(|source| DispatchError::Handler {
                cursor: cursor.clone(),
                source,
            })?;

        Ok(Dispatched::Events { cursor, count })
    }

    /// Forgets the sequencing state of a partition
    pub fn release(&self, key: &PartitionKey) {
        self.lanes.remove(key);
    }
}
