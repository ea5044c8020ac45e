//! Consumption of a single partition
//!
//! A [`PartitionWorker`] resumes a partition at its committed cursor, streams batches from the broker, hands them
//! to the [`EventDispatcher`] one at a time and commits the cursor of every handled batch.
//!
//! ```text
//! Init ─▶ Opening ─▶ Streaming ─┬─▶ Draining ─┬─▶ Closed
//!            ▲           │      │             │
//!            └───────────┘      └─▶ Failed ───┘
//! ```
//!
//! Broken streams are reopened at the last committed cursor after a jittered backoff. Handler failures follow the
//! configured [`HandlerErrorPolicy`].

mod registry;

pub use registry::WorkerRegistry;

use super::{
    broker::{BatchStream, BrokerClient},
    CommitOutcome, DispatchError, Dispatched, ErrorSink, EventDispatcher, OffsetStore,
};
use crate::domain::{ConsumerKeys, Cursor, EventType, HandlerErrorPolicy, MemberId, PartitionKey};
use crate::library::{
    backoff::Backoff,
    codec::WireEnum,
    coordination::{parent_path, CoordinationError, CoordinationStore, CoordinationStoreExt, CreateMode},
    BoxedError,
};
use futures::StreamExt;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle state of a [`PartitionWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created but not yet running
    Init,
    /// Looking up the committed cursor and connecting to the broker
    Opening,
    /// Receiving batches
    Streaming,
    /// Finishing up after ownership has been given up
    Draining,
    /// Stopped consuming because of a batch that could not be processed
    Failed,
    /// Done, the final cursor has been committed
    Closed,
}

impl WireEnum for WorkerState {
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("init", WorkerState::Init),
        ("opening", WorkerState::Opening),
        ("streaming", WorkerState::Streaming),
        ("draining", WorkerState::Draining),
        ("failed", WorkerState::Failed),
        ("closed", WorkerState::Closed),
    ];
}

crate::wire_enum!(WorkerState);

/// Everything a worker needs besides its partition
///
/// Offset and coordination stores are only referenced weakly, workers never keep them alive.
#[derive(Clone)]
pub struct WorkerContext {
    /// Committed cursors
    pub offsets: Weak<dyn OffsetStore>,
    /// Store in which failure markers are written
    pub store: Weak<dyn CoordinationStore>,
    /// Source of the batches
    pub broker: Arc<dyn BrokerClient>,
    /// Invokes the user handlers
    pub dispatcher: Arc<EventDispatcher>,
    /// Receives undeliverable batches
    pub error_sink: Arc<dyn ErrorSink>,
    /// Reaction to undeliverable batches
    pub policy: HandlerErrorPolicy,
    /// Layout of the consumer group
    pub keys: ConsumerKeys,
    /// This member
    pub member: MemberId,
    /// Notified with the event type whenever a worker fails
    pub failures: mpsc::UnboundedSender<EventType>,
}

/// Handle of a running [`PartitionWorker`]
pub struct WorkerControl {
    key: PartitionKey,
    state: watch::Receiver<WorkerState>,
    drain: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerControl {
    /// Partition consumed by the worker
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Asks the worker to finish its current batch, commit and close
    pub fn drain(&self) {
        self.drain.cancel();
    }

    /// Waits for the worker to close. Aborts it and returns false if it does not close in time.
    pub async fn closed(self, grace_period: Duration) -> bool {
        let mut state = self.state.clone();

        let closed = timeout(grace_period, async {
            loop {
                if *state.borrow() == WorkerState::Closed {
                    return true;
                }

                if state.changed().await.is_err() {
                    return *state.borrow() == WorkerState::Closed;
                }
            }
        })
        .await
        .unwrap_or(false);

        if !closed {
            warn!(partition = %self.key, state = %self.state(), "Worker did not drain in time, aborting");
            self.handle.abort();
        }

        closed
    }
}

enum Exit {
    Drained,
    Failed,
}

enum Flow {
    Continue,
    Reopen,
    Exit(Exit),
}

/// Consumes one partition until it is drained or fails
pub struct PartitionWorker {
    key: PartitionKey,
    ctx: WorkerContext,
    state: watch::Sender<WorkerState>,
    drain: CancellationToken,
    pending: Option<Cursor>,
}

impl PartitionWorker {
    /// Starts consuming a partition in the background
    pub fn spawn(key: PartitionKey, ctx: WorkerContext) -> WorkerControl {
        let (state, rx) = watch::channel(WorkerState::Init);
        let drain = CancellationToken::new();
        let span = info_span!("worker", partition = %key);

        let worker = PartitionWorker {
            key: key.clone(),
            ctx,
            state,
            drain: drain.clone(),
            pending: None,
        };

        let handle = tokio::spawn(worker.run().instrument(span));

        WorkerControl {
            key,
            state: rx,
            drain,
            handle,
        }
    }

    fn transition(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);

        if previous != state {
            debug!(from = %previous, to = %state, "Worker state changed");
        }
    }

    async fn run(mut self) {
        match self.consume().await {
            Exit::Drained => {
                self.transition(WorkerState::Draining);
                self.flush().await;
            }
            Exit::Failed => {
                self.transition(WorkerState::Failed);
                self.mark_failed().await;
                self.drain.cancelled().await;
            }
        }

        self.ctx.dispatcher.release(&self.key);
        self.transition(WorkerState::Closed);
        info!("Worker closed");
    }

    async fn consume(&mut self) -> Exit {
        let mut backoff = Backoff::jittered(Duration::from_millis(100), Duration::from_secs(10));

        loop {
            if self.drain.is_cancelled() {
                return Exit::Drained;
            }

            self.transition(WorkerState::Opening);

            match self.open().await {
                Ok(Some(stream)) => {
                    self.transition(WorkerState::Streaming);

                    if let Some(exit) = self.stream(stream, &mut backoff).await {
                        return exit;
                    }
                }
                Ok(None) => return Exit::Drained,
                Err(error) => warn!(%error, "Unable to open partition stream"),
            }

            let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(10));
            debug!(?wait, "Reconnecting after backoff");

            tokio::select! {
                _ = self.drain.cancelled() => return Exit::Drained,
                _ = sleep(wait) => {}
            }
        }
    }

    /// Opens a stream at the committed cursor. Returns `None` if the worker should stop instead.
    async fn open(&mut self) -> Result<Option<BatchStream>, BoxedError> {
        self.flush().await;

        let offsets = match self.ctx.offsets.upgrade() {
            Some(offsets) => offsets,
            None => return Ok(None),
        };

        let committed = tokio::select! {
            _ = self.drain.cancelled() => return Ok(None),
            committed = offsets.get(&self.key.event_type, &self.key.partition) => committed?,
        };

        let cursor = committed.unwrap_or_else(|| Cursor::begin(self.key.partition.clone()));
        info!(%cursor, "Opening partition stream");

        tokio::select! {
            _ = self.drain.cancelled() => Ok(None),
            stream = self.ctx.broker.stream(&self.key.event_type, &cursor) => Ok(Some(stream?)),
        }
    }

    /// Processes batches until the stream ends. Returns `Some` if the worker should exit.
    async fn stream(&mut self, mut stream: BatchStream, backoff: &mut Backoff) -> Option<Exit> {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.drain.cancelled() => return Some(Exit::Drained),
                line = stream.next() => line,
            };

            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(error)) => {
                    warn!(%error, "Partition stream broke");
                    return None;
                }
                None => {
                    info!("Partition stream closed by broker");
                    return None;
                }
            };

            backoff.reset();

            match self.ctx.dispatcher.dispatch(&self.key, &line).await {
                Ok(Dispatched::Events { cursor, count }) => {
                    trace!(%cursor, count, "Batch handled");
                    self.commit(cursor).await;
                }
                Ok(Dispatched::KeepAlive { .. }) => self.flush().await,
                Err(error) => match self.handle_failure(error).await {
                    Flow::Continue => {}
                    Flow::Reopen => return None,
                    Flow::Exit(exit) => return Some(exit),
                },
            }
        }
    }

    /// Reports an undeliverable batch and applies the error policy
    async fn handle_failure(&mut self, error: DispatchError) -> Flow {
        self.ctx.error_sink.report(&self.key, &error);

        match self.ctx.policy {
            HandlerErrorPolicy::Skip => {
                if let Some(cursor) = error.cursor() {
                    debug!(%cursor, "Skipping batch");
                    self.commit(cursor.clone()).await;
                }

                Flow::Continue
            }
            HandlerErrorPolicy::Retry => Flow::Reopen,
            HandlerErrorPolicy::Fail => {
                error!(%error, "Giving up partition");
                Flow::Exit(Exit::Failed)
            }
        }
    }

    async fn commit(&mut self, cursor: Cursor) {
        self.pending = Some(cursor);
        self.flush().await;
    }

    /// Commits the pending cursor, keeping it for later if the commit fails
    async fn flush(&mut self) {
        let cursor = match self.pending.take() {
            Some(cursor) => cursor,
            None => return,
        };

        let offsets = match self.ctx.offsets.upgrade() {
            Some(offsets) => offsets,
            None => {
                warn!(%cursor, "Offset store is gone, dropping commit");
                return;
            }
        };

        match offsets.commit(&self.key.event_type, &self.key.partition, &cursor).await {
            Ok(CommitOutcome::Committed) => trace!(%cursor, "Committed"),
            Ok(CommitOutcome::Stale) => debug!(%cursor, "Commit is older than the stored cursor"),
            Err(error) => {
                warn!(%cursor, %error, "Commit failed, retrying later");
                self.pending = Some(cursor);
            }
        }
    }

    async fn mark_failed(&self) {
        let path = self
            .ctx
            .keys
            .failure(&self.key.event_type, &self.key.partition, &self.ctx.member);

        if let Some(store) = self.ctx.store.upgrade() {
            match write_marker(store.as_ref(), &path).await {
                Ok(true) => warn!(
                    member = %self.ctx.member,
                    "Partition failed, it will not be assigned to this member again until its session ends. \
                     Without other members it stays unassigned until this member restarts"
                ),
                Ok(false) => {}
                Err(error) => warn!(%path, %error, "Unable to record failure marker"),
            }
        }

        self.ctx.failures.send(self.key.event_type.clone()).ok();
    }
}

/// Records an ephemeral failure marker. Returns false if the marker already existed.
async fn write_marker(store: &dyn CoordinationStore, path: &str) -> Result<bool, CoordinationError> {
    if let Some(parent) = parent_path(path) {
        store.create_parents(parent).await?;
    }

    match store.create(path, &[], CreateMode::Ephemeral).await {
        Ok(_) => Ok(true),
        Err(CoordinationError::NodeExists(_)) => Ok(false),
        Err(error) => Err(error),
    }
}
