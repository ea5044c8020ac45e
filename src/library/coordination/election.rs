//! Leader election on top of a [`CoordinationStore`](super::CoordinationStore)
//!
//! Every participant creates an ephemeral sequential node below the election path with its identifier as
//! data. The participant owning the node with the lowest sequence number holds leadership until its
//! tenure is cancelled, after which it removes its node and enqueues again at the back.

use super::{
    join_path, node_name, ConnectionState, CoordinationError, CoordinationStoreExt, CreateMode,
    SharedCoordinationStore,
};
use crate::library::backoff::Backoff;
use async_trait::async_trait;
use futures::lock::Mutex;
use std::{
    sync::{Arc, Mutex as SyncMutex},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const NODE_PREFIX: &str = "lock-";

/// Reaction to a connection state change during a tenure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipDecision {
    /// Continue leading
    Keep,
    /// End the tenure
    Cancel,
}

/// Receiver of leadership
#[async_trait]
pub trait LeaderSelectorListener: Send + Sync + 'static {
    /// Called when leadership has been acquired. Leadership is held until this function returns.
    /// The `tenure` is cancelled when leadership should be given up.
    async fn take_leadership(&self, tenure: CancellationToken);

    /// Called for every connection state change while leading
    fn state_changed(&self, state: ConnectionState) -> LeadershipDecision {
        match state {
            ConnectionState::Suspended | ConnectionState::Lost | ConnectionState::Closed => {
                LeadershipDecision::Cancel
            }
            _ => LeadershipDecision::Keep,
        }
    }
}

/// Contender in an election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Identifier passed to [`LeaderSelector::new`]
    pub id: String,
    /// Whether the participant currently leads
    pub is_leader: bool,
}

struct SelectorInner {
    store: SharedCoordinationStore,
    path: String,
    id: String,
    listener: Arc<dyn LeaderSelectorListener>,
    closed: CancellationToken,
    tenure: SyncMutex<Option<CancellationToken>>,
}

impl SelectorInner {
    fn set_tenure(&self, tenure: Option<CancellationToken>) {
        if let Ok(mut current) = self.tenure.lock() {
            *current = tenure;
        }
    }

    fn interrupt(&self) {
        if let Ok(current) = self.tenure.lock() {
            if let Some(tenure) = current.as_ref() {
                tenure.cancel();
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.tenure
            .lock()
            .map(|tenure| tenure.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false))
            .unwrap_or(false)
    }

    async fn enqueue(&self) -> Result<String, CoordinationError> {
        self.store.create_parents(&self.path).await?;
        self.store
            .create(
                &join_path(&self.path, NODE_PREFIX),
                self.id.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await
    }

    /// Waits until the given node is the first in line. Returns false if the node vanished or the selector was closed.
    async fn await_turn(&self, node: &str) -> Result<bool, CoordinationError> {
        let name = node_name(node);
        let mut watch = self.store.watch(&self.path);
        let mut states = self.store.state_listener();

        loop {
            let children = self.store.children_if_exists(&self.path).await?;

            match children.iter().position(|child| child == name) {
                Some(0) => return Ok(true),
                Some(position) => trace!(path = %self.path, position, "Waiting for leadership"),
                None => return Ok(false),
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(false),
                _ = watch.changed() => {},
                state = states.recv() => {
                    if let Ok(ConnectionState::Closed) = state {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn lead(self: &Arc<Self>) {
        let tenure = CancellationToken::new();
        self.set_tenure(Some(tenure.clone()));

        if self.closed.is_cancelled() {
            tenure.cancel();
        }

        let monitor = {
            let inner = self.clone();
            let tenure = tenure.clone();
            let mut states = self.store.state_listener();

            tokio::spawn(async move {
                loop {
                    let state = match states.recv().await {
                        Ok(state) => state,
                        Err(broadcast::error::RecvError::Lagged(_)) => inner.store.connection_state(),
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    if inner.listener.state_changed(state) == LeadershipDecision::Cancel {
                        debug!(path = %inner.path, %state, "Cancelling tenure");
                        tenure.cancel();
                    }
                }
            })
        };

        info!(path = %self.path, id = %self.id, "Leadership acquired");
        self.listener.take_leadership(tenure.clone()).await;
        info!(path = %self.path, id = %self.id, "Leadership released");

        monitor.abort();
        tenure.cancel();
        self.set_tenure(None);
    }

    async fn participate(self: Arc<Self>) {
        let mut backoff = Backoff::jittered(Duration::from_millis(50), Duration::from_secs(5));

        while !self.closed.is_cancelled() {
            let node = match self.enqueue().await {
                Ok(node) => node,
                Err(e) => {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    debug!(path = %self.path, error = %e, ?wait, "Unable to enter election");
                    tokio::select! {
                        _ = self.closed.cancelled() => return,
                        _ = tokio::time::sleep(wait) => continue,
                    }
                }
            };

            match self.await_turn(&node).await {
                Ok(true) => {
                    backoff.reset();
                    self.lead().await;
                }
                Ok(false) => {}
                Err(e) => {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    debug!(path = %self.path, error = %e, ?wait, "Election interrupted");
                    tokio::select! {
                        _ = self.closed.cancelled() => {},
                        _ = tokio::time::sleep(wait) => {},
                    }
                }
            }

            self.release(&node, &mut backoff).await;
        }
    }

    /// Removes a node of this participant. A stale node would block the election while the session lives on.
    async fn release(&self, node: &str, backoff: &mut Backoff) {
        loop {
            match self.store.delete_if_exists(node).await {
                Ok(_) => return,
                Err(e) => {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    trace!(%node, error = %e, ?wait, "Unable to remove election node");

                    tokio::select! {
                        _ = self.closed.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {},
                    }
                }
            }
        }
    }
}

/// Participates in an election on behalf of a [`LeaderSelectorListener`]
pub struct LeaderSelector {
    inner: Arc<SelectorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderSelector {
    /// Creates a selector for the election at `path`. Participation starts with [`start`](Self::start).
    pub fn new(
        store: SharedCoordinationStore,
        path: impl Into<String>,
        id: impl Into<String>,
        listener: Arc<dyn LeaderSelectorListener>,
    ) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                store,
                path: path.into(),
                id: id.into(),
                listener,
                closed: CancellationToken::new(),
                tenure: SyncMutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Enters the election. After a tenure ends, the selector automatically enqueues again.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;

        if task.is_none() && !self.inner.closed.is_cancelled() {
            *task = Some(tokio::spawn(self.inner.clone().participate()));
        }
    }

    /// Path of the election
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether a tenure is currently active
    pub fn has_leadership(&self) -> bool {
        self.inner.is_leader()
    }

    /// Cancels the current tenure, if any. The selector enqueues again afterwards.
    pub fn interrupt_leadership(&self) {
        self.inner.interrupt();
    }

    /// Lists everybody taking part in the election, in order
    pub async fn participants(&self) -> Result<Vec<Participant>, CoordinationError> {
        let store = &self.inner.store;
        let mut participants = Vec::new();

        for child in store.children_if_exists(&self.inner.path).await? {
            let path = join_path(&self.inner.path, &child);

            if let Some(data) = store.get_data_if_exists(&path).await? {
                participants.push(Participant {
                    id: String::from_utf8_lossy(&data).into_owned(),
                    is_leader: participants.is_empty(),
                });
            }
        }

        Ok(participants)
    }

    /// Ends any tenure and stops enqueueing again, without waiting for the release
    pub fn leave(&self) {
        self.inner.closed.cancel();
        self.inner.interrupt();
    }

    /// Leaves the election, ending any tenure and waiting for it to be released
    pub async fn close(&self) {
        self.inner.closed.cancel();
        self.inner.interrupt();

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(path = %self.inner.path, error = %e, "Election task failed");
            }
        }
    }
}
