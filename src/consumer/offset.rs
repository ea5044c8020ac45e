use super::broker::BrokerClient;
use super::OffsetError;
use crate::domain::{ConsumerKeys, Cursor, EventType, PartitionId, SubscriptionCursor};
use crate::library::coordination::{
    parent_path, CoordinationError, CoordinationStoreExt, CreateMode, SharedCoordinationStore,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Result of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Cursor has been persisted
    Committed,
    /// Cursor is older than the persisted one and has been ignored
    Stale,
}

/// Durable per-partition cursor storage of a consumer group
///
/// Commits never move a partition backwards: a cursor strictly older than the persisted one
/// is ignored and reported as [`CommitOutcome::Stale`].
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Reads the committed cursor, `None` if nothing has been committed yet
    async fn get(&self, event_type: &EventType, partition: &PartitionId) -> Result<Option<Cursor>, OffsetError>;

    /// Durably persists a cursor unless it is older than the committed one
    async fn commit(
        &self,
        event_type: &EventType,
        partition: &PartitionId,
        cursor: &Cursor,
    ) -> Result<CommitOutcome, OffsetError>;
}

/// [`OffsetStore`] keeping cursors as persistent nodes in the coordination store
///
/// Commits are compare-and-set writes against the version of the node that has been compared with, so two
/// members committing the same partition during a handover can not move it backwards.
pub struct CoordinationOffsetStore {
    store: SharedCoordinationStore,
    keys: ConsumerKeys,
}

impl CoordinationOffsetStore {
    /// Creates a new offset store below the consumer's namespace
    pub fn new(store: SharedCoordinationStore, keys: ConsumerKeys) -> Self {
        Self { store, keys }
    }

    fn decode(path: &str, data: &[u8]) -> Result<Cursor, OffsetError> {
        serde_json::from_slice(data).map_err(|source| OffsetError::Corrupt {
            path: path.to_owned(),
            source,
        })
    }
}

#[async_trait]
impl OffsetStore for CoordinationOffsetStore {
    async fn get(&self, event_type: &EventType, partition: &PartitionId) -> Result<Option<Cursor>, OffsetError> {
        let path = self.keys.offset(event_type, partition);

        match self.store.get_data_if_exists(&path).await? {
            Some(data) => Self::decode(&path, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        event_type: &EventType,
        partition: &PartitionId,
        cursor: &Cursor,
    ) -> Result<CommitOutcome, OffsetError> {
        let path = self.keys.offset(event_type, partition);
        let data = serde_json::to_vec(cursor).map_err(OffsetError::Encode)?;

        loop {
            let written = match self.store.get_versioned(&path).await {
                Ok(current) => {
                    let persisted = Self::decode(&path, &current.data)?;

                    if cursor.is_older_than(&persisted) {
                        debug!(%event_type, %cursor, current = %persisted, "Ignoring stale commit");
                        return Ok(CommitOutcome::Stale);
                    }

                    self.store.set_data_if_version(&path, &data, current.version).await
                }
                Err(CoordinationError::NoNode(_)) => {
                    if let Some(parent) = parent_path(&path) {
                        self.store.create_parents(parent).await?;
                    }

                    self.store
                        .create(&path, &data, CreateMode::Persistent)
                        .await
                        .map(|_| ())
                }
                Err(error) => return Err(error.into()),
            };

            match written {
                Ok(_) => return Ok(CommitOutcome::Committed),
                Err(CoordinationError::BadVersion(_) | CoordinationError::NodeExists(_)) => {
                    trace!(%event_type, %partition, "Concurrent commit, comparing again");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// [`OffsetStore`] using the subscription cursor endpoints of the broker
///
/// The comparison with the committed cursor only serializes the commits of this process. Commits of different
/// members racing each other are ordered by the broker, which itself refuses cursors behind the committed ones.
pub struct BrokerOffsetStore {
    broker: Arc<dyn BrokerClient>,
    subscription: String,
    commit_lock: Mutex<()>,
}

impl BrokerOffsetStore {
    /// Creates a new offset store for the given subscription (usually the consumer name)
    pub fn new(broker: Arc<dyn BrokerClient>, subscription: impl Into<String>) -> Self {
        Self {
            broker,
            subscription: subscription.into(),
            commit_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl OffsetStore for BrokerOffsetStore {
    async fn get(&self, event_type: &EventType, partition: &PartitionId) -> Result<Option<Cursor>, OffsetError> {
        let cursors = self.broker.fetch_cursors(&self.subscription).await?;

        Ok(cursors
            .into_iter()
            .find(|c| &c.event_type == event_type && &c.partition == partition)
            .map(SubscriptionCursor::into_cursor))
    }

    async fn commit(
        &self,
        event_type: &EventType,
        partition: &PartitionId,
        cursor: &Cursor,
    ) -> Result<CommitOutcome, OffsetError> {
        let _guard = self.commit_lock.lock().await;

        if let Some(current) = self.get(event_type, partition).await? {
            if cursor.is_older_than(&current) {
                debug!(%event_type, %cursor, %current, "Ignoring stale commit");
                return Ok(CommitOutcome::Stale);
            }
        }

        let item = SubscriptionCursor::new(event_type.clone(), cursor.clone());
        self.broker
            .commit_cursors(&self.subscription, vec![item])
            .await?;

        Ok(CommitOutcome::Committed)
    }
}
