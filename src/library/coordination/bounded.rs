//! Operation deadlines for any [`CoordinationStore`]

use super::{
    ConnectionState, CoordinationError, CoordinationStore, CreateMode, SharedCoordinationStore, Versioned, Watch,
};
use async_trait::async_trait;
use futures::Future;
use std::time::Duration;
use tokio::{sync::broadcast, time::timeout};
use tracing::warn;

/// Wraps a store so that no operation takes longer than the operation timeout
///
/// Operations exceeding the deadline fail with [`CoordinationError::Timeout`]. Their effect on the backend is
/// unknown to the caller, thus writes that timed out have to be verified or repeated.
pub struct BoundedCoordinationStore {
    inner: SharedCoordinationStore,
    operation_timeout: Duration,
}

impl BoundedCoordinationStore {
    /// Applies `operation_timeout` to every operation of `inner`
    pub fn new(inner: SharedCoordinationStore, operation_timeout: Duration) -> Self {
        Self {
            inner,
            operation_timeout,
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, CoordinationError>
    where
        F: Future<Output = Result<T, CoordinationError>>,
    {
        timeout(self.operation_timeout, operation).await?
    }
}

#[async_trait]
impl CoordinationStore for BoundedCoordinationStore {
    fn session_id(&self) -> String {
        self.inner.session_id()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    fn state_listener(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_listener()
    }

    fn watch(&self, path: &str) -> Watch {
        self.inner.watch(path)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError> {
        self.bounded(self.inner.create(path, data, mode)).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        self.bounded(self.inner.set_data(path, data)).await
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        self.bounded(self.inner.get_data(path)).await
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, CoordinationError> {
        self.bounded(self.inner.get_versioned(path)).await
    }

    async fn set_data_if_version(&self, path: &str, data: &[u8], version: u64) -> Result<(), CoordinationError> {
        self.bounded(self.inner.set_data_if_version(path, data, version)).await
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        self.bounded(self.inner.exists(path)).await
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        self.bounded(self.inner.delete(path)).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.bounded(self.inner.children(path)).await
    }

    async fn close(&self) {
        if timeout(self.operation_timeout, self.inner.close()).await.is_err() {
            warn!(timeout = ?self.operation_timeout, "Closing the coordination session timed out");
        }
    }
}
