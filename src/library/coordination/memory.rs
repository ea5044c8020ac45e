//! Process-local coordination ensemble
//!
//! All stores connected to the same [`MemoryEnsemble`] share one tree of nodes, thus behaving like
//! independent processes talking to the same backend. Sessions can be suspended, expired or killed
//! to reproduce connectivity problems.

use super::{
    parent_path, validate_path, ConnectionState, ConnectionStateTracker, CoordinationError, CoordinationStore,
    CreateMode, NodeEvent, NodeEventKind, Versioned, Watch,
};
use async_trait::async_trait;
use futures::lock::{Mutex, MutexGuard};
use rand::{thread_rng, Rng};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};
use tokio::sync::broadcast;
use tracing::debug;

struct Node {
    data: Vec<u8>,
    version: u64,
    owner: Option<String>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
}

impl Tree {
    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_owned() } else { format!("{}/", path) };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|name| !name.contains('/'))
            .map(str::to_owned)
            .collect()
    }

    fn remove_ephemerals(&mut self, session: &str) -> Vec<String> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned.iter() {
            self.nodes.remove(path);
        }

        owned
    }
}

struct Shared {
    tree: Mutex<Tree>,
    events: broadcast::Sender<NodeEvent>,
}

impl Shared {
    fn publish(&self, kind: NodeEventKind, path: &str) {
        self.events.send(NodeEvent::new(kind, path)).ok();
    }
}

/// Shared tree which any number of [`MemoryCoordinationStore`]s can connect to
#[derive(Clone)]
pub struct MemoryEnsemble {
    shared: Arc<Shared>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Creates an empty ensemble
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);

        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::default()),
                events,
            }),
        }
    }

    /// Opens a new session
    pub fn connect(&self) -> MemoryCoordinationStore {
        MemoryCoordinationStore {
            shared: self.shared.clone(),
            session: RwLock::new(new_session_id()),
            tracker: ConnectionStateTracker::new(ConnectionState::Connected),
        }
    }

    /// Blocks every operation on the ensemble until the returned guard is dropped, modelling a backend that
    /// stopped responding
    pub async fn freeze(&self) -> FrozenEnsemble<'_> {
        FrozenEnsemble {
            _tree: self.shared.tree.lock().await,
        }
    }

    /// Paths of every node currently in the tree
    pub async fn paths(&self) -> Vec<String> {
        self.shared.tree.lock().await.nodes.keys().cloned().collect()
    }
}

/// Guard returned by [`MemoryEnsemble::freeze`]
pub struct FrozenEnsemble<'a> {
    _tree: MutexGuard<'a, Tree>,
}

fn new_session_id() -> String {
    format!("{:016x}", thread_rng().gen::<u64>())
}

/// Session on a [`MemoryEnsemble`]
pub struct MemoryCoordinationStore {
    shared: Arc<Shared>,
    session: RwLock<String>,
    tracker: ConnectionStateTracker,
}

impl MemoryCoordinationStore {
    fn ensure_connected(&self) -> Result<(), CoordinationError> {
        if self.tracker.current().is_connected() {
            Ok(())
        } else {
            Err(CoordinationError::ConnectionLoss)
        }
    }

    async fn end_session(&self) {
        let session = self.session_id();
        let removed = self.shared.tree.lock().await.remove_ephemerals(&session);

        debug!(%session, nodes = removed.len(), "Session ended");
        for path in removed.iter() {
            self.shared.publish(NodeEventKind::Deleted, path);
        }
    }

    /// Simulates a temporary loss of connectivity. Operations fail until [`resume`](Self::resume) is called.
    pub fn suspend(&self) {
        if self.tracker.current().is_connected() {
            self.tracker.transition(ConnectionState::Suspended);
        }
    }

    /// Ends a suspension while the session is still alive
    pub fn resume(&self) {
        if self.tracker.current() == ConnectionState::Suspended {
            self.tracker.transition(ConnectionState::Reconnected);
        }
    }

    /// Expires the current session and immediately establishes a new one
    pub async fn expire_session(&self) {
        self.tracker.transition(ConnectionState::Lost);
        self.end_session().await;

        if let Ok(mut session) = self.session.write() {
            *session = new_session_id();
        }

        self.tracker.transition(ConnectionState::Reconnected);
    }

    /// Terminates the session for good, as if the owning process crashed
    pub async fn kill_session(&self) {
        self.tracker.transition(ConnectionState::Lost);
        self.end_session().await;
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    fn session_id(&self) -> String {
        self.session.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn connection_state(&self) -> ConnectionState {
        self.tracker.current()
    }

    fn state_listener(&self) -> broadcast::Receiver<ConnectionState> {
        self.tracker.subscribe()
    }

    fn watch(&self, path: &str) -> Watch {
        Watch::new(path, self.shared.events.subscribe())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError> {
        validate_path(path)?;
        self.ensure_connected()?;

        let mut tree = self.shared.tree.lock().await;

        if let Some(parent) = parent_path(path) {
            if !tree.nodes.contains_key(parent) {
                return Err(CoordinationError::NoNode(parent.to_owned()));
            }
        }

        let actual_path = if mode == CreateMode::EphemeralSequential {
            let sequence = tree.sequences.entry(path.to_owned()).or_insert(0);
            let actual_path = format!("{}{:010}", path, sequence);
            *sequence += 1;
            actual_path
        } else {
            path.to_owned()
        };

        if tree.nodes.contains_key(&actual_path) {
            return Err(CoordinationError::NodeExists(actual_path));
        }

        let owner = if mode.is_ephemeral() {
            Some(self.session_id())
        } else {
            None
        };

        tree.nodes.insert(
            actual_path.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                owner,
            },
        );
        drop(tree);

        self.shared.publish(NodeEventKind::Created, &actual_path);
        Ok(actual_path)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let mut tree = self.shared.tree.lock().await;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
        node.data = data.to_vec();
        node.version += 1;
        drop(tree);

        self.shared.publish(NodeEventKind::Changed, path);
        Ok(())
    }

    async fn set_data_if_version(&self, path: &str, data: &[u8], version: u64) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let mut tree = self.shared.tree.lock().await;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;

        if node.version != version {
            return Err(CoordinationError::BadVersion(path.to_owned()));
        }

        node.data = data.to_vec();
        node.version += 1;
        drop(tree);

        self.shared.publish(NodeEventKind::Changed, path);
        Ok(())
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, CoordinationError> {
        self.ensure_connected()?;

        self.shared
            .tree
            .lock()
            .await
            .nodes
            .get(path)
            .map(|node| Versioned {
                data: node.data.clone(),
                version: node.version,
            })
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        self.ensure_connected()?;

        self.shared
            .tree
            .lock()
            .await
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        self.ensure_connected()?;
        Ok(self.shared.tree.lock().await.nodes.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let mut tree = self.shared.tree.lock().await;

        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }

        if tree.has_children(path) {
            return Err(CoordinationError::NotEmpty(path.to_owned()));
        }

        tree.nodes.remove(path);
        drop(tree);

        self.shared.publish(NodeEventKind::Deleted, path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.ensure_connected()?;

        let tree = self.shared.tree.lock().await;

        if path != "/" && !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }

        Ok(tree.children(path))
    }

    async fn close(&self) {
        if self.tracker.current() == ConnectionState::Closed {
            return;
        }

        self.end_session().await;
        self.tracker.transition(ConnectionState::Closed);
    }
}
