//! Hierarchical coordination store with ephemeral nodes, watches and leader election
//!
//! The [`CoordinationStore`] trait describes a small ZooKeeper-like namespace. Paths are absolute,
//! `/`-separated and a node may only be created when its parent exists (use
//! [`CoordinationStoreExt::create_parents`] to build the chain). Ephemeral nodes are bound to the
//! session of the store instance that created them and vanish when that session ends.
//!
//! Sessions move through [`ConnectionState`]s. Consumers of the store are expected to drop any
//! ownership they derived from the store (leadership, partition ownership) whenever the state
//! becomes [`ConnectionState::Suspended`] or [`ConnectionState::Lost`].
//!
//! Two implementations are provided: [`memory`] for process-local ensembles (and tests) and
//! [`redis`] for an actual multi-process deployment. [`bounded`] puts a deadline on the operations of either.

mod error;

pub mod bounded;
pub mod election;
pub mod memory;
pub mod redis;

pub use error::CoordinationError;

use crate::library::codec::WireEnum;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// How a node is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Node outlives the session which created it
    Persistent,
    /// Node is removed when the creating session ends
    Ephemeral,
    /// Same as [`CreateMode::Ephemeral`] but a monotonically increasing, zero-padded sequence number is appended to the name
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the node is bound to the creating session
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// State of the session between a store instance and its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session has been established for the first time
    Connected,
    /// Backend is temporarily unreachable, the session may still be alive
    Suspended,
    /// Connection has been re-established and a session is available again
    Reconnected,
    /// Session has ended, all of its ephemeral nodes are gone
    Lost,
    /// Store has been closed deliberately
    Closed,
}

impl ConnectionState {
    /// Whether operations may currently assume a live session
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

impl WireEnum for ConnectionState {
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("connected", ConnectionState::Connected),
        ("suspended", ConnectionState::Suspended),
        ("reconnected", ConnectionState::Reconnected),
        ("lost", ConnectionState::Lost),
        ("closed", ConnectionState::Closed),
    ];
}

crate::wire_enum!(ConnectionState);

/// Kind of modification observed by a [`Watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    /// Node has been created
    Created,
    /// Data of the node has been replaced
    Changed,
    /// Node has been removed
    Deleted,
    /// Watch missed events and observers should re-read everything
    Resync,
}

/// Modification of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// What happened to the node
    pub kind: NodeEventKind,
    /// Absolute path of the affected node
    pub path: String,
}

impl NodeEvent {
    /// Creates a new event from raw parts
    pub fn new(kind: NodeEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Subscription to modifications of a node and all of its descendants
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<NodeEvent>,
}

impl Watch {
    /// Creates a new watch filtering the given event stream
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<NodeEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    fn matches(&self, path: &str) -> bool {
        self.prefix == "/"
            || path == self.prefix
            || (path.starts_with(&self.prefix) && path[self.prefix.len()..].starts_with('/'))
    }

    /// Waits for the next relevant modification. Returns `None` once the store has been dropped.
    pub async fn changed(&mut self) -> Option<NodeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind == NodeEventKind::Resync || self.matches(&event.path) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some(NodeEvent::new(NodeEventKind::Resync, self.prefix.clone()))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Distributes [`ConnectionState`] transitions to interested parties
///
/// Keeps the latest state for synchronous access and broadcasts every transition so
/// that short-lived states (e.g. a suspension followed by a reconnect) are not missed.
pub struct ConnectionStateTracker {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ConnectionStateTracker {
    /// Creates a tracker in the given initial state
    pub fn new(initial: ConnectionState) -> Self {
        let (current, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(64);

        Self {
            current,
            transitions,
        }
    }

    /// Latest known state
    pub fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    /// Moves to a new state, ignoring no-op transitions
    pub fn transition(&self, state: ConnectionState) {
        if self.current() == state {
            return;
        }

        self.current.send_replace(state);
        self.transitions.send(state).ok();
    }

    /// Subscribes to all future transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }
}

/// Data of a node and the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw node data
    pub data: Vec<u8>,
    /// Number of writes since the node has been created
    pub version: u64,
}

/// Hierarchical key-value store with ephemeral nodes and watches
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Identifier of the session currently held by this instance
    fn session_id(&self) -> String;

    /// Latest known connection state
    fn connection_state(&self) -> ConnectionState;

    /// Subscribes to connection state transitions
    fn state_listener(&self) -> broadcast::Receiver<ConnectionState>;

    /// Subscribes to modifications of the node at `path` and its descendants
    fn watch(&self, path: &str) -> Watch;

    /// Creates a node and returns its actual path (which differs for sequential nodes)
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError>;

    /// Replaces the data of an existing node
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    /// Reads the data of an existing node
    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError>;

    /// Reads the data of an existing node together with its version
    ///
    /// A node starts at version zero and every write increments it.
    async fn get_versioned(&self, path: &str) -> Result<Versioned, CoordinationError>;

    /// Replaces the data of a node only if it is still at `version`, fails with
    /// [`CoordinationError::BadVersion`] otherwise
    async fn set_data_if_version(&self, path: &str, data: &[u8], version: u64) -> Result<(), CoordinationError>;

    /// Checks whether a node exists
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Removes a node which has no children
    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Lists the names (not paths) of all direct children, sorted
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Ends the session, removing all of its ephemeral nodes
    async fn close(&self);
}

/// Convenience functions built on top of the [`CoordinationStore`] primitives
#[async_trait]
pub trait CoordinationStoreExt: CoordinationStore {
    /// Creates every missing persistent node along the path, including the node itself
    async fn create_parents(&self, path: &str) -> Result<(), CoordinationError> {
        let mut current = String::new();

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);

            match self.create(&current, &[], CreateMode::Persistent).await {
                Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Replaces the data of a persistent node, creating it (and its parents) if it does not exist yet
    async fn set_or_create(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        match self.set_data(path, data).await {
            Err(CoordinationError::NoNode(_)) => {}
            other => return other,
        }

        if let Some(parent) = parent_path(path) {
            self.create_parents(parent).await?;
        }

        match self.create(path, data, CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            // Somebody else created it in the meantime, overwrite once
            Err(CoordinationError::NodeExists(_)) => self.set_data(path, data).await,
            Err(e) => Err(e),
        }
    }

    /// Reads a node, mapping a missing node to `None`
    async fn get_data_if_exists(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        match self.get_data(path).await {
            Ok(data) => Ok(Some(data)),
            Err(CoordinationError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lists children, mapping a missing node to an empty list
    async fn children_if_exists(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        match self.children(path).await {
            Ok(children) => Ok(children),
            Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Removes a node, ignoring a missing one
    async fn delete_if_exists(&self, path: &str) -> Result<(), CoordinationError> {
        match self.delete(path).await {
            Ok(_) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes a node and all of its descendants
    async fn delete_recursive(&self, path: &str) -> Result<(), CoordinationError> {
        for child in self.children_if_exists(path).await? {
            self.delete_recursive(&join_path(path, &child)).await?;
        }

        self.delete_if_exists(path).await
    }
}

impl<S: CoordinationStore + ?Sized> CoordinationStoreExt for S {}

/// Shared, dynamically dispatched store
pub type SharedCoordinationStore = Arc<dyn CoordinationStore>;

/// Returns the parent of an absolute path or `None` for the root and top-level nodes
pub fn parent_path(path: &str) -> Option<&str> {
    let index = path.rfind('/')?;

    if index == 0 {
        None
    } else {
        Some(&path[..index])
    }
}

/// Name of the last path segment
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Appends a child name to a path
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Validates that a path is absolute, has no empty segments and no trailing slash
pub fn validate_path(path: &str) -> Result<(), CoordinationError> {
    let valid = path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//");

    if valid {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPath(path.to_owned()))
    }
}
