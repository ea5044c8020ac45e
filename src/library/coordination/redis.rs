//! Redis backed coordination store
//!
//! Every node is a hash at `{namespace}:node:{path}` holding its data and the owning session (empty for
//! persistent nodes). Child names are tracked in a set at `{namespace}:children:{path}`. Structural
//! modifications are done by Lua scripts so that the parent/child invariants hold across processes.
//!
//! A session is a key with a TTL of `session_timeout` that is refreshed by a keepalive task. Nodes created
//! ephemerally are recorded in `{namespace}:ephemerals:{session}`. Every store periodically reaps sessions
//! whose key has expired, deleting their ephemeral nodes. Modifications are announced on the
//! `{namespace}:changes` channel with a `<kind> <path>` payload.

use super::{
    parent_path, validate_path, ConnectionState, ConnectionStateTracker, CoordinationError, CoordinationStore,
    CreateMode, NodeEvent, NodeEventKind, Versioned, Watch,
};
use crate::library::backoff::Backoff;
use async_trait::async_trait;
use futures::{Future, StreamExt};
use lazy_static::lazy_static;
use rand::{thread_rng, Rng};
use redis::{aio::MultiplexedConnection, Client, RedisResult, Script};
use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

lazy_static! {
    static ref CREATE_SCRIPT: Script = Script::new(
        r"
        -- KEYS: node, parent node, parent children, session ephemerals
        -- ARGV: data, owner, name, check parent, channel, path
        if ARGV[4] == '1' and redis.call('EXISTS', KEYS[2]) == 0 then return -1 end
        if redis.call('EXISTS', KEYS[1]) == 1 then return -2 end
        redis.call('HSET', KEYS[1], 'data', ARGV[1], 'owner', ARGV[2], 'version', 0)
        redis.call('SADD', KEYS[3], ARGV[3])
        if ARGV[2] ~= '' then redis.call('SADD', KEYS[4], ARGV[6]) end
        redis.call('PUBLISH', ARGV[5], 'created ' .. ARGV[6])
        return 0
        "
    );
    static ref SET_SCRIPT: Script = Script::new(
        r"
        -- KEYS: node
        -- ARGV: data, channel, path
        if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
        redis.call('HSET', KEYS[1], 'data', ARGV[1])
        redis.call('HINCRBY', KEYS[1], 'version', 1)
        redis.call('PUBLISH', ARGV[2], 'changed ' .. ARGV[3])
        return 0
        "
    );
    static ref SET_IF_VERSION_SCRIPT: Script = Script::new(
        r"
        -- KEYS: node
        -- ARGV: data, expected version, channel, path
        if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
        local version = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
        if version ~= tonumber(ARGV[2]) then return -4 end
        redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', version + 1)
        redis.call('PUBLISH', ARGV[3], 'changed ' .. ARGV[4])
        return 0
        "
    );
    static ref DELETE_SCRIPT: Script = Script::new(
        r"
        -- KEYS: node, own children, parent children
        -- ARGV: name, namespace, channel, path
        if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
        if redis.call('SCARD', KEYS[2]) > 0 then return -3 end
        local owner = redis.call('HGET', KEYS[1], 'owner')
        if owner and owner ~= '' then redis.call('SREM', ARGV[2] .. ':ephemerals:' .. owner, ARGV[4]) end
        redis.call('DEL', KEYS[1], KEYS[2])
        redis.call('SREM', KEYS[3], ARGV[1])
        redis.call('PUBLISH', ARGV[3], 'deleted ' .. ARGV[4])
        return 0
        "
    );
    static ref REAP_SCRIPT: Script = Script::new(
        r"
        -- KEYS: session registry, session ephemerals, session
        -- ARGV: session id, namespace, channel
        if redis.call('EXISTS', KEYS[3]) == 1 then return -2 end
        local paths = redis.call('SMEMBERS', KEYS[2])
        for _, path in ipairs(paths) do
            redis.call('DEL', ARGV[2] .. ':node:' .. path)
            local index = string.find(path, '/[^/]*$')
            local parent = string.sub(path, 1, index - 1)
            if parent == '' then parent = '/' end
            redis.call('SREM', ARGV[2] .. ':children:' .. parent, string.sub(path, index + 1))
            redis.call('PUBLISH', ARGV[3], 'deleted ' .. path)
        end
        redis.call('DEL', KEYS[2])
        redis.call('SREM', KEYS[1], ARGV[1])
        return #paths
        "
    );
}

const STATUS_NO_NODE: i64 = -1;
const STATUS_EXISTS: i64 = -2;
const STATUS_NOT_EMPTY: i64 = -3;
const STATUS_BAD_VERSION: i64 = -4;

/// Timing parameters of a [`RedisCoordinationStore`]
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Prefix for every key and channel
    pub namespace: String,
    /// Time without a successful keepalive after which a session and its ephemeral nodes are gone
    pub session_timeout: Duration,
    /// Upper bound for every individual operation
    pub operation_timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            namespace: "cohort".to_owned(),
            session_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

struct Keys {
    namespace: String,
}

impl Keys {
    fn node(&self, path: &str) -> String {
        format!("{}:node:{}", self.namespace, path)
    }

    fn children(&self, path: &str) -> String {
        format!("{}:children:{}", self.namespace, path)
    }

    fn sequence(&self, path: &str) -> String {
        format!("{}:sequence:{}", self.namespace, path)
    }

    fn session(&self, id: &str) -> String {
        format!("{}:session:{}", self.namespace, id)
    }

    fn sessions(&self) -> String {
        format!("{}:sessions", self.namespace)
    }

    fn ephemerals(&self, session: &str) -> String {
        format!("{}:ephemerals:{}", self.namespace, session)
    }

    fn channel(&self) -> String {
        format!("{}:changes", self.namespace)
    }
}

fn parse_event(payload: &str) -> Option<NodeEvent> {
    let (kind, path) = payload.split_once(' ')?;

    let kind = match kind {
        "created" => NodeEventKind::Created,
        "changed" => NodeEventKind::Changed,
        "deleted" => NodeEventKind::Deleted,
        _ => return None,
    };

    Some(NodeEvent::new(kind, path))
}

fn status_to_result(status: i64, path: &str) -> Result<(), CoordinationError> {
    match status {
        STATUS_NO_NODE => Err(CoordinationError::NoNode(path.to_owned())),
        STATUS_EXISTS => Err(CoordinationError::NodeExists(path.to_owned())),
        STATUS_NOT_EMPTY => Err(CoordinationError::NotEmpty(path.to_owned())),
        STATUS_BAD_VERSION => Err(CoordinationError::BadVersion(path.to_owned())),
        _ => Ok(()),
    }
}

fn new_session_id() -> String {
    format!("{:016x}", thread_rng().gen::<u64>())
}

struct Inner {
    keys: Keys,
    options: RedisStoreOptions,
    connection: MultiplexedConnection,
    session: RwLock<String>,
    tracker: ConnectionStateTracker,
    events: broadcast::Sender<NodeEvent>,
}

impl Inner {
    fn session_id(&self) -> String {
        self.session.read().map(|s| s.clone()).unwrap_or_default()
    }

    async fn bounded<T, F>(&self, future: F) -> Result<T, CoordinationError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let result = match timeout(self.options.operation_timeout, future).await {
            Ok(result) => result.map_err(CoordinationError::from),
            Err(elapsed) => Err(elapsed.into()),
        };

        if let Err(CoordinationError::ConnectionLoss | CoordinationError::Timeout) = result {
            if self.tracker.current().is_connected() {
                debug!("Operation failed, suspending session until the next keepalive");
                self.tracker.transition(ConnectionState::Suspended);
            }
        }

        result
    }

    async fn open_session(&self, id: &str) -> Result<(), CoordinationError> {
        let mut con = self.connection.clone();
        let ttl = self.options.session_timeout.as_millis() as u64;

        self.bounded(
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(self.keys.session(id))
                .arg(1)
                .arg("PX")
                .arg(ttl)
                .ignore()
                .cmd("SADD")
                .arg(self.keys.sessions())
                .arg(id)
                .ignore()
                .query_async::<_, ()>(&mut con),
        )
        .await
    }

    /// Refreshes the session TTL, returns false if the session no longer exists
    async fn refresh_session(&self, id: &str) -> Result<bool, CoordinationError> {
        let mut con = self.connection.clone();
        let ttl = self.options.session_timeout.as_millis() as u64;

        let refreshed: i64 = self
            .bounded(
                redis::cmd("PEXPIRE")
                    .arg(self.keys.session(id))
                    .arg(ttl)
                    .query_async(&mut con),
            )
            .await?;

        Ok(refreshed == 1)
    }

    async fn reap(&self, id: &str) -> Result<i64, CoordinationError> {
        let mut con = self.connection.clone();

        self.bounded(
            REAP_SCRIPT
                .key(self.keys.sessions())
                .key(self.keys.ephemerals(id))
                .key(self.keys.session(id))
                .arg(id)
                .arg(&self.keys.namespace)
                .arg(self.keys.channel())
                .invoke_async(&mut con),
        )
        .await
    }

    async fn reap_expired_sessions(&self) -> Result<(), CoordinationError> {
        let mut con = self.connection.clone();
        let sessions: Vec<String> = self
            .bounded(
                redis::cmd("SMEMBERS")
                    .arg(self.keys.sessions())
                    .query_async(&mut con),
            )
            .await?;

        for session in sessions {
            let removed = self.reap(&session).await?;
            if removed >= 0 {
                info!(%session, nodes = removed, "Reaped expired session");
            }
        }

        Ok(())
    }

    async fn keepalive(self: Arc<Self>) {
        let interval = self.options.session_timeout / 3;
        let mut last_success = Instant::now();

        loop {
            sleep(interval).await;

            let state = self.tracker.current();
            if state == ConnectionState::Closed {
                return;
            }

            let id = self.session_id();

            match self.refresh_session(&id).await {
                Ok(true) => {
                    last_success = Instant::now();

                    if state == ConnectionState::Suspended {
                        self.tracker.transition(ConnectionState::Reconnected);
                    }
                }
                Ok(false) => {
                    warn!(session = %id, "Session expired");
                    self.tracker.transition(ConnectionState::Lost);
                    self.renew_session(&id).await;
                    last_success = Instant::now();
                }
                Err(e) => {
                    if last_success.elapsed() >= self.options.session_timeout {
                        warn!(session = %id, error = %e, "Session timed out");
                        self.tracker.transition(ConnectionState::Lost);
                        self.renew_session(&id).await;
                        last_success = Instant::now();
                    } else {
                        debug!(error = %e, "Keepalive failed");
                        self.tracker.transition(ConnectionState::Suspended);
                    }
                }
            }

            if let Err(e) = self.reap_expired_sessions().await {
                debug!(error = %e, "Unable to reap expired sessions");
            }
        }
    }

    /// Establishes a new session after the previous one has been lost, retrying until it succeeds
    async fn renew_session(&self, previous: &str) {
        let mut backoff = Backoff::jittered(Duration::from_millis(100), self.options.session_timeout);

        loop {
            if self.tracker.current() == ConnectionState::Closed {
                return;
            }

            let id = new_session_id();
            let result = async {
                self.open_session(&id).await?;
                self.reap(previous).await
            }
            .await;

            match result {
                Ok(_) => {
                    if let Ok(mut session) = self.session.write() {
                        *session = id.clone();
                    }

                    info!(session = %id, "Session renewed");
                    self.tracker.transition(ConnectionState::Reconnected);
                    return;
                }
                Err(e) => {
                    let wait = backoff.next().unwrap_or(self.options.session_timeout);
                    debug!(error = %e, ?wait, "Unable to renew session");
                    sleep(wait).await;
                }
            }
        }
    }

    async fn forward_changes(self: Arc<Self>, client: Client) {
        let mut backoff = Backoff::jittered(Duration::from_millis(100), Duration::from_secs(5));

        loop {
            let result: RedisResult<()> = async {
                let mut pubsub = client.get_async_connection().await?.into_pubsub();
                pubsub.subscribe(self.keys.channel()).await?;
                backoff.reset();

                // Modifications may have been missed while the subscription was down
                self.events
                    .send(NodeEvent::new(NodeEventKind::Resync, "/"))
                    .ok();

                let mut messages = pubsub.on_message();
                while let Some(message) = messages.next().await {
                    let payload: String = message.get_payload()?;

                    if let Some(event) = parse_event(&payload) {
                        self.events.send(event).ok();
                    }
                }

                Ok(())
            }
            .await;

            if self.tracker.current() == ConnectionState::Closed {
                return;
            }

            let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
            match result {
                Ok(_) => debug!(?wait, "Change subscription ended"),
                Err(e) => warn!(error = %e, ?wait, "Change subscription failed"),
            }
            sleep(wait).await;
        }
    }
}

/// Session on a Redis server acting as a coordination backend
pub struct RedisCoordinationStore {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisCoordinationStore {
    /// Connects to the server at `url` and opens a new session
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, CoordinationError> {
        let client = Client::open(url)?;
        let connection = timeout(options.operation_timeout, client.get_multiplexed_tokio_connection()).await??;
        let (events, _) = broadcast::channel(1024);
        let id = new_session_id();

        let inner = Arc::new(Inner {
            keys: Keys {
                namespace: options.namespace.clone(),
            },
            options,
            connection,
            session: RwLock::new(id.clone()),
            tracker: ConnectionStateTracker::new(ConnectionState::Connected),
            events,
        });

        inner.open_session(&id).await?;
        info!(session = %id, "Coordination session established");

        let tasks = vec![
            tokio::spawn(inner.clone().keepalive()),
            tokio::spawn(inner.clone().forward_changes(client)),
        ];

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    fn ensure_connected(&self) -> Result<(), CoordinationError> {
        if self.inner.tracker.current().is_connected() {
            Ok(())
        } else {
            Err(CoordinationError::ConnectionLoss)
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for RedisCoordinationStore {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    fn session_id(&self) -> String {
        self.inner.session_id()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.tracker.current()
    }

    fn state_listener(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.tracker.subscribe()
    }

    fn watch(&self, path: &str) -> Watch {
        Watch::new(path, self.inner.events.subscribe())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError> {
        validate_path(path)?;
        self.ensure_connected()?;

        let keys = &self.inner.keys;
        let mut con = self.inner.connection.clone();

        let actual_path = if mode == CreateMode::EphemeralSequential {
            let sequence: u64 = self
                .inner
                .bounded(redis::cmd("INCR").arg(keys.sequence(path)).query_async(&mut con))
                .await?;

            // INCR starts at 1 while sequence numbers start at 0
            format!("{}{:010}", path, sequence - 1)
        } else {
            path.to_owned()
        };

        let parent = parent_path(&actual_path);
        let (name, parent) = match parent {
            Some(parent) => (&actual_path[parent.len() + 1..], parent),
            None => (&actual_path[1..], "/"),
        };

        let session = self.session_id();
        let owner = if mode.is_ephemeral() { session.as_str() } else { "" };

        let status: i64 = self
            .inner
            .bounded(
                CREATE_SCRIPT
                    .key(keys.node(&actual_path))
                    .key(keys.node(parent))
                    .key(keys.children(parent))
                    .key(keys.ephemerals(&session))
                    .arg(data)
                    .arg(owner)
                    .arg(name)
                    .arg(if parent == "/" { "0" } else { "1" })
                    .arg(keys.channel())
                    .arg(&actual_path)
                    .invoke_async(&mut con),
            )
            .await?;

        match status {
            STATUS_NO_NODE => Err(CoordinationError::NoNode(parent.to_owned())),
            status => status_to_result(status, &actual_path).map(|_| actual_path),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let keys = &self.inner.keys;
        let mut con = self.inner.connection.clone();

        let status: i64 = self
            .inner
            .bounded(
                SET_SCRIPT
                    .key(keys.node(path))
                    .arg(data)
                    .arg(keys.channel())
                    .arg(path)
                    .invoke_async(&mut con),
            )
            .await?;

        status_to_result(status, path)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        self.ensure_connected()?;

        let mut con = self.inner.connection.clone();
        let data: Option<Vec<u8>> = self
            .inner
            .bounded(
                redis::cmd("HGET")
                    .arg(self.inner.keys.node(path))
                    .arg("data")
                    .query_async(&mut con),
            )
            .await?;

        data.ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, CoordinationError> {
        self.ensure_connected()?;

        let mut con = self.inner.connection.clone();
        let (data, version): (Option<Vec<u8>>, Option<u64>) = self
            .inner
            .bounded(
                redis::cmd("HMGET")
                    .arg(self.inner.keys.node(path))
                    .arg("data")
                    .arg("version")
                    .query_async(&mut con),
            )
            .await?;

        match data {
            Some(data) => Ok(Versioned {
                data,
                version: version.unwrap_or_default(),
            }),
            None => Err(CoordinationError::NoNode(path.to_owned())),
        }
    }

    async fn set_data_if_version(&self, path: &str, data: &[u8], version: u64) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let keys = &self.inner.keys;
        let mut con = self.inner.connection.clone();

        let status: i64 = self
            .inner
            .bounded(
                SET_IF_VERSION_SCRIPT
                    .key(keys.node(path))
                    .arg(data)
                    .arg(version)
                    .arg(keys.channel())
                    .arg(path)
                    .invoke_async(&mut con),
            )
            .await?;

        status_to_result(status, path)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        self.ensure_connected()?;

        let mut con = self.inner.connection.clone();
        self.inner
            .bounded(
                redis::cmd("EXISTS")
                    .arg(self.inner.keys.node(path))
                    .query_async(&mut con),
            )
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        self.ensure_connected()?;

        let keys = &self.inner.keys;
        let mut con = self.inner.connection.clone();
        let (parent, name) = match parent_path(path) {
            Some(parent) => (parent, &path[parent.len() + 1..]),
            None => ("/", path.trim_start_matches('/')),
        };

        let status: i64 = self
            .inner
            .bounded(
                DELETE_SCRIPT
                    .key(keys.node(path))
                    .key(keys.children(path))
                    .key(keys.children(parent))
                    .arg(name)
                    .arg(&keys.namespace)
                    .arg(keys.channel())
                    .arg(path)
                    .invoke_async(&mut con),
            )
            .await?;

        status_to_result(status, path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.ensure_connected()?;

        let keys = &self.inner.keys;
        let mut con = self.inner.connection.clone();

        let (exists, mut children): (bool, Vec<String>) = self
            .inner
            .bounded(
                redis::pipe()
                    .cmd("EXISTS")
                    .arg(keys.node(path))
                    .cmd("SMEMBERS")
                    .arg(keys.children(path))
                    .query_async(&mut con),
            )
            .await?;

        if !exists && path != "/" {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }

        children.sort();
        Ok(children)
    }

    async fn close(&self) {
        if self.inner.tracker.current() == ConnectionState::Closed {
            return;
        }

        self.inner.tracker.transition(ConnectionState::Closed);
        self.abort_tasks();

        let id = self.session_id();
        let mut con = self.inner.connection.clone();
        let result = async {
            self.inner
                .bounded(
                    redis::cmd("DEL")
                        .arg(self.inner.keys.session(&id))
                        .query_async::<_, ()>(&mut con),
                )
                .await?;
            self.inner.reap(&id).await
        }
        .await;

        match result {
            Ok(removed) => info!(session = %id, nodes = removed, "Coordination session closed"),
            Err(e) => warn!(session = %id, error = %e, "Unable to clean up session, relying on expiry"),
        }
    }
}
