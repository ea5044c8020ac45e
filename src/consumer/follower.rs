use super::{
    worker::{WorkerContext, WorkerRegistry},
    LeaderCoordinator,
};
use crate::domain::{ConsumerKeys, EventType, MemberId, PartitionId, PartitionKey};
use crate::library::{
    backoff::Backoff,
    coordination::{
        join_path, ConnectionState, CoordinationError, CoordinationStoreExt, CreateMode, SharedCoordinationStore,
    },
    scheduling::{Job, JobManager},
    EmptyResult,
};
use async_trait::async_trait;
use futures::{future, lock::Mutex, pin_mut};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    time::sleep,
};
use tracing::{debug, info, warn};

/// Registers a member as an ephemeral node. Returns false if a node with the same identifier already exists.
pub async fn register_member(
    store: &SharedCoordinationStore,
    keys: &ConsumerKeys,
    member: &MemberId,
) -> Result<bool, CoordinationError> {
    store.create_parents(&keys.members()).await?;

    match store
        .create(&keys.member(member), member.as_str().as_bytes(), CreateMode::Ephemeral)
        .await
    {
        Ok(_) => Ok(true),
        Err(CoordinationError::NodeExists(_)) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Mirrors the published assignments of one event type into local workers
///
/// Ownership is dropped as soon as the coordination store session is suspended or lost and reacquired once
/// it has been re-established.
pub struct AssignmentFollowerJob {
    event_type: EventType,
    store: SharedCoordinationStore,
    keys: ConsumerKeys,
    member: MemberId,
    registry: Arc<WorkerRegistry>,
    context: WorkerContext,
}

impl AssignmentFollowerJob {
    /// Creates a follower for the given event type
    pub fn new(
        event_type: EventType,
        store: SharedCoordinationStore,
        registry: Arc<WorkerRegistry>,
        context: WorkerContext,
    ) -> Self {
        Self {
            event_type,
            store,
            keys: context.keys.clone(),
            member: context.member.clone(),
            registry,
            context,
        }
    }

    async fn desired(&self) -> Result<BTreeSet<PartitionId>, CoordinationError> {
        let root = self.keys.assignments(&self.event_type);
        let mut desired = BTreeSet::new();

        for partition in self.store.children_if_exists(&root).await? {
            let owner = self.store.get_data_if_exists(&join_path(&root, &partition)).await?;

            if owner.as_deref() == Some(self.member.as_str().as_bytes()) {
                desired.insert(PartitionId::new(partition));
            }
        }

        Ok(desired)
    }

    async fn reconcile(&self) -> Result<(), CoordinationError> {
        let desired = self.desired().await?;

        let revoked: Vec<PartitionKey> = self
            .registry
            .partitions_of(&self.event_type)
            .into_iter()
            .filter(|partition| !desired.contains(partition))
            .map(|partition| PartitionKey::new(self.event_type.clone(), partition))
            .collect();

        future::join_all(revoked.iter().map(|key| self.registry.stop(key))).await;

        for partition in desired {
            let key = PartitionKey::new(self.event_type.clone(), partition);
            self.registry.start_if_absent(key, self.context.clone());
        }

        Ok(())
    }

    async fn drop_ownership(&self, state: ConnectionState) {
        let owned = self.registry.partitions_of(&self.event_type);

        if !owned.is_empty() {
            warn!(event_type = %self.event_type, %state, ?owned, "Dropping partition ownership");
            self.registry.stop_event_type(&self.event_type).await;
        }
    }
}

#[async_trait]
impl Job for AssignmentFollowerJob {
    const NAME: &'static str = "AssignmentFollowerJob";
    const SUPPORTS_GRACEFUL_TERMINATION: bool = true;

    fn name(&self) -> String {
        format!("AssignmentFollower({})", self.event_type)
    }

    async fn execute(&self, manager: JobManager) -> EmptyResult {
        let mut assignments = self.store.watch(&self.keys.assignments(&self.event_type));
        let mut states = self.store.state_listener();
        let mut owning = self.store.connection_state().is_connected();
        let mut backoff = Backoff::jittered(Duration::from_millis(50), Duration::from_secs(5));

        let termination = manager.termination_signal();
        pin_mut!(termination);

        manager.ready().await;

        loop {
            let mut retry = None;

            if owning {
                if let Err(error) = self.reconcile().await {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    warn!(event_type = %self.event_type, %error, ?wait, "Unable to follow assignments");
                    retry = Some(wait);
                } else {
                    backoff.reset();
                }
            }

            let retry = async move {
                match retry {
                    Some(wait) => sleep(wait).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut termination => return Ok(()),
                Some(_) = assignments.changed() => {},
                state = states.recv() => {
                    let state = match state {
                        Ok(state) => state,
                        Err(RecvError::Lagged(_)) => self.store.connection_state(),
                        Err(RecvError::Closed) => return Ok(()),
                    };

                    owning = state.is_connected();
                    if !owning {
                        self.drop_ownership(state).await;
                    }
                },
                _ = retry => {},
            }
        }
    }
}

/// Re-registers the member after the coordination store session has been re-established
pub struct MembershipJob {
    store: SharedCoordinationStore,
    keys: ConsumerKeys,
    member: MemberId,
}

impl MembershipJob {
    /// Creates a new job keeping `member` registered
    pub fn new(store: SharedCoordinationStore, keys: ConsumerKeys, member: MemberId) -> Self {
        Self { store, keys, member }
    }

    async fn reregister(&self, termination: impl std::future::Future<Output = ()>) {
        let mut backoff = Backoff::jittered(Duration::from_millis(50), Duration::from_secs(5));
        pin_mut!(termination);

        loop {
            match register_member(&self.store, &self.keys, &self.member).await {
                Ok(true) => {
                    info!(member = %self.member, "Member registered again");
                    return;
                }
                Ok(false) => {
                    debug!(member = %self.member, "Member registration survived");
                    return;
                }
                Err(error) => {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    warn!(member = %self.member, %error, ?wait, "Unable to register member");

                    tokio::select! {
                        _ = &mut termination => return,
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Job for MembershipJob {
    const NAME: &'static str = "MembershipJob";
    const SUPPORTS_GRACEFUL_TERMINATION: bool = true;

    async fn execute(&self, manager: JobManager) -> EmptyResult {
        let mut states = self.store.state_listener();
        manager.ready().await;

        let termination = manager.termination_signal();
        pin_mut!(termination);

        loop {
            let state = tokio::select! {
                _ = &mut termination => return Ok(()),
                state = states.recv() => match state {
                    Ok(state) => state,
                    Err(RecvError::Lagged(_)) => self.store.connection_state(),
                    Err(RecvError::Closed) => return Ok(()),
                },
            };

            if state == ConnectionState::Reconnected {
                self.reregister(manager.termination_signal()).await;
            }
        }
    }
}

/// Sends a member back into the election of every event type in which one of its workers failed
pub struct FailureSupervisorJob {
    leader: Arc<LeaderCoordinator<EventType>>,
    failures: Mutex<mpsc::UnboundedReceiver<EventType>>,
}

impl FailureSupervisorJob {
    /// Creates a new job consuming the failure notifications of the workers
    pub fn new(leader: Arc<LeaderCoordinator<EventType>>, failures: mpsc::UnboundedReceiver<EventType>) -> Self {
        Self {
            leader,
            failures: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl Job for FailureSupervisorJob {
    const NAME: &'static str = "FailureSupervisorJob";
    const SUPPORTS_GRACEFUL_TERMINATION: bool = true;

    async fn execute(&self, manager: JobManager) -> EmptyResult {
        let mut failures = self.failures.lock().await;
        manager.ready().await;

        let termination = manager.termination_signal();
        pin_mut!(termination);

        loop {
            tokio::select! {
                _ = &mut termination => return Ok(()),
                failure = failures.recv() => match failure {
                    Some(event_type) => self.leader.requeue(&event_type),
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::consumer::{
        broker::mock::MockBroker, handler_fn, BatchHandler, CoordinationOffsetStore, EventDispatcher,
        LoggingErrorSink, OffsetStore,
    };
    use crate::domain::HandlerErrorPolicy;
    use crate::library::{
        coordination::{
            memory::{MemoryCoordinationStore, MemoryEnsemble},
            CoordinationStore,
        },
        scheduling::JobScheduler,
    };
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio::time::timeout;

    struct Fixture {
        store: Arc<MemoryCoordinationStore>,
        registry: Arc<WorkerRegistry>,
        scheduler: JobScheduler,
        _offsets: Arc<dyn OffsetStore>,
    }

    fn context(
        store: &SharedCoordinationStore,
        offsets: &Arc<dyn OffsetStore>,
        broker: Arc<MockBroker>,
        handler: impl BatchHandler + 'static,
    ) -> WorkerContext {
        let mut handlers: HashMap<EventType, Arc<dyn BatchHandler>> = HashMap::new();
        handlers.insert("orders".into(), Arc::new(handler));
        let (failures, _) = mpsc::unbounded_channel();

        WorkerContext {
            offsets: Arc::downgrade(offsets),
            store: Arc::downgrade(store),
            broker,
            dispatcher: Arc::new(EventDispatcher::new(handlers, 4)),
            error_sink: Arc::new(LoggingErrorSink),
            policy: HandlerErrorPolicy::Fail,
            keys: ConsumerKeys::new("c1"),
            member: "m1".into(),
            failures,
        }
    }

    async fn follow(ensemble: &MemoryEnsemble) -> Fixture {
        let store = Arc::new(ensemble.connect());
        let shared: SharedCoordinationStore = store.clone();
        let offsets: Arc<dyn OffsetStore> =
            Arc::new(CoordinationOffsetStore::new(shared.clone(), ConsumerKeys::new("c1")));
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(1)));
        let context = context(
            &shared,
            &offsets,
            Arc::new(MockBroker::default()),
            handler_fn(|_, _| async { Ok(()) }),
        );

        let scheduler = JobScheduler::default();
        scheduler
            .spawn_job(AssignmentFollowerJob::new("orders".into(), shared, registry.clone(), context))
            .await;

        Fixture {
            store,
            registry,
            scheduler,
            _offsets: offsets,
        }
    }

    async fn owned(registry: &WorkerRegistry, expected: &[&str]) {
        let expected: Vec<PartitionId> = expected.iter().map(|p| PartitionId::new(*p)).collect();

        timeout(Duration::from_secs(5), async {
            while registry.partitions_of(&"orders".into()) != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ownership never converged");
    }

    #[tokio::test]
    async fn run_workers_for_own_assignments() {
        let ensemble = MemoryEnsemble::new();
        let leader = ensemble.connect();
        let fixture = follow(&ensemble).await;

        leader.set_or_create("/consumers/c1/assignments/orders/0", b"m1").await.unwrap();
        leader.set_or_create("/consumers/c1/assignments/orders/1", b"m2").await.unwrap();
        owned(&fixture.registry, &["0"]).await;

        leader.set_or_create("/consumers/c1/assignments/orders/1", b"m1").await.unwrap();
        owned(&fixture.registry, &["0", "1"]).await;

        leader.set_or_create("/consumers/c1/assignments/orders/0", b"m2").await.unwrap();
        owned(&fixture.registry, &["1"]).await;

        fixture.scheduler.terminate_jobs(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_revoked_workers_concurrently() {
        let store: SharedCoordinationStore = Arc::new(MemoryEnsemble::new().connect());
        let offsets: Arc<dyn OffsetStore> =
            Arc::new(CoordinationOffsetStore::new(store.clone(), ConsumerKeys::new("c1")));
        let broker = Arc::new(MockBroker::default());
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();

        let stuck = handler_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            future::pending::<EmptyResult>()
        });

        let drain_timeout = Duration::from_millis(300);
        let registry = Arc::new(WorkerRegistry::new(drain_timeout));
        let context = context(&store, &offsets, broker.clone(), stuck);

        for partition in ["0", "1", "2"] {
            broker.publish("orders", partition, "10", vec![serde_json::json!({})]);
            registry.start_if_absent(PartitionKey::new("orders".into(), partition.into()), context.clone());
        }

        timeout(Duration::from_secs(5), async {
            while invoked.load(Ordering::SeqCst) < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let follower = AssignmentFollowerJob::new("orders".into(), store, registry.clone(), context);
        let started = tokio::time::Instant::now();
        follower.reconcile().await.unwrap();
        let elapsed = started.elapsed();

        assert!(registry.is_empty());
        assert!(elapsed < drain_timeout * 2, "revocation took {:?}", elapsed);
    }

    #[tokio::test]
    async fn drop_ownership_while_suspended() {
        let ensemble = MemoryEnsemble::new();
        let leader = ensemble.connect();
        let fixture = follow(&ensemble).await;

        leader.set_or_create("/consumers/c1/assignments/orders/0", b"m1").await.unwrap();
        owned(&fixture.registry, &["0"]).await;

        fixture.store.suspend();
        owned(&fixture.registry, &[]).await;

        fixture.store.resume();
        owned(&fixture.registry, &["0"]).await;

        fixture.scheduler.terminate_jobs(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn register_member_again_after_session_expiry() {
        let ensemble = MemoryEnsemble::new();
        let store = Arc::new(ensemble.connect());
        let shared: SharedCoordinationStore = store.clone();
        let keys = ConsumerKeys::new("c1");
        let member = MemberId::new("m1");

        assert!(register_member(&shared, &keys, &member).await.unwrap());
        assert!(!register_member(&shared, &keys, &member).await.unwrap());

        let scheduler = JobScheduler::default();
        scheduler
            .spawn_job(MembershipJob::new(shared.clone(), keys.clone(), member.clone()))
            .await;
        sleep(Duration::from_millis(20)).await;

        store.expire_session().await;

        timeout(Duration::from_secs(5), async {
            while !shared.exists("/consumers/c1/members/m1").await.unwrap_or(false) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(shared.get_data("/consumers/c1/members/m1").await.unwrap(), b"m1".to_vec());
        scheduler.terminate_jobs(Duration::from_secs(1)).await;
    }
}
