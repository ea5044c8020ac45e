use super::{
    broker::BrokerClient,
    register_member,
    worker::{WorkerContext, WorkerRegistry, WorkerState},
    AssignmentFollowerJob, BrokerOffsetStore, ConsumerConfig, ConsumerError, CoordinationOffsetStore,
    EventDispatcher, FailureSupervisorJob, LeaderCoordinator, LeadershipChangedListener, LoggingErrorSink,
    MembershipJob, OffsetStore, PartitionDiscoveryJob, Rebalancer,
};
use crate::domain::{ConsumerKeys, EventType, Member, MemberId, OffsetStoreKind, PartitionKey};
use crate::harness::{HealthReport, HealthReporter};
use crate::library::{
    coordination::{
        bounded::BoundedCoordinationStore, ConnectionState, CoordinationError, CoordinationStoreExt,
        SharedCoordinationStore,
    },
    scheduling::JobScheduler,
};
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, Instant},
};
use tracing::{error, info, instrument, warn};

/// Outcome of [`Consumer::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Partitions whose workers did not drain within the drain timeout and have been aborted
    pub undrained: Vec<PartitionKey>,
}

impl StopReport {
    /// Whether every worker drained in time
    pub fn is_clean(&self) -> bool {
        self.undrained.is_empty()
    }
}

/// Snapshot of the state of a [`Consumer`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerHealth {
    /// Whether the consumer is running and connected and all of its jobs are healthy
    pub operational: bool,
    /// Identifier of this member
    pub member_id: MemberId,
    /// Session state of the coordination store
    pub connection: ConnectionState,
    /// Event types this member currently leads
    pub leaderships: Vec<EventType>,
    /// State of every local worker, keyed by `<event type>/<partition>`
    pub workers: BTreeMap<String, WorkerState>,
    /// Status of every background job
    pub jobs: BTreeMap<String, String>,
}

enum Phase {
    Idle,
    Running { _offsets: Arc<dyn OffsetStore> },
    Stopped,
}

/// Member of a consumer group
///
/// Owns every component of the consumer: the membership registration, partition discovery, the leader elections
/// together with the rebalancer and the local partition workers.
pub struct Consumer {
    config: ConsumerConfig,
    member: Member,
    keys: ConsumerKeys,
    store: SharedCoordinationStore,
    broker: Arc<dyn BrokerClient>,
    scheduler: JobScheduler,
    registry: Arc<WorkerRegistry>,
    leader: Arc<LeaderCoordinator<EventType>>,
    phase: Mutex<Phase>,
}

impl Consumer {
    /// Creates a consumer. Nothing happens until [`start`](Self::start) is called.
    pub fn new(
        config: ConsumerConfig,
        store: SharedCoordinationStore,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;

        let store: SharedCoordinationStore = Arc::new(BoundedCoordinationStore::new(store, config.operation_timeout));
        let member = Member::current(config.member_id.clone());
        let keys = ConsumerKeys::new(&config.consumer_name);

        let leader = {
            let (election, info) = (keys.clone(), keys.clone());
            LeaderCoordinator::new(
                store.clone(),
                member.id.clone(),
                move |event_type: &EventType| election.election(event_type),
                move |event_type: &EventType| info.leader(event_type),
            )
        };

        Ok(Self {
            registry: Arc::new(WorkerRegistry::new(config.drain_timeout)),
            leader: Arc::new(leader),
            scheduler: JobScheduler::default(),
            phase: Mutex::new(Phase::Idle),
            config,
            member,
            keys,
            store,
            broker,
        })
    }

    /// Identifier of this member
    pub fn member_id(&self) -> &MemberId {
        &self.member.id
    }

    /// Joins the consumer group and starts consuming
    #[instrument(skip(self), fields(consumer = %self.config.consumer_name, member = %self.member.id))]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut phase = self.phase.lock().await;

        match *phase {
            Phase::Idle => {}
            Phase::Running { .. } => return Err(ConsumerError::AlreadyStarted),
            Phase::Stopped => return Err(ConsumerError::Stopped),
        }

        let state = self.store.connection_state();
        if !state.is_connected() {
            return Err(CoordinationError::ConnectionLoss.into());
        }

        self.register().await?;

        let offsets: Arc<dyn OffsetStore> = match self.config.offset_store {
            OffsetStoreKind::CoordinationStore => Arc::new(CoordinationOffsetStore::new(self.store.clone(), self.keys.clone())),
            OffsetStoreKind::Broker => Arc::new(BrokerOffsetStore::new(
                self.broker.clone(),
                self.config.consumer_name.clone(),
            )),
        };

        let event_types = self.config.event_types();
        let mut feeds = HashMap::new();

        for event_type in event_types.iter() {
            let (job, feed) =
                PartitionDiscoveryJob::new(event_type.clone(), self.broker.clone(), self.config.discovery_interval);
            self.scheduler.spawn_job(job).await;
            feeds.insert(event_type.clone(), feed);
        }

        let rebalancer: Arc<dyn LeadershipChangedListener<EventType>> =
            Arc::new(Rebalancer::new(self.store.clone(), self.keys.clone(), feeds));

        for event_type in event_types.iter() {
            self.leader
                .init_group_leadership(event_type.clone(), rebalancer.clone())
                .await;
        }

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            offsets: Arc::downgrade(&offsets),
            store: Arc::downgrade(&self.store),
            broker: self.broker.clone(),
            dispatcher: Arc::new(EventDispatcher::new(
                self.config.handlers.clone(),
                self.config.max_parallel_handlers,
            )),
            error_sink: self
                .config
                .error_sink
                .clone()
                .unwrap_or_else(|| Arc::new(LoggingErrorSink)),
            policy: self.config.handler_error_policy,
            keys: self.keys.clone(),
            member: self.member.id.clone(),
            failures: failures_tx,
        };

        for event_type in event_types.iter() {
            let follower = AssignmentFollowerJob::new(
                event_type.clone(),
                self.store.clone(),
                self.registry.clone(),
                context.clone(),
            );
            self.scheduler.spawn_job(follower).await;
        }

        self.scheduler
            .spawn_job(MembershipJob::new(
                self.store.clone(),
                self.keys.clone(),
                self.member.id.clone(),
            ))
            .await;
        self.scheduler
            .spawn_job(FailureSupervisorJob::new(self.leader.clone(), failures_rx))
            .await;

        *phase = Phase::Running { _offsets: offsets };
        info!(?event_types, "Consumer started");

        Ok(())
    }

    /// Registers the member, waiting up to one session timeout for a stale registration to expire
    async fn register(&self) -> Result<(), ConsumerError> {
        let deadline = Instant::now() + self.config.session_timeout;

        loop {
            if register_member(&self.store, &self.keys, &self.member.id).await? {
                info!(member = %self.member.id, host = %self.member.host, pid = self.member.pid, "Member registered");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ConsumerError::MemberIdInUse(self.member.id.to_string()));
            }

            warn!(member = %self.member.id, "Member identifier is still registered, waiting for it to expire");
            sleep(Duration::from_millis(250).min(self.config.session_timeout)).await;
        }
    }

    /// Leaves the consumer group
    ///
    /// Workers are asked to drain and every leadership is given up. Background jobs and workers then share one
    /// drain timeout, workers that do not close within it are aborted and listed in the report. Failures of
    /// individual steps are logged and do not prevent the remaining steps.
    #[instrument(skip(self), fields(consumer = %self.config.consumer_name, member = %self.member.id))]
    pub async fn stop(&self) -> StopReport {
        let mut phase = self.phase.lock().await;

        if !matches!(*phase, Phase::Running { .. }) {
            *phase = Phase::Stopped;
            return StopReport::default();
        }

        info!("Stopping consumer");
        let deadline = Instant::now() + self.config.drain_timeout;

        self.registry.signal_drain_all();
        self.leader.relinquish_all();

        let (_, mut undrained) = tokio::join!(
            self.scheduler.terminate_jobs(self.config.drain_timeout),
            self.registry.await_drained(self.config.drain_timeout),
        );

        // Followers may have started workers before they observed the termination
        let late = self
            .registry
            .await_drained(deadline.saturating_duration_since(Instant::now()))
            .await;
        undrained.extend(late);
        undrained.sort();
        undrained.dedup();

        if !undrained.is_empty() {
            warn!(?undrained, "Workers did not drain in time");
        }

        self.leader.close().await;

        if let Err(error) = self.store.delete_if_exists(&self.keys.member(&self.member.id)).await {
            error!(%error, "Unable to deregister member");
        }

        self.store.close().await;
        *phase = Phase::Stopped;

        info!("Consumer stopped");
        StopReport { undrained }
    }

    /// Current state of the consumer
    pub async fn health(&self) -> ConsumerHealth {
        // Start and stop hold the lock for their whole duration, neither counts as running
        let running = matches!(self.phase.try_lock().as_deref(), Ok(Phase::Running { .. }));
        let connection = self.store.connection_state();

        let mut leaderships = self.leader.leaderships();
        leaderships.sort();

        let workers = self
            .registry
            .states()
            .into_iter()
            .map(|(key, state)| (key.to_string(), state))
            .collect();

        let status = self.scheduler.status().await;
        let degraded = status.values().any(|status| status.is_degraded());
        let jobs = status
            .into_iter()
            .map(|(name, status)| (name, status.to_string()))
            .collect();

        ConsumerHealth {
            operational: running && connection.is_connected() && !degraded,
            member_id: self.member.id.clone(),
            connection,
            leaderships,
            workers,
            jobs,
        }
    }
}

#[async_trait]
impl HealthReporter for Consumer {
    async fn report(&self) -> HealthReport {
        let health = self.health().await;

        HealthReport {
            operational: health.operational,
            details: serde_json::to_value(&health).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::consumer::{broker::mock::MockBroker, handler_fn, ConfigError};
    use crate::library::{
        coordination::{memory::MemoryEnsemble, CoordinationStore},
        EmptyResult,
    };
    use pretty_assertions::assert_eq;
    use tokio::{sync::Notify, time::timeout};

    fn config(member: &str) -> ConsumerConfig {
        ConsumerConfig::builder("c1")
            .handler("orders", handler_fn(|_, _| async { Ok(()) }))
            .member_id(member)
            .session_timeout(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn refuse_invalid_configuration() {
        let mut config = config("m1");
        config.handlers.clear();

        let store: SharedCoordinationStore = Arc::new(MemoryEnsemble::new().connect());
        let result = Consumer::new(config, store, Arc::new(MockBroker::default()));

        assert!(matches!(result, Err(ConsumerError::Config(ConfigError::NoHandlers))));
    }

    #[tokio::test]
    async fn refuse_member_ids_in_use() {
        let ensemble = MemoryEnsemble::new();
        let broker = Arc::new(MockBroker::default());
        broker.set_partitions("orders", &[]);

        let first = Consumer::new(config("m1"), Arc::new(ensemble.connect()), broker.clone()).unwrap();
        let second = Consumer::new(config("m1"), Arc::new(ensemble.connect()), broker).unwrap();

        first.start().await.unwrap();
        assert!(matches!(second.start().await, Err(ConsumerError::MemberIdInUse(_))));

        first.stop().await;
    }

    #[tokio::test]
    async fn stop_within_the_drain_timeout_despite_stuck_handlers() {
        let ensemble = MemoryEnsemble::new();
        let broker = Arc::new(MockBroker::default());
        broker.set_partitions("orders", &["0"]);
        broker.publish("orders", "0", "10", vec![serde_json::json!({})]);

        let invoked = Arc::new(Notify::new());
        let signal = invoked.clone();
        let stuck = handler_fn(move |_, _| {
            signal.notify_one();
            futures::future::pending::<EmptyResult>()
        });

        let drain_timeout = Duration::from_millis(300);
        let config = ConsumerConfig::builder("c1")
            .handler("orders", stuck)
            .member_id("m1")
            .discovery_interval(Duration::from_millis(25))
            .session_timeout(Duration::from_millis(100))
            .drain_timeout(drain_timeout)
            .build()
            .unwrap();

        let consumer = Consumer::new(config, Arc::new(ensemble.connect()), broker).unwrap();
        consumer.start().await.unwrap();
        timeout(Duration::from_secs(10), invoked.notified()).await.unwrap();

        let started = Instant::now();
        let report = consumer.stop().await;
        let elapsed = started.elapsed();

        assert_eq!(
            report.undrained,
            vec![PartitionKey::new("orders".into(), "0".into())]
        );
        assert!(elapsed >= drain_timeout);
        assert!(elapsed < drain_timeout + drain_timeout / 2, "stopping took {:?}", elapsed);
    }

    #[tokio::test]
    async fn register_and_deregister() {
        let ensemble = MemoryEnsemble::new();
        let observer = ensemble.connect();
        let broker = Arc::new(MockBroker::default());
        broker.set_partitions("orders", &[]);

        let consumer = Consumer::new(config("m1"), Arc::new(ensemble.connect()), broker).unwrap();
        consumer.start().await.unwrap();

        assert!(observer.exists("/consumers/c1/members/m1").await.unwrap());
        assert!(matches!(consumer.start().await, Err(ConsumerError::AlreadyStarted)));

        let health = consumer.health().await;
        assert_eq!(health.member_id, MemberId::new("m1"));
        assert_eq!(health.connection, ConnectionState::Connected);

        assert!(consumer.stop().await.is_clean());
        assert!(!observer.exists("/consumers/c1/members/m1").await.unwrap());
        assert!(!consumer.health().await.operational);
        assert!(matches!(consumer.start().await, Err(ConsumerError::Stopped)));
    }
}
