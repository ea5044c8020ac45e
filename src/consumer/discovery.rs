use super::broker::BrokerClient;
use crate::domain::{EventType, PartitionId};
use crate::library::{
    backoff::Backoff,
    scheduling::{Job, JobManager},
    EmptyResult,
};
use async_trait::async_trait;
use futures::pin_mut;
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, warn};

/// Latest confirmed partitions of an event type, `None` until the first successful discovery
pub type PartitionFeed = watch::Receiver<Option<Vec<PartitionId>>>;

/// Known partitions of an event type
///
/// New partitions are adopted immediately. A partition that is missing from a response is only
/// dropped once it is missing from the following response as well.
#[derive(Debug, Default)]
pub struct PartitionSet {
    known: BTreeSet<PartitionId>,
    missing: HashSet<PartitionId>,
}

impl PartitionSet {
    /// Merges the latest broker response and returns whether the set of known partitions changed
    pub fn reconcile(&mut self, latest: impl IntoIterator<Item = PartitionId>) -> bool {
        let latest: BTreeSet<PartitionId> = latest.into_iter().collect();
        let mut changed = false;

        for partition in latest.iter() {
            self.missing.remove(partition);
            changed |= self.known.insert(partition.clone());
        }

        let absent: Vec<PartitionId> = self.known.difference(&latest).cloned().collect();
        for partition in absent {
            if self.missing.remove(&partition) {
                self.known.remove(&partition);
                changed = true;
            } else {
                debug!(%partition, "Partition missing from discovery, awaiting confirmation");
                self.missing.insert(partition);
            }
        }

        changed
    }

    /// Known partitions in ascending order
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.known.iter().cloned().collect()
    }
}

/// Periodically fetches the partitions of one event type from the broker
pub struct PartitionDiscoveryJob {
    event_type: EventType,
    broker: Arc<dyn BrokerClient>,
    interval: Duration,
    feed: watch::Sender<Option<Vec<PartitionId>>>,
}

impl PartitionDiscoveryJob {
    /// Creates a new job and the feed it publishes to
    pub fn new(event_type: EventType, broker: Arc<dyn BrokerClient>, interval: Duration) -> (Self, PartitionFeed) {
        let (feed, rx) = watch::channel(None);

        let job = Self {
            event_type,
            broker,
            interval,
            feed,
        };

        (job, rx)
    }

    fn publish(&self, partitions: &PartitionSet) {
        let partitions = partitions.partitions();
        info!(event_type = %self.event_type, ?partitions, "Partitions changed");
        self.feed.send_replace(Some(partitions));
    }
}

#[async_trait]
impl Job for PartitionDiscoveryJob {
    const NAME: &'static str = "PartitionDiscoveryJob";
    const SUPPORTS_GRACEFUL_TERMINATION: bool = true;

    fn name(&self) -> String {
        format!("PartitionDiscovery({})", self.event_type)
    }

    async fn execute(&self, manager: JobManager) -> EmptyResult {
        let mut partitions = PartitionSet::default();
        let mut backoff = Backoff::capped(self.interval.min(Duration::from_millis(500)), self.interval);

        let termination = manager.termination_signal();
        pin_mut!(termination);

        manager.ready().await;

        loop {
            let wait = tokio::select! {
                _ = &mut termination => return Ok(()),
                result = self.broker.partitions(&self.event_type) => match result {
                    Ok(infos) => {
                        backoff.reset();
                        let changed = partitions.reconcile(infos.into_iter().map(|info| info.partition));

                        if changed || self.feed.borrow().is_none() {
                            self.publish(&partitions);
                        }

                        self.interval
                    }
                    Err(error) => {
                        let wait = backoff.next().unwrap_or(self.interval);
                        warn!(event_type = %self.event_type, %error, ?wait, "Partition discovery failed");
                        wait
                    }
                }
            };

            tokio::select! {
                _ = &mut termination => return Ok(()),
                _ = sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::consumer::broker::mock::MockBroker;
    use crate::library::scheduling::JobScheduler;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    fn ids(raw: &[&str]) -> Vec<PartitionId> {
        raw.iter().map(|p| PartitionId::new(*p)).collect()
    }

    #[test]
    fn adopt_new_partitions_immediately() {
        let mut set = PartitionSet::default();

        assert!(set.reconcile(ids(&["1", "0"])));
        assert!(!set.reconcile(ids(&["0", "1"])));
        assert!(set.reconcile(ids(&["0", "1", "2"])));
        assert_eq!(set.partitions(), ids(&["0", "1", "2"]));
    }

    #[test]
    fn drop_partitions_after_confirmation() {
        let mut set = PartitionSet::default();
        set.reconcile(ids(&["0", "1"]));

        assert!(!set.reconcile(ids(&["0"])));
        assert_eq!(set.partitions(), ids(&["0", "1"]));

        assert!(set.reconcile(ids(&["0"])));
        assert_eq!(set.partitions(), ids(&["0"]));
    }

    #[test]
    fn forgive_partitions_that_reappear() {
        let mut set = PartitionSet::default();
        set.reconcile(ids(&["0", "1"]));
        set.reconcile(ids(&["0"]));
        set.reconcile(ids(&["0", "1"]));

        assert!(!set.reconcile(ids(&["0"])));
        assert_eq!(set.partitions(), ids(&["0", "1"]));
    }

    #[tokio::test]
    async fn publish_partitions_despite_failures() {
        let broker = Arc::new(MockBroker::default());
        broker.set_partitions("orders", &["0"]);
        broker.fail_discoveries(2);

        let (job, mut feed) = PartitionDiscoveryJob::new("orders".into(), broker.clone(), Duration::from_millis(20));
        let scheduler = JobScheduler::default();
        scheduler.spawn_job(job).await;

        timeout(Duration::from_secs(5), feed.changed()).await.unwrap().unwrap();
        assert_eq!(*feed.borrow(), Some(ids(&["0"])));

        broker.set_partitions("orders", &["0", "1"]);
        timeout(Duration::from_secs(5), feed.changed()).await.unwrap().unwrap();
        assert_eq!(*feed.borrow(), Some(ids(&["0", "1"])));

        scheduler.terminate_jobs(Duration::from_secs(1)).await;
    }
}
