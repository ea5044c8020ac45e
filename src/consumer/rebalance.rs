use super::{LeadershipChangedListener, PartitionFeed};
use crate::domain::{ConsumerKeys, EventType, MemberId, PartitionId};
use crate::library::{
    backoff::Backoff,
    coordination::{join_path, CoordinationError, CoordinationStoreExt, SharedCoordinationStore},
};
use dashmap::DashMap;
use futures::future;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Computes which member consumes which partition
///
/// Members and partitions are sorted, then partition `P[i]` goes to `C[i mod |C|]` where `C` are the members
/// without a failure marker for that partition. Partitions without candidates stay unassigned.
pub fn assign(
    members: &[MemberId],
    partitions: &[PartitionId],
    excluded: &HashMap<PartitionId, HashSet<MemberId>>,
) -> BTreeMap<PartitionId, MemberId> {
    let mut members = members.to_vec();
    members.sort();
    members.dedup();

    let mut partitions = partitions.to_vec();
    partitions.sort();
    partitions.dedup();

    let mut assignments = BTreeMap::new();

    for (index, partition) in partitions.into_iter().enumerate() {
        let candidates: Vec<&MemberId> = match excluded.get(&partition) {
            Some(failed) => members.iter().filter(|m| !failed.contains(*m)).collect(),
            None => members.iter().collect(),
        };

        if candidates.is_empty() {
            continue;
        }

        let member = candidates[index % candidates.len()].clone();
        assignments.insert(partition, member);
    }

    assignments
}

/// Keeps the published assignments of every event type led by this member up to date
pub struct Rebalancer {
    store: SharedCoordinationStore,
    keys: ConsumerKeys,
    feeds: HashMap<EventType, PartitionFeed>,
    tenures: DashMap<EventType, CancellationToken>,
}

impl Rebalancer {
    /// Creates a rebalancer which takes the partitions of each event type from the given feeds
    pub fn new(store: SharedCoordinationStore, keys: ConsumerKeys, feeds: HashMap<EventType, PartitionFeed>) -> Self {
        Self {
            store,
            keys,
            feeds,
            tenures: DashMap::new(),
        }
    }
}

impl LeadershipChangedListener<EventType> for Rebalancer {
    fn take_leadership(&self, event_type: &EventType) {
        let feed = match self.feeds.get(event_type) {
            Some(feed) => feed.clone(),
            None => {
                warn!(%event_type, "No partition feed, unable to assign partitions");
                return;
            }
        };

        let tenure = CancellationToken::new();
        if let Some(previous) = self.tenures.insert(event_type.clone(), tenure.clone()) {
            previous.cancel();
        }

        let assigner = Assigner {
            event_type: event_type.clone(),
            store: self.store.clone(),
            keys: self.keys.clone(),
            feed,
        };

        tokio::spawn(assigner.run(tenure));
    }

    fn relinquish_leadership(&self, event_type: &EventType) {
        if let Some((_, tenure)) = self.tenures.remove(event_type) {
            tenure.cancel();
        }
    }
}

/// Assignment loop of one event type during one tenure
struct Assigner {
    event_type: EventType,
    store: SharedCoordinationStore,
    keys: ConsumerKeys,
    feed: PartitionFeed,
}

impl Assigner {
    async fn run(mut self, tenure: CancellationToken) {
        let mut members = self.store.watch(&self.keys.members());
        let mut failures = self.store.watch(&self.keys.failures(&self.event_type));
        let mut assignments = self.store.watch(&self.keys.assignments(&self.event_type));
        let mut backoff = Backoff::jittered(Duration::from_millis(50), Duration::from_secs(5));

        debug!(event_type = %self.event_type, "Assigning partitions");

        loop {
            let retry = match self.rebalance(&tenure).await {
                Ok(_) => {
                    backoff.reset();
                    None
                }
                Err(error) => {
                    let wait = backoff.next().unwrap_or_else(|| Duration::from_secs(5));
                    warn!(event_type = %self.event_type, %error, ?wait, "Rebalance failed");
                    Some(wait)
                }
            };

            let retry = async move {
                match retry {
                    Some(wait) => sleep(wait).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                _ = tenure.cancelled() => break,
                Some(_) = members.changed() => {},
                Some(_) = failures.changed() => {},
                Some(_) = assignments.changed() => {},
                Ok(_) = self.feed.changed() => {},
                _ = retry => {},
            }
        }

        debug!(event_type = %self.event_type, "Stopped assigning partitions");
    }

    async fn live_members(&self) -> Result<Vec<MemberId>, CoordinationError> {
        Ok(self
            .store
            .children_if_exists(&self.keys.members())
            .await?
            .into_iter()
            .map(MemberId::new)
            .collect())
    }

    async fn failed_members(&self) -> Result<HashMap<PartitionId, HashSet<MemberId>>, CoordinationError> {
        let root = self.keys.failures(&self.event_type);
        let mut excluded = HashMap::new();

        for partition in self.store.children_if_exists(&root).await? {
            let partition = PartitionId::new(partition);
            let failed: HashSet<MemberId> = self
                .store
                .children_if_exists(&self.keys.partition_failures(&self.event_type, &partition))
                .await?
                .into_iter()
                .map(MemberId::new)
                .collect();

            if !failed.is_empty() {
                excluded.insert(partition, failed);
            }
        }

        Ok(excluded)
    }

    async fn published(&self) -> Result<BTreeMap<PartitionId, MemberId>, CoordinationError> {
        let root = self.keys.assignments(&self.event_type);
        let mut published = BTreeMap::new();

        for partition in self.store.children_if_exists(&root).await? {
            if let Some(owner) = self.store.get_data_if_exists(&join_path(&root, &partition)).await? {
                let owner = MemberId::new(String::from_utf8_lossy(&owner).into_owned());
                published.insert(PartitionId::new(partition), owner);
            }
        }

        Ok(published)
    }

    async fn rebalance(&self, tenure: &CancellationToken) -> Result<(), CoordinationError> {
        let latest = self.feed.borrow().clone();
        let partitions = match latest {
            Some(partitions) => partitions,
            None => {
                debug!(event_type = %self.event_type, "Waiting for partition discovery");
                return Ok(());
            }
        };

        let members = self.live_members().await?;
        let excluded = self.failed_members().await?;
        let desired = assign(&members, &partitions, &excluded);
        let published = self.published().await?;

        for (partition, member) in desired.iter() {
            if published.get(partition) != Some(member) && !self.publish(tenure, partition, member).await? {
                return Ok(());
            }
        }

        for partition in published.keys().filter(|p| !desired.contains_key(*p)) {
            if !self.revoke(tenure, partition).await? {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Assigns a partition. Returns false without writing if the tenure ends before the write completes.
    async fn publish(
        &self,
        tenure: &CancellationToken,
        partition: &PartitionId,
        member: &MemberId,
    ) -> Result<bool, CoordinationError> {
        let path = self.keys.assignment(&self.event_type, partition);

        tokio::select! {
            biased;
            _ = tenure.cancelled() => Ok(false),
            written = self.store.set_or_create(&path, member.as_str().as_bytes()) => {
                written?;
                info!(event_type = %self.event_type, %partition, %member, "Assigned partition");
                Ok(true)
            }
        }
    }

    /// Revokes the assignment of a partition, unless the tenure ends first
    async fn revoke(&self, tenure: &CancellationToken, partition: &PartitionId) -> Result<bool, CoordinationError> {
        let path = self.keys.assignment(&self.event_type, partition);

        tokio::select! {
            biased;
            _ = tenure.cancelled() => Ok(false),
            deleted = self.store.delete_if_exists(&path) => {
                deleted?;
                info!(event_type = %self.event_type, %partition, "Revoked assignment");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::coordination::{memory::MemoryEnsemble, CoordinationStore, CreateMode};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::{sync::watch, time::timeout};

    fn members(raw: &[&str]) -> Vec<MemberId> {
        raw.iter().map(|m| MemberId::new(*m)).collect()
    }

    fn partitions(raw: &[&str]) -> Vec<PartitionId> {
        raw.iter().map(|p| PartitionId::new(*p)).collect()
    }

    fn owners(assignments: &BTreeMap<PartitionId, MemberId>) -> Vec<(&str, &str)> {
        assignments
            .iter()
            .map(|(p, m)| (p.as_str(), m.as_str()))
            .collect()
    }

    #[test]
    fn distribute_round_robin_over_sorted_members() {
        let result = assign(&members(&["m2", "m1"]), &partitions(&["1", "0", "2"]), &HashMap::new());
        assert_eq!(owners(&result), vec![("0", "m1"), ("1", "m2"), ("2", "m1")]);
    }

    #[test]
    fn stay_balanced_within_one() {
        for member_count in 1..6 {
            for partition_count in 0..20 {
                let ms: Vec<MemberId> = (0..member_count).map(|i| MemberId::new(format!("m{}", i))).collect();
                let ps: Vec<PartitionId> = (0..partition_count).map(|i| PartitionId::new(i.to_string())).collect();

                let result = assign(&ms, &ps, &HashMap::new());
                let mut load: HashMap<&MemberId, usize> = ms.iter().map(|m| (m, 0)).collect();
                for member in result.values() {
                    *load.entry(member).or_default() += 1;
                }

                let max = load.values().max().copied().unwrap_or(0);
                let min = load.values().min().copied().unwrap_or(0);
                assert!(max - min <= 1, "{} members, {} partitions", member_count, partition_count);
                assert_eq!(result.len(), partition_count);
            }
        }
    }

    #[test]
    fn avoid_members_that_failed_a_partition() {
        let mut excluded = HashMap::new();
        excluded.insert(PartitionId::new("0"), members(&["m1"]).into_iter().collect());

        let result = assign(&members(&["m1", "m2"]), &partitions(&["0", "1"]), &excluded);
        assert_eq!(owners(&result), vec![("0", "m2"), ("1", "m2")]);

        excluded.insert(PartitionId::new("1"), members(&["m1", "m2"]).into_iter().collect());
        let result = assign(&members(&["m1", "m2"]), &partitions(&["0", "1"]), &excluded);
        assert_eq!(owners(&result), vec![("0", "m2")]);
    }

    #[test]
    fn leave_partitions_unassigned_without_members() {
        assert!(assign(&[], &partitions(&["0", "1"]), &HashMap::new()).is_empty());
    }

    async fn published(store: &dyn CoordinationStore, expected: Vec<(&str, &str)>) {
        timeout(Duration::from_secs(5), async {
            loop {
                let mut current = Vec::new();
                for child in store.children_if_exists("/consumers/c1/assignments/orders").await.unwrap() {
                    let owner = store
                        .get_data(&format!("/consumers/c1/assignments/orders/{}", child))
                        .await
                        .unwrap();
                    current.push((child, String::from_utf8(owner).unwrap()));
                }

                let expected: Vec<(String, String)> =
                    expected.iter().map(|(p, m)| (p.to_string(), m.to_string())).collect();
                if current == expected {
                    return;
                }

                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("assignments never converged");
    }

    #[tokio::test]
    async fn abandon_writes_when_deposed_mid_rebalance() {
        let ensemble = MemoryEnsemble::new();
        let store: SharedCoordinationStore = Arc::new(ensemble.connect());
        let (_feed_tx, feed) = watch::channel(Some(partitions(&["0"])));

        let assigner = Assigner {
            event_type: EventType::new("orders"),
            store: store.clone(),
            keys: ConsumerKeys::new("c1"),
            feed,
        };

        let tenure = CancellationToken::new();
        let frozen = ensemble.freeze().await;

        let deposed = tenure.clone();
        let write = tokio::spawn(async move {
            assigner
                .publish(&deposed, &PartitionId::new("0"), &MemberId::new("m1"))
                .await
        });

        sleep(Duration::from_millis(20)).await;
        tenure.cancel();

        let outcome = timeout(Duration::from_secs(1), write).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(false));

        drop(frozen);
        assert!(!store.exists("/consumers/c1/assignments/orders/0").await.unwrap());
    }

    #[tokio::test]
    async fn follow_members_and_partitions_while_leading() {
        let ensemble = MemoryEnsemble::new();
        let store: SharedCoordinationStore = Arc::new(ensemble.connect());
        let keys = ConsumerKeys::new("c1");
        let orders = EventType::new("orders");

        let (feed_tx, feed) = watch::channel(Some(partitions(&["0", "1"])));
        let mut feeds = HashMap::new();
        feeds.insert(orders.clone(), feed);

        store.create_parents(&keys.members()).await.unwrap();
        store
            .create(&keys.member(&"m1".into()), b"m1", CreateMode::Ephemeral)
            .await
            .unwrap();

        let rebalancer = Rebalancer::new(store.clone(), keys.clone(), feeds);
        rebalancer.take_leadership(&orders);
        published(store.as_ref(), vec![("0", "m1"), ("1", "m1")]).await;

        let m2 = ensemble.connect();
        m2.create(&keys.member(&"m2".into()), b"m2", CreateMode::Ephemeral)
            .await
            .unwrap();
        published(store.as_ref(), vec![("0", "m1"), ("1", "m2")]).await;

        feed_tx.send_replace(Some(partitions(&["0"])));
        published(store.as_ref(), vec![("0", "m1")]).await;

        m2.kill_session().await;
        feed_tx.send_replace(Some(partitions(&["0", "1"])));
        published(store.as_ref(), vec![("0", "m1"), ("1", "m1")]).await;

        rebalancer.relinquish_leadership(&orders);
    }
}
