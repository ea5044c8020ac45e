use crate::domain::MemberId;
use crate::library::coordination::{
    election::{LeaderSelector, LeaderSelectorListener},
    CoordinationError, CoordinationStoreExt, SharedCoordinationStore,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiver of leadership changes for a group key
pub trait LeadershipChangedListener<K>: Send + Sync + 'static {
    /// This member now leads the group
    fn take_leadership(&self, key: &K);

    /// This member no longer leads the group. Called exactly once after every [`take_leadership`](Self::take_leadership).
    fn relinquish_leadership(&self, key: &K);
}

type PathFn<K> = Arc<dyn Fn(&K) -> String + Send + Sync>;

struct LeaderControl {
    selector: LeaderSelector,
    leader: Arc<AtomicBool>,
}

struct Tenure<K> {
    key: K,
    store: SharedCoordinationStore,
    member: MemberId,
    info_path: String,
    leader: Arc<AtomicBool>,
    delegate: Arc<dyn LeadershipChangedListener<K>>,
}

/// Resets the local view of a tenure on every exit path
struct TenureGuard<'a, K: 'static> {
    tenure: &'a Tenure<K>,
}

impl<'a, K: 'static> Drop for TenureGuard<'a, K> {
    fn drop(&mut self) {
        self.tenure.delegate.relinquish_leadership(&self.tenure.key);
        self.tenure.leader.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K> LeaderSelectorListener for Tenure<K>
where
    K: Display + Send + Sync + 'static,
{
    async fn take_leadership(&self, tenure: CancellationToken) {
        if let Err(error) = self
            .store
            .set_or_create(&self.info_path, self.member.as_str().as_bytes())
            .await
        {
            warn!(group = %self.key, %error, "Unable to publish leadership info");
        }

        let _guard = TenureGuard { tenure: self };
        self.delegate.take_leadership(&self.key);
        self.leader.store(true, Ordering::SeqCst);
        info!(group = %self.key, member = %self.member, "Took leadership");

        tenure.cancelled().await;
        info!(group = %self.key, member = %self.member, "Relinquishing leadership");
    }
}

/// Runs one leader election per group key
///
/// Keys are turned into coordination store paths by the two functions passed at construction, one for the
/// election itself and one for the informational node naming the current leader.
pub struct LeaderCoordinator<K> {
    store: SharedCoordinationStore,
    member: MemberId,
    election_path: PathFn<K>,
    info_path: PathFn<K>,
    controls: DashMap<K, Arc<LeaderControl>>,
}

impl<K> LeaderCoordinator<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Creates a coordinator acting on behalf of `member`
    pub fn new(
        store: SharedCoordinationStore,
        member: MemberId,
        election_path: impl Fn(&K) -> String + Send + Sync + 'static,
        info_path: impl Fn(&K) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            member,
            election_path: Arc::new(election_path),
            info_path: Arc::new(info_path),
            controls: DashMap::new(),
        }
    }

    fn control(&self, key: &K) -> Option<Arc<LeaderControl>> {
        self.controls.get(key).map(|entry| entry.value().clone())
    }

    /// Enters the election of a group. Returns false if this member already takes part in it.
    pub async fn init_group_leadership(&self, key: K, delegate: Arc<dyn LeadershipChangedListener<K>>) -> bool {
        let control = match self.controls.entry(key.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                let leader = Arc::new(AtomicBool::new(false));
                let tenure = Tenure {
                    key: key.clone(),
                    store: self.store.clone(),
                    member: self.member.clone(),
                    info_path: (self.info_path)(&key),
                    leader: leader.clone(),
                    delegate,
                };

                let selector = LeaderSelector::new(
                    self.store.clone(),
                    (self.election_path)(&key),
                    self.member.as_str(),
                    Arc::new(tenure),
                );

                let control = Arc::new(LeaderControl { selector, leader });
                entry.insert(control.clone());
                control
            }
        };

        debug!(group = %key, path = %control.selector.path(), "Entering election");
        control.selector.start().await;
        true
    }

    /// Every member taking part in the election of a group, mapped to whether it currently leads
    pub async fn participants(&self, key: &K) -> Result<HashMap<String, bool>, CoordinationError> {
        match self.control(key) {
            Some(control) => Ok(control
                .selector
                .participants()
                .await?
                .into_iter()
                .map(|participant| (participant.id, participant.is_leader))
                .collect()),
            None => Ok(HashMap::new()),
        }
    }

    /// Leaves the election of a group. The control entry stays in place until the selector is closed.
    pub async fn close_group_leadership(&self, key: &K) {
        if let Some(control) = self.control(key) {
            control.selector.close().await;
            self.controls.remove(key);
            debug!(group = %key, "Left election");
        }
    }

    /// Ends the current tenure of a group, if any, so that this member enqueues again
    pub fn requeue(&self, key: &K) {
        if let Some(control) = self.control(key) {
            info!(group = %key, "Re-entering election");
            control.selector.interrupt_leadership();
        }
    }

    /// Whether this member currently leads a group
    pub fn is_leader(&self, key: &K) -> bool {
        self.control(key)
            .map(|control| control.leader.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Groups this member currently leads
    pub fn leaderships(&self) -> Vec<K> {
        self.controls
            .iter()
            .filter(|entry| entry.value().leader.load(Ordering::SeqCst))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Gives up every leadership and stops enqueueing again, without waiting for the tenures to end
    pub fn relinquish_all(&self) {
        let controls: Vec<Arc<LeaderControl>> = self.controls.iter().map(|entry| entry.value().clone()).collect();

        for control in controls {
            control.selector.leave();
        }
    }

    /// Leaves every election, waiting for each selector to close
    pub async fn close(&self) {
        let keys: Vec<K> = self.controls.iter().map(|entry| entry.key().clone()).collect();

        for key in keys {
            self.close_group_leadership(&key).await;
        }
    }
}
