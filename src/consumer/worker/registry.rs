use super::{PartitionWorker, WorkerContext, WorkerControl, WorkerState};
use crate::domain::{EventType, PartitionId, PartitionKey};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info};

/// Workers owned by this member, at most one per partition
pub struct WorkerRegistry {
    drain_timeout: Duration,
    workers: DashMap<PartitionKey, WorkerControl>,
}

impl WorkerRegistry {
    /// Creates an empty registry. Stopped workers get `drain_timeout` to close before they are aborted.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            workers: DashMap::new(),
        }
    }

    /// Starts a worker unless the partition already has one. Returns whether a worker has been started.
    pub fn start_if_absent(&self, key: PartitionKey, ctx: WorkerContext) -> bool {
        match self.workers.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                info!(partition = %entry.key(), "Starting worker");
                let control = PartitionWorker::spawn(entry.key().clone(), ctx);
                entry.insert(control);
                true
            }
        }
    }

    /// Drains the worker of a partition and waits for it to close. Returns false if it had to be aborted.
    pub async fn stop(&self, key: &PartitionKey) -> bool {
        match self.workers.remove(key) {
            Some((_, control)) => {
                info!(partition = %key, "Stopping worker");
                control.drain();
                control.closed(self.drain_timeout).await
            }
            None => true,
        }
    }

    /// Stops every worker of an event type
    pub async fn stop_event_type(&self, event_type: &EventType) {
        let stopping = self
            .partitions_of(event_type)
            .into_iter()
            .map(|partition| PartitionKey::new(event_type.clone(), partition))
            .collect::<Vec<_>>();

        join_all(stopping.iter().map(|key| self.stop(key))).await;
    }

    /// Asks every worker to drain without waiting for it
    pub fn signal_drain_all(&self) {
        for entry in self.workers.iter() {
            entry.value().drain();
        }
    }

    /// Waits up to `grace_period` for every worker to close, aborting the rest.
    /// Returns the partitions whose workers did not close in time.
    pub async fn await_drained(&self, grace_period: Duration) -> Vec<PartitionKey> {
        let keys: Vec<PartitionKey> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        let controls: Vec<WorkerControl> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key).map(|(_, control)| control))
            .collect();

        debug!(workers = controls.len(), ?grace_period, "Awaiting workers");

        let closed = join_all(controls.into_iter().map(|control| async move {
            control.drain();
            let key = control.key().clone();
            (key, control.closed(grace_period).await)
        }))
        .await;

        let mut undrained: Vec<PartitionKey> = closed
            .into_iter()
            .filter(|(_, closed)| !closed)
            .map(|(key, _)| key)
            .collect();

        undrained.sort();
        undrained
    }

    /// State of every worker
    pub fn states(&self) -> BTreeMap<PartitionKey, WorkerState> {
        self.workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Partitions of an event type which currently have a worker
    pub fn partitions_of(&self, event_type: &EventType) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|entry| &entry.key().event_type == event_type)
            .map(|entry| entry.key().partition.clone())
            .collect();

        partitions.sort();
        partitions
    }

    /// Whether no worker is registered
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
