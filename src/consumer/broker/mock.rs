use super::{BatchStream, BrokerClient, BrokerError};
use crate::domain::{Cursor, EventType, PartitionId, PartitionInfo, PartitionKey, SubscriptionCursor};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use hyper::body::Bytes;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Scripted broker serving pre-recorded batches
///
/// Streams deliver every recorded batch after the requested cursor and then stay open without
/// delivering anything else, like a quiet partition would.
#[derive(Default)]
pub struct MockBroker {
    partitions: Mutex<HashMap<EventType, Vec<PartitionId>>>,
    batches: Mutex<HashMap<PartitionKey, Vec<(Cursor, Bytes)>>>,
    opened: Mutex<Vec<(PartitionKey, Cursor)>>,
    cursors: Mutex<HashMap<String, Vec<SubscriptionCursor>>>,
    refused_streams: AtomicUsize,
    failed_discoveries: AtomicUsize,
}

impl MockBroker {
    pub fn set_partitions(&self, event_type: &str, partitions: &[&str]) {
        self.partitions.lock().unwrap().insert(
            event_type.into(),
            partitions.iter().map(|p| PartitionId::new(*p)).collect(),
        );
    }

    /// Records a batch with the given events
    pub fn publish(&self, event_type: &str, partition: &str, offset: &str, events: Vec<Value>) {
        let cursor = Cursor::new(partition.into(), offset);
        let line = json!({ "cursor": cursor, "events": events }).to_string();
        self.publish_raw(event_type, partition, offset, line.as_bytes());
    }

    /// Records a raw line which is delivered as-is
    pub fn publish_raw(&self, event_type: &str, partition: &str, offset: &str, line: &[u8]) {
        let key = PartitionKey::new(event_type.into(), partition.into());
        let cursor = Cursor::new(partition.into(), offset);

        self.batches
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push((cursor, Bytes::copy_from_slice(line)));
    }

    /// Makes the next `count` stream requests fail
    pub fn refuse_streams(&self, count: usize) {
        self.refused_streams.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` partition listings fail
    pub fn fail_discoveries(&self, count: usize) {
        self.failed_discoveries.store(count, Ordering::SeqCst);
    }

    /// Cursors at which streams have been opened, in order
    pub fn opened(&self, event_type: &str, partition: &str) -> Vec<String> {
        let key = PartitionKey::new(event_type.into(), partition.into());

        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, cursor)| cursor.offset.clone())
            .collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn partitions(&self, event_type: &EventType) -> Result<Vec<PartitionInfo>, BrokerError> {
        if MockBroker::take_failure(&self.failed_discoveries) {
            return Err(BrokerError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let partitions = self.partitions.lock().unwrap();
        let partitions = partitions.get(event_type).ok_or_else(|| BrokerError::Status {
            status: 404,
            body: format!("event type {} not found", event_type),
        })?;

        Ok(partitions
            .iter()
            .map(|partition| PartitionInfo {
                partition: partition.clone(),
                oldest_available_offset: None,
                newest_available_offset: None,
            })
            .collect())
    }

    async fn stream(&self, event_type: &EventType, cursor: &Cursor) -> Result<BatchStream, BrokerError> {
        let key = PartitionKey::new(event_type.clone(), cursor.partition.clone());
        self.opened.lock().unwrap().push((key.clone(), cursor.clone()));

        if MockBroker::take_failure(&self.refused_streams) {
            return Err(BrokerError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let lines: Vec<Result<Bytes, BrokerError>> = self
            .batches
            .lock()
            .unwrap()
            .get(&key)
            .map(|batches| {
                batches
                    .iter()
                    .filter(|(batch_cursor, _)| cursor.is_older_than(batch_cursor))
                    .map(|(_, line)| Ok(line.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(stream::iter(lines).chain(stream::pending()).boxed())
    }

    async fn fetch_cursors(&self, subscription: &str) -> Result<Vec<SubscriptionCursor>, BrokerError> {
        Ok(self
            .cursors
            .lock()
            .unwrap()
            .get(subscription)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_cursors(&self, subscription: &str, cursors: Vec<SubscriptionCursor>) -> Result<(), BrokerError> {
        let mut all = self.cursors.lock().unwrap();
        let stored = all.entry(subscription.to_owned()).or_default();

        for cursor in cursors {
            stored.retain(|c| !(c.event_type == cursor.event_type && c.partition == cursor.partition));
            stored.push(cursor);
        }

        Ok(())
    }
}
