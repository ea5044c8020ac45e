use super::{Cursor, PartitionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group of events emitted by the broker for one partition
///
/// Batches without events are keep-alive messages which only carry the current cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Batch<E = Value> {
    /// Position after the last event in this batch
    pub cursor: Cursor,
    /// Events in broker order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<E>>,
    /// Debugging information attached by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl<E> Batch<E> {
    /// Whether the batch carries no events
    pub fn is_keep_alive(&self) -> bool {
        self.events.as_ref().map(Vec::is_empty).unwrap_or(true)
    }

    /// Number of contained events
    pub fn len(&self) -> usize {
        self.events.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Same as [`Batch::is_keep_alive`]
    pub fn is_empty(&self) -> bool {
        self.is_keep_alive()
    }

    /// Partition the batch belongs to
    pub fn partition(&self) -> &PartitionId {
        &self.cursor.partition
    }
}

impl Batch<Value> {
    /// Decodes a single line received from the broker
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_event_batches() {
        let batch = Batch::from_line(
            br#"{"cursor":{"partition":"0","offset":"10"},"events":[{"order_number":"o1"},{"order_number":"o2"}]}"#,
        )
        .unwrap();

        assert_eq!(batch.cursor, Cursor::new("0".into(), "10"));
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_keep_alive());
    }

    #[test]
    fn recognize_keep_alives() {
        let batch = Batch::from_line(br#"{"cursor":{"partition":"3","offset":"BEGIN"}}"#).unwrap();

        assert!(batch.is_keep_alive());
        assert_eq!(batch.partition(), &PartitionId::new("3"));
    }

    #[test]
    fn reject_batches_without_cursor() {
        assert!(Batch::from_line(br#"{"events":[]}"#).is_err());
    }
}
