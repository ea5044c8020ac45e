use super::EventType;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// Identifier of a partition within an event type
///
/// Ordering is numeric when both identifiers are numbers (so that `"10"` sorts after `"9"`)
/// and lexicographic otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Creates an identifier from its raw representation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for PartitionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for PartitionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Partition descriptor as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PartitionInfo {
    /// Identifier of the partition
    pub partition: PartitionId,
    /// Offset of the oldest event still retained by the broker
    #[serde(default)]
    pub oldest_available_offset: Option<String>,
    /// Offset of the most recently published event
    #[serde(default)]
    pub newest_available_offset: Option<String>,
}

/// Globally unique partition reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    /// Event type the partition belongs to
    pub event_type: EventType,
    /// Partition within the event type
    pub partition: PartitionId,
}

impl PartitionKey {
    /// Creates a new key
    pub fn new(event_type: EventType, partition: PartitionId) -> Self {
        Self {
            event_type,
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_type, self.partition)
    }
}
