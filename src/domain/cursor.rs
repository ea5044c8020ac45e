use super::{EventType, PartitionId};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// Offset value which makes the broker stream a partition from its oldest retained event
pub const BEGIN: &str = "BEGIN";

/// Position within a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Cursor {
    /// Partition the position belongs to
    pub partition: PartitionId,
    /// Opaque, broker-defined offset
    pub offset: String,
}

impl Cursor {
    /// Creates a new cursor
    pub fn new(partition: PartitionId, offset: impl Into<String>) -> Self {
        Self {
            partition,
            offset: offset.into(),
        }
    }

    /// Cursor that points before the first retained event
    pub fn begin(partition: PartitionId) -> Self {
        Self::new(partition, BEGIN)
    }

    /// Whether this is the special [`BEGIN`] cursor
    pub fn is_begin(&self) -> bool {
        self.offset.eq_ignore_ascii_case(BEGIN)
    }

    /// Comparable sequence derived from the offset
    pub fn sequence(&self) -> CursorSequence {
        CursorSequence::parse(&self.offset)
    }

    /// Whether this cursor is strictly behind `other`. Cursors that can't be compared are never older.
    pub fn is_older_than(&self, other: &Cursor) -> bool {
        matches!(
            self.sequence().partial_cmp(&other.sequence()),
            Some(Ordering::Less)
        )
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Cursor as exchanged with the subscription cursor endpoints of the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubscriptionCursor {
    /// Event type the cursor belongs to
    pub event_type: EventType,
    /// Partition within the event type
    pub partition: PartitionId,
    /// Opaque, broker-defined offset
    pub offset: String,
}

impl SubscriptionCursor {
    /// Combines an event type and cursor
    pub fn new(event_type: EventType, cursor: Cursor) -> Self {
        Self {
            event_type,
            partition: cursor.partition,
            offset: cursor.offset,
        }
    }

    /// Strips the event type
    pub fn into_cursor(self) -> Cursor {
        Cursor::new(self.partition, self.offset)
    }
}

/// Envelope of the subscription cursor endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursorList {
    /// Contained cursors
    #[serde(default)]
    pub items: Vec<SubscriptionCursor>,
}

/// Local, comparable interpretation of a cursor offset
///
/// Offsets are split at `-` and every segment is read as a number, thus both `123` and
/// `001-0001-000000000000000123` are understood. Offsets that don't parse are opaque and
/// incomparable to anything but [`CursorSequence::Begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorSequence {
    /// Before every event
    Begin,
    /// Numeric position
    Position(Vec<u64>),
    /// Unknown offset format
    Opaque,
}

impl CursorSequence {
    /// Interprets a raw offset
    pub fn parse(offset: &str) -> Self {
        if offset.eq_ignore_ascii_case(BEGIN) {
            return CursorSequence::Begin;
        }

        offset
            .split('-')
            .map(|segment| segment.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
            .map(CursorSequence::Position)
            .unwrap_or(CursorSequence::Opaque)
    }
}

impl PartialOrd for CursorSequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use CursorSequence::*;

        match (self, other) {
            (Begin, Begin) => Some(Ordering::Equal),
            (Begin, _) => Some(Ordering::Less),
            (_, Begin) => Some(Ordering::Greater),
            (Position(a), Position(b)) if a.len() == b.len() => Some(a.cmp(b)),
            // Plain numbers compare against the last segment of the structured format
            (Position(a), Position(b)) if a.len() == 1 || b.len() == 1 => {
                Some(a.last()?.cmp(b.last()?))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    fn cursor(offset: &str) -> Cursor {
        Cursor::new(PartitionId::new("0"), offset)
    }

    #[test]
    fn compare_numerically_not_lexically() {
        assert!(cursor("9").is_older_than(&cursor("10")));
        assert!(!cursor("10").is_older_than(&cursor("9")));
        assert!(!cursor("10").is_older_than(&cursor("10")));
    }

    #[test]
    fn compare_structured_offsets() {
        assert!(cursor("001-0001-000000000000000099").is_older_than(&cursor("001-0001-000000000000000100")));
        assert!(cursor("001-0001-000000000000000099").is_older_than(&cursor("001-0002-000000000000000000")));
    }

    #[test]
    fn order_begin_first() {
        assert!(cursor("BEGIN").is_older_than(&cursor("0")));
        assert!(cursor("begin").is_begin());
        assert!(!cursor("0").is_older_than(&cursor("BEGIN")));
    }

    #[test]
    fn never_reject_opaque_offsets() {
        assert_eq!(cursor("abc").sequence(), CursorSequence::Opaque);
        assert!(!cursor("abc").is_older_than(&cursor("10")));
        assert!(!cursor("10").is_older_than(&cursor("abc")));
    }
}
