use crate::library::codec::WireEnum;

/// Reaction of a partition worker to a batch that could not be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Commit the batch cursor and continue with the next batch
    Skip,
    /// Reopen the stream at the last committed cursor
    Retry,
    /// Stop the worker and hand the partition to another member
    Fail,
}

impl Default for HandlerErrorPolicy {
    fn default() -> Self {
        HandlerErrorPolicy::Fail
    }
}

impl WireEnum for HandlerErrorPolicy {
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("skip", HandlerErrorPolicy::Skip),
        ("retry", HandlerErrorPolicy::Retry),
        ("fail", HandlerErrorPolicy::Fail),
    ];
}

crate::wire_enum!(HandlerErrorPolicy);

/// Backend which persists consumed offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetStoreKind {
    /// Persistent nodes in the coordination store
    CoordinationStore,
    /// Subscription cursor endpoints of the broker
    Broker,
}

impl Default for OffsetStoreKind {
    fn default() -> Self {
        OffsetStoreKind::CoordinationStore
    }
}

impl WireEnum for OffsetStoreKind {
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("coordination_store", OffsetStoreKind::CoordinationStore),
        ("broker", OffsetStoreKind::Broker),
    ];
}

crate::wire_enum!(OffsetStoreKind);
