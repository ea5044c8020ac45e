//! Coordinated, partition-aware consumption of event streams
//!
//! A [`Consumer`] registers the process as a member of a consumer group in the coordination store and
//! takes part in one leader election per event type. The leader of an event type assigns its partitions
//! to the live members. Every member follows the published assignments and runs one
//! [`PartitionWorker`](worker::PartitionWorker) per partition it owns. Workers stream batches from the
//! broker, hand them to the [`EventDispatcher`] and commit the resulting cursors to an [`OffsetStore`].
//!
//! ```text
//! discovery ──▶ leader/rebalance ──▶ assignments ──▶ follower ──▶ worker ──▶ dispatch ──▶ handler
//!                                                                   │
//!                                                                   └──▶ offsets
//! ```

mod discovery;
mod dispatch;
mod error;
mod follower;
mod leader;
mod lifecycle;
mod module;
mod offset;
mod options;
mod rebalance;

pub mod broker;
pub mod worker;

#[cfg(test)]
mod scenarios;

pub use discovery::*;
pub use dispatch::*;
pub use error::*;
pub use follower::*;
pub use leader::*;
pub use lifecycle::*;
pub use module::*;
pub use offset::*;
pub use options::*;
pub use rebalance::*;
