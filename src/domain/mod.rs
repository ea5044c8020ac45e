//! Broker specific structures, implementations, and logic
//!
//! Everything in here describes the vocabulary of the event broker and the layout consumers use
//! within the coordination store. None of it performs any I/O.

mod batch;
mod cursor;
mod keys;
mod member;
mod partition;
mod policy;

pub use batch::*;
pub use cursor::*;
pub use keys::*;
pub use member::*;
pub use partition::*;
pub use policy::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a stream schema at the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Creates a new event type from its name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
