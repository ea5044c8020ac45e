//! Independent and project agnostic libraries
//!
//! Ideally, any of the library submodules in this module can be extracted into their own crate
//! at any given time. Libraries in this module have been developed with the consumer in mind,
//! however, they are in no way bound to Nakadi and everything broker specific lives in the
//! [`domain`](super::domain) module.

pub mod backoff;
pub mod codec;
pub mod coordination;
pub mod helpers;
pub mod scheduling;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
