//! This library crate contains everything needed to consume Nakadi event streams with a cohort of processes.
//!
//! Submodules have been introduced to split responsibilities. They form a chain of dependencies from the
//! low-level [`library`], over the broker specific [`domain`] vocabulary and the process [`harness`], up to the
//! [`consumer`] which coordinates partitions, offsets and leadership across processes.

#![warn(missing_docs)]

pub mod consumer;
pub mod domain;
pub mod harness;
pub mod library;
