//! Job handling and scheduling structs
//!
//! A [`Job`] is a persistent execution unit which is restarted with a backoff when it crashes.
//! Jobs signal readiness and honor graceful termination through the [`JobManager`] passed into them.

mod job;
mod job_manager;
mod job_scheduler;

pub use job::Job;
pub use job_manager::JobManager;
pub use job_scheduler::{JobScheduler, JobStatus};
