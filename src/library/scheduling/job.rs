use super::JobManager;
use crate::library::EmptyResult;
use async_trait::async_trait;

/// Persistent execution unit
///
/// Jobs are restarted with an exponential backoff whenever they return an error.
/// In addition, jobs can support graceful shutdown and a ready state provided by the [`JobManager`] passed to the execute function.
#[async_trait]
pub trait Job {
    /// Name of the job displayed in log messages
    const NAME: &'static str;
    /// Whether or not the job honors the termination signal. When this is set to false the job will be terminated externally.
    const SUPPORTS_GRACEFUL_TERMINATION: bool = false;

    /// Name of this particular instance, defaults to [`Job::NAME`]
    fn name(&self) -> String {
        Self::NAME.to_owned()
    }

    /// Instance level override of [`Job::SUPPORTS_GRACEFUL_TERMINATION`]
    fn supports_graceful_termination(&self) -> bool {
        Self::SUPPORTS_GRACEFUL_TERMINATION
    }

    /// Runs the job until it either finishes, fails or is asked to terminate
    async fn execute(&self, manager: JobManager) -> EmptyResult;
}
