use super::{DeathReason, HealthReporter, Heart, StatusServer};
use crate::library::scheduling::JobScheduler;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Long-running unit of work driven by a [`ModuleRunner`]
///
/// The runner calls [`pre_startup`](Module::pre_startup), then [`run`](Module::run), waits for the returned
/// [`Heart`] to die and finally calls [`post_shutdown`](Module::post_shutdown), which is invoked even if an
/// earlier phase failed.
#[async_trait]
pub trait Module {
    /// Prepares the module, failing here skips the run phase
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Starts the work of the module
    ///
    /// Background work should be handed to the scheduler or other tasks. Returning a [`Heart`] keeps the
    /// module alive until it dies, returning `None` shuts the module down right away.
    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError>;

    /// Source of the health report served by the status server
    fn health_reporter(&self) -> Option<Arc<dyn HealthReporter>> {
        None
    }

    /// Cleans up after every job of the runner has been terminated
    async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) {
        if termination_reason.is_clean() {
            info!(reason = %termination_reason, "Module exited");
        } else {
            error!(reason = %termination_reason, "Module terminated with an error");
        }
    }
}

/// Reason why a module has terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// [`Module::pre_startup`] returned an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// [`Module::run`] returned an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] returned by the module died
    #[error("heart provided by module died: {0}")]
    HeartDied(DeathReason),
    /// Run phase finished without handing out a heart
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Startup took longer than allowed
    #[error("timeout during startup")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the module terminated without any error
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally
        )
    }
}

/// Drives a [`Module`] through its lifecycle
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    status_server_port: Option<u16>,
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            status_server_port: None,
        }
    }
}

impl ModuleRunner {
    /// Creates a runner with default timeouts which serves the health of the module on `port`
    pub fn new_with_status_server(status_server_port: u16) -> Self {
        Self {
            status_server_port: Some(status_server_port),
            ..Default::default()
        }
    }

    /// Upper bound for [`Module::pre_startup`]
    pub fn startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Upper bound for [`Module::post_shutdown`]
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Executes a module until it exits and returns whether it terminated cleanly
    #[instrument(skip(self, module), fields(module = type_name::<M>()))]
    pub async fn run<M: Module + Send + Sync>(&self, mut module: M) -> bool {
        let scheduler = JobScheduler::default();

        if let Some(port) = self.status_server_port {
            info!(port, "Spawning status server");
            let status_server = StatusServer::new(port, scheduler.clone(), module.health_reporter());
            scheduler.spawn_job(status_server).await;
        }

        let termination_reason = match self.start(&mut module).await {
            Ok(_) => ModuleRunner::operate(&mut module, &scheduler).await,
            Err(reason) => reason,
        };

        info!("Terminating remaining jobs");
        scheduler.terminate_jobs(Duration::from_secs(5)).await;

        let clean = termination_reason.is_clean();

        info!("Commencing module shutdown sequence");
        if timeout(self.shutdown_timeout, module.post_shutdown(termination_reason))
            .await
            .is_err()
        {
            error!(timeout = ?self.shutdown_timeout, "Module shutdown sequence timed out");
            return false;
        }

        clean
    }

    async fn start<M: Module + Send + Sync>(&self, module: &mut M) -> Result<(), ModuleTerminationReason> {
        info!("Commencing module startup sequence");

        match timeout(self.startup_timeout, module.pre_startup()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => {
                error!(%error, "Module startup sequence encountered an error");
                Err(ModuleTerminationReason::StartupFailed(error))
            }
            Err(_) => {
                error!(timeout = ?self.startup_timeout, "Module startup sequence timed out");
                Err(ModuleTerminationReason::Timeout)
            }
        }
    }

    async fn operate<M: Module + Send + Sync>(module: &mut M, scheduler: &JobScheduler) -> ModuleTerminationReason {
        info!("Executing module run procedure");

        match module.run(scheduler).await {
            Ok(None) => {
                debug!("Module run procedure completed");
                ModuleTerminationReason::ExitedNormally
            }
            Ok(Some(mut heart)) => {
                debug!("Module run procedure completed, waiting for its heart to die");
                let death_reason = heart.death().await;
                info!(%death_reason, "Heart provided by run procedure died");
                ModuleTerminationReason::HeartDied(death_reason)
            }
            Err(error) => {
                error!(%error, "Module run procedure encountered an error");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}
