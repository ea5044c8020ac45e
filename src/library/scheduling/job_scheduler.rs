use super::{Job, JobManager};
use crate::library::backoff::Backoff;
use futures::{
    channel::oneshot::Receiver as OneShotReceiver,
    future::{abortable, AbortHandle},
    lock::Mutex,
};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{sync::watch::Sender as WatchSender, task, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

type StatusMap = Arc<Mutex<HashMap<String, JobStatus>>>;

/// State in which a job currently resides
#[derive(Debug, Clone)]
pub enum JobStatus {
    /// Job has started and is ready to fulfill contracts. Contains graceful termination handle if supported.
    Ready(Option<Arc<WatchSender<bool>>>),
    /// Job has never started and is in the process of getting ready
    Startup,
    /// Job was restarted after a crash and is getting ready
    Restarting,
    /// Job has exited with an error and is currently waiting before it retries
    CrashLoopBackOff,
    /// Job has exceeded its crash loop limit or was terminated forcefully
    Terminated,
    /// Job has exited cleanly
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            JobStatus::Ready(_) => write!(f, "Ready"),
            JobStatus::Startup => write!(f, "Startup"),
            JobStatus::Restarting => write!(f, "Restarting"),
            JobStatus::CrashLoopBackOff => write!(f, "CrashLoopBackOff"),
            JobStatus::Terminated => write!(f, "Terminated"),
            JobStatus::Finished => write!(f, "Finished"),
        }
    }
}

impl PartialEq for JobStatus {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (JobStatus::Ready(_), JobStatus::Ready(_))
                | (JobStatus::Startup, JobStatus::Startup)
                | (JobStatus::Restarting, JobStatus::Restarting)
                | (JobStatus::CrashLoopBackOff, JobStatus::CrashLoopBackOff)
                | (JobStatus::Terminated, JobStatus::Terminated)
                | (JobStatus::Finished, JobStatus::Finished)
        )
    }
}

impl Eq for JobStatus {}

impl JobStatus {
    fn is_gracefully_terminatable(&self) -> bool {
        matches!(*self, JobStatus::Ready(Some(_)))
    }

    /// Whether the job is in a state that degrades the service
    pub fn is_degraded(&self) -> bool {
        matches!(
            *self,
            JobStatus::Startup
                | JobStatus::Restarting
                | JobStatus::CrashLoopBackOff
                | JobStatus::Terminated
        )
    }
}

/// Job lifecycle handler
#[derive(Default, Clone)]
pub struct JobScheduler {
    status: StatusMap,
    termination_handles: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl JobScheduler {
    fn add_status_watcher(
        readiness_rx: OneShotReceiver<()>,
        termination_tx: Option<Arc<WatchSender<bool>>>,
        status_map: StatusMap,
        job_name: String,
    ) -> JoinHandle<()> {
        task::spawn(async move {
            if readiness_rx.await.is_ok() {
                JobScheduler::change_status(&status_map, &job_name, JobStatus::Ready(termination_tx))
                    .await;
            }
        })
    }

    async fn change_status(status_map: &StatusMap, job_name: &str, status: JobStatus) {
        info!(job = job_name, %status, "Job status changed");
        status_map.lock().await.insert(job_name.to_owned(), status);
    }

    async fn manage_job_lifecycle<J: 'static + Job + Send + Sync>(job: Arc<J>, status_map: StatusMap) {
        let job_name = job.name();
        let mut backoff = Backoff::default();

        JobScheduler::change_status(&status_map, &job_name, JobStatus::Startup).await;
        loop {
            let (manager, readiness_rx, termination_tx) = JobManager::new();
            let termination_tx = Arc::new(termination_tx);

            let graceful_handle = if job.supports_graceful_termination() {
                Some(termination_tx.clone())
            } else {
                None
            };

            let status_handle = JobScheduler::add_status_watcher(
                readiness_rx,
                graceful_handle,
                status_map.clone(),
                job_name.clone(),
            );

            let result = job.execute(manager).await;
            status_handle.abort();

            // Keep the termination sender alive until the execution has returned
            drop(termination_tx);

            match result {
                Ok(_) => {
                    JobScheduler::change_status(&status_map, &job_name, JobStatus::Finished).await;
                    status_map.lock().await.remove(&job_name);
                    break;
                }
                Err(e) => {
                    error!(job = %job_name, error = %e, "Job crashed");
                    JobScheduler::change_status(&status_map, &job_name, JobStatus::CrashLoopBackOff)
                        .await;

                    if let Some(sleep_duration) = backoff.next() {
                        debug!(job = %job_name, ?sleep_duration, "Backing off");
                        sleep(sleep_duration).await;
                    } else {
                        error!(job = %job_name, "Job exceeded its retry limit");
                        JobScheduler::change_status(&status_map, &job_name, JobStatus::Terminated)
                            .await;
                        return;
                    }
                }
            }

            JobScheduler::change_status(&status_map, &job_name, JobStatus::Restarting).await;
        }
    }

    /// Manage a new job
    ///
    /// This method respawns the job if it crashes and keeps track of its lifecycle.
    pub async fn spawn_job<J: 'static + Job + Send + Sync>(&self, job: J) {
        let status_map = self.status.clone();
        let termination_handles = self.termination_handles.clone();
        let job_name = job.name();

        let (job_lifecycle, termination_handle) = abortable(JobScheduler::manage_job_lifecycle(
            Arc::new(job),
            status_map.clone(),
        ));

        // Register the handle before spawning so that an early termination request can't be missed
        termination_handles
            .lock()
            .await
            .insert(job_name.clone(), termination_handle);

        task::spawn(async move {
            if job_lifecycle.await.is_err() {
                JobScheduler::change_status(&status_map, &job_name, JobStatus::Terminated).await;
            }

            termination_handles.lock().await.remove(&job_name);
            status_map.lock().await.remove(&job_name);
        });
    }

    /// Snapshot of the status of every managed job
    pub async fn status(&self) -> HashMap<String, JobStatus> {
        self.status.lock().await.clone()
    }

    /// Gracefully terminates all managed jobs that support it, waiting at most `grace_period`
    /// before the remaining ones are aborted.
    pub async fn terminate_jobs(&self, grace_period: Duration) {
        // 1. Send termination signal to jobs that support graceful shutdown and terminate ones that don't (or ones that aren't running)
        {
            let termination_handles = self.termination_handles.lock().await;
            let status = self.status.lock().await;

            for (job_name, handle) in termination_handles.iter() {
                match status.get(job_name) {
                    Some(JobStatus::Ready(Some(graceful_handle))) => {
                        graceful_handle.send(true).ok();
                    }
                    _ => handle.abort(),
                }
            }
        }

        // 2. Give alive jobs some time to gracefully terminate
        let poll_interval = Duration::from_millis(10);
        let mut remaining = grace_period;

        loop {
            let pending = {
                let termination_handles = self.termination_handles.lock().await;
                let status = self.status.lock().await;

                // Jobs which crashed during graceful termination are not worth waiting for
                termination_handles
                    .keys()
                    .filter(|job_name| {
                        status
                            .get(*job_name)
                            .map(JobStatus::is_gracefully_terminatable)
                            .unwrap_or(false)
                    })
                    .count()
            };

            if pending == 0 || remaining.is_zero() {
                break;
            }

            sleep(poll_interval).await;
            remaining = remaining.saturating_sub(poll_interval);
        }

        // 3. Call termination handle for all remaining jobs
        for (job_name, handle) in self.termination_handles.lock().await.iter() {
            warn!(job = %job_name, "Job ignored graceful termination request");
            handle.abort()
        }
    }
}
