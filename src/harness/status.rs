use crate::library::scheduling::{Job, JobManager, JobScheduler};
use crate::library::EmptyResult;
use async_trait::async_trait;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};
use tracing::info;

/// Health of a module as presented by the [`StatusServer`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Whether the module is fully functional
    pub operational: bool,
    /// Module specific details
    pub details: Value,
}

/// Source of [`HealthReport`]s
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Current health of the module
    async fn report(&self) -> HealthReport;
}

#[derive(Serialize)]
struct StatusDocument {
    status: &'static str,
    jobs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<Value>,
}

/// Job serving the health of the process as JSON
///
/// Responds with `200 OK` when every job is ready and the module reports itself operational
/// and with `503 Service Unavailable` otherwise.
pub struct StatusServer {
    port: u16,
    scheduler: JobScheduler,
    reporter: Option<Arc<dyn HealthReporter>>,
}

impl StatusServer {
    /// Creates a new status server job
    pub fn new(port: u16, scheduler: JobScheduler, reporter: Option<Arc<dyn HealthReporter>>) -> Self {
        Self {
            port,
            scheduler,
            reporter,
        }
    }
}

async fn status_response(
    scheduler: JobScheduler,
    reporter: Option<Arc<dyn HealthReporter>>,
) -> (StatusCode, StatusDocument) {
    let jobs = scheduler.status().await;
    let mut operational = jobs.values().all(|status| !status.is_degraded());

    let module = match reporter {
        Some(reporter) => {
            let report = reporter.report().await;
            operational &= report.operational;
            Some(report.details)
        }
        None => None,
    };

    let document = StatusDocument {
        status: if operational { "operational" } else { "degraded" },
        jobs: jobs
            .into_iter()
            .map(|(name, status)| (name, status.to_string()))
            .collect(),
        module,
    };

    let code = if operational {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, document)
}

async fn handle(
    request: Request<Body>,
    scheduler: JobScheduler,
    reporter: Option<Arc<dyn HealthReporter>>,
) -> Result<Response<Body>, Infallible> {
    let mut response = Response::new(Body::empty());

    match (request.method(), request.uri().path()) {
        (&Method::GET, "/status") | (&Method::GET, "/") => {
            let (code, document) = status_response(scheduler, reporter).await;

            match serde_json::to_vec(&document) {
                Ok(body) => {
                    *response.status_mut() = code;
                    *response.body_mut() = Body::from(body);
                    if let Ok(value) = "application/json".parse() {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                }
                Err(_) => *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
        _ => *response.status_mut() = StatusCode::NOT_FOUND,
    }

    Ok(response)
}

#[async_trait]
impl Job for StatusServer {
    const NAME: &'static str = "StatusServer";
    const SUPPORTS_GRACEFUL_TERMINATION: bool = true;

    async fn execute(&self, manager: JobManager) -> EmptyResult {
        let scheduler = self.scheduler.clone();
        let reporter = self.reporter.clone();

        let make_svc = make_service_fn(move |_| {
            let scheduler = scheduler.clone();
            let reporter = reporter.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle(request, scheduler.clone(), reporter.clone())
                }))
            }
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let server = Server::try_bind(&addr)?.serve(make_svc);
        let graceful = server.with_graceful_shutdown(manager.termination_signal());

        info!(%addr, "Status server listening");
        manager.ready().await;
        graceful.await?;

        Ok(())
    }
}
