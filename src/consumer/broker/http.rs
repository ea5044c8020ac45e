use super::{frame_lines, BatchStream, BrokerClient, BrokerError};
use crate::domain::{Cursor, EventType, PartitionInfo, SubscriptionCursor, SubscriptionCursorList};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use hyper::{
    client::HttpConnector,
    header::{AUTHORIZATION, CONTENT_TYPE},
    Body, Client, Method, Request, Response,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument};

const CURSORS_HEADER: &str = "X-Nakadi-Cursors";

/// [`BrokerClient`] talking to the broker over plain HTTP
#[derive(Clone)]
pub struct HyperBrokerClient {
    client: Client<HttpConnector>,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HyperBrokerClient {
    /// Creates a client for the broker at `base_url`, e.g. `http://nakadi:8080`
    pub fn new(base_url: impl Into<String>, token: Option<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
            request_timeout,
        }
    }

    fn request(&self, method: Method, path: &str) -> hyper::http::request::Builder {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path));

        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        builder
    }

    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, BrokerError> {
        let response = timeout(self.request_timeout, self.client.request(request)).await??;
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let body = timeout(self.request_timeout, hyper::body::to_bytes(response.into_body()))
                .await?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();

            Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response<Body>) -> Result<T, BrokerError> {
        let bytes = timeout(self.request_timeout, hyper::body::to_bytes(response.into_body())).await??;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl BrokerClient for HyperBrokerClient {
    #[instrument(skip(self), fields(%event_type))]
    async fn partitions(&self, event_type: &EventType) -> Result<Vec<PartitionInfo>, BrokerError> {
        let request = self
            .request(Method::GET, &format!("/event-types/{}/partitions", event_type))
            .body(Body::empty())?;

        let response = self.send(request).await?;
        self.read_json(response).await
    }

    async fn stream(&self, event_type: &EventType, cursor: &Cursor) -> Result<BatchStream, BrokerError> {
        let cursors = serde_json::to_string(&[cursor])?;
        debug!(%event_type, %cursor, "Opening partition stream");

        let request = self
            .request(Method::GET, &format!("/event-types/{}/events", event_type))
            .header(CURSORS_HEADER, cursors)
            .body(Body::empty())?;

        let response = self.send(request).await?;
        let body = response.into_body().map_err(BrokerError::from);

        Ok(frame_lines(body).boxed())
    }

    async fn fetch_cursors(&self, subscription: &str) -> Result<Vec<SubscriptionCursor>, BrokerError> {
        let request = self
            .request(Method::GET, &format!("/subscriptions/{}/cursors", subscription))
            .body(Body::empty())?;

        let response = self.send(request).await?;
        let list: SubscriptionCursorList = self.read_json(response).await?;

        Ok(list.items)
    }

    async fn commit_cursors(&self, subscription: &str, cursors: Vec<SubscriptionCursor>) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(&SubscriptionCursorList { items: cursors })?;
        let request = self
            .request(Method::POST, &format!("/subscriptions/{}/cursors", subscription))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;

        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use hyper::{
        service::{make_service_fn, service_fn},
        Server, StatusCode,
    };
    use std::{
        convert::Infallible,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    type Seen = Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>;

    async fn serve(seen: Seen) -> SocketAddr {
        let make_svc = make_service_fn(move |_| {
            let seen = seen.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    let seen = seen.clone();

                    async move {
                        let header = |name: &str| {
                            request
                                .headers()
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_owned)
                        };

                        seen.lock().unwrap().push((
                            request.uri().path().to_owned(),
                            header(CURSORS_HEADER),
                            header("authorization"),
                        ));

                        let response = match request.uri().path() {
                            "/event-types/orders/partitions" => Response::new(Body::from(
                                r#"[{"partition":"0","oldest_available_offset":"0","newest_available_offset":"7"}]"#,
                            )),
                            "/event-types/orders/events" => Response::new(Body::from(
                                "{\"cursor\":{\"partition\":\"0\",\"offset\":\"10\"},\"events\":[{}]}\n\n{\"cursor\":{\"partition\":\"0\",\"offset\":\"11\"}}\n",
                            )),
                            _ => {
                                let mut response = Response::new(Body::from("{\"title\":\"Not Found\"}"));
                                *response.status_mut() = StatusCode::NOT_FOUND;
                                response
                            }
                        };

                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        addr
    }

    #[tokio::test]
    async fn list_partitions() {
        let seen = Seen::default();
        let addr = serve(seen.clone()).await;
        let client = HyperBrokerClient::new(format!("http://{}/", addr), Some("secret".into()), Duration::from_secs(5));

        let partitions = client.partitions(&"orders".into()).await.unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition.as_str(), "0");
        assert_eq!(seen.lock().unwrap()[0].2.as_deref(), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn stream_framed_batches_from_cursor() {
        let seen = Seen::default();
        let addr = serve(seen.clone()).await;
        let client = HyperBrokerClient::new(format!("http://{}", addr), None, Duration::from_secs(5));

        let lines: Vec<_> = client
            .stream(&"orders".into(), &Cursor::begin("0".into()))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(lines.len(), 2);
        assert_eq!(
            seen.lock().unwrap()[0].1.as_deref(),
            Some(r#"[{"partition":"0","offset":"BEGIN"}]"#)
        );
    }

    #[tokio::test]
    async fn surface_error_statuses() {
        let addr = serve(Seen::default()).await;
        let client = HyperBrokerClient::new(format!("http://{}", addr), None, Duration::from_secs(5));

        match client.partitions(&"unknown".into()).await {
            Err(BrokerError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("Not Found"));
            }
            other => panic!("unexpected result {:?}", other.map(|p| p.len())),
        }
    }
}
