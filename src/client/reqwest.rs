use std::time::{Duration, Instant};

use tracing::{event, field, span, Instrument, Level};

use super::{HttpRequest, HttpResponse, Transport};
use crate::{error::Error, USER_TASK};

/// [`Transport`] backed by a pooled reqwest client.
///
/// Every request runs inside a `reqwest` span carrying host, path and
/// method, and emits the sent/received sizes and the response status as
/// events under [`USER_TASK`].
#[derive(Clone)]
pub struct Client {
    pub inner: reqwest::Client,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        <reqwest::Client as std::fmt::Debug>::fmt(&self.inner, f)
    }
}

impl Client {
    /// Client whose requests fail with a transport error after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::config(format!("cannot build HTTP client: {err}")))?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl Transport for Client {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let span = span!(
            target: USER_TASK,
            Level::INFO,
            "reqwest",
            url = field::Empty,
            path = %request.url.path(),
            method = %request.method
        );
        if let Some(host) = request.url.host_str() {
            span.record("url", field::display(host));
        }

        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        async move {
            let content_type = headers.contains_key(http::header::CONTENT_TYPE);
            let mut builder = self.inner.request(method, url).headers(headers);
            if let Some(body) = body {
                let payload = serde_json::to_vec(&body).map_err(anyhow::Error::from)?;
                event!(name: "sent.gauge", target: USER_TASK, Level::DEBUG, value = payload.len() as f64);
                if !content_type {
                    builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                }
                builder = builder.body(payload);
            }

            let start = Instant::now();
            let resp = builder.send().await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            let latency = start.elapsed();

            event!(name: "receive.gauge", target: USER_TASK, Level::DEBUG, value = body.len() as f64);
            event!(name: "status.counter", target: USER_TASK, Level::DEBUG, status = status.as_str(), value = 1u64);
            Ok::<_, Error>(HttpResponse {
                status,
                body,
                latency,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/").parse().unwrap()
    }

    #[tokio::test]
    async fn sends_json_and_reads_the_full_body() {
        let base = serve(Router::new().route(
            "/echo",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let session = headers
                    .get("x-session-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    axum::http::StatusCode::CREATED,
                    Json(json!({"echo": body, "session": session})),
                )
            }),
        ))
        .await;

        let mut headers = http::HeaderMap::new();
        headers.insert("x-session-id", http::HeaderValue::from_static("abc"));
        let client = Client::new(Duration::from_secs(5)).unwrap();
        let response = client
            .send(HttpRequest {
                method: http::Method::POST,
                url: base.join("echo").unwrap(),
                headers,
                body: Some(json!({"quantity": 1})),
            })
            .await
            .unwrap();

        assert_eq!(response.status, http::StatusCode::CREATED);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, json!({"echo": {"quantity": 1}, "session": "abc"}));
        assert!(response.latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn timeout_is_a_transport_error() {
        let base = serve(Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;

        let client = Client::new(Duration::from_millis(100)).unwrap();
        let err = client
            .send(HttpRequest {
                method: http::Method::POST,
                url: base.join("slow").unwrap(),
                headers: http::HeaderMap::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{err:?}");
        assert!(err.is_iteration_err());
    }
}
