/// HTTP request executor used by virtual users.
///
/// A [`Transport`] sends exactly one request and reports what came back:
/// status, full body and wall-clock latency. It never retries. Connection
/// failures and timeouts surface as [`Error::Transport`].
pub mod reqwest;

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::Error;

pub use self::reqwest::Client;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub latency: Duration,
}

impl HttpResponse {
    /// Body as lossy UTF-8, cut to `limit` bytes for log lines.
    pub fn body_snippet(&self, limit: usize) -> String {
        let end = self.body.len().min(limit);
        let mut text = String::from_utf8_lossy(&self.body[..end]).into_owned();
        if self.body.len() > limit {
            text.push_str("...");
        }
        text
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error>;
}
