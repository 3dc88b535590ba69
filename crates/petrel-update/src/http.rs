use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use reqwest::Method;
use reqwest::header::HeaderMap;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid proxy url {url}: {source}")]
    InvalidProxy {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// A single request description for [`HttpClient::send`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
    /// Per-attempt timeout; defaults to 30 s.
    pub timeout: Option<Duration>,
    /// Total attempt cap, including the first attempt.
    pub retry_limit: u32,
    /// Status codes that trigger a retry even though a response arrived.
    pub retry_on_status: Vec<u16>,
    /// Base retry delay; the actual delay is `retry_delay × attempt`.
    pub retry_delay: Duration,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_on_status: Vec::new(),
            retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_message: String,
    pub headers: HeaderMap,
    pub body: String,
}

/// HTTPS client with bounded linear-backoff retry.
///
/// Retries on transport errors, timeouts, and response statuses in the
/// request's allow-list. Honors the `https_proxy`/`HTTPS_PROXY` environment
/// variable; proxy absence is not an error.
pub struct HttpClient {
    client: reqwest::Client,
    request_counter: AtomicU64,
}

impl HttpClient {
    /// # Errors
    /// Returns an error when the underlying client cannot be built or the
    /// configured proxy url is invalid.
    pub fn new() -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy_url) = proxy_from_env() {
            info!("[http] using proxy from environment");
            let proxy = reqwest::Proxy::all(&proxy_url).map_err(|source| {
                HttpError::InvalidProxy {
                    url: proxy_url,
                    source,
                }
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(HttpError::ClientBuild)?;
        Ok(Self {
            client,
            request_counter: AtomicU64::new(0),
        })
    }

    /// Perform the request, retrying per the request's policy.
    ///
    /// Each attempt settles exactly once: success, scheduled retry, or final
    /// failure. The last transport error is returned once attempts are
    /// exhausted.
    ///
    /// # Errors
    /// Returns [`HttpError::Exhausted`] when every attempt failed at the
    /// transport level or timed out.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let retry_limit = request.retry_limit.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            info!(
                "[http] [{request_id}] {} {}, attempt {attempt}/{retry_limit}",
                request.method, request.url
            );

            match self.attempt(&request, timeout).await {
                Ok(response) => {
                    let duration = started.elapsed().as_millis();
                    if request.retry_on_status.contains(&response.status) && attempt < retry_limit {
                        let delay = request.retry_delay * attempt;
                        info!(
                            "[http] [{request_id}] got status {} which requires retry, \
                             duration: {duration}ms, retrying in {delay:?}",
                            response.status
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    info!(
                        "[http] [{request_id}] got response [{}] {}, duration: {duration}ms",
                        response.status, response.status_message
                    );
                    return Ok(response);
                }
                Err(error) => {
                    let duration = started.elapsed().as_millis();
                    if attempt < retry_limit {
                        let delay = request.retry_delay * attempt;
                        warn!(
                            "[http] [{request_id}] request failed: {error}, \
                             duration: {duration}ms, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(
                        "[http] [{request_id}] request failed: {error}, \
                         duration: {duration}ms, no retry"
                    );
                    return Err(HttpError::Exhausted {
                        url: request.url.clone(),
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            body,
        })
    }
}

fn proxy_from_env() -> Option<String> {
    let raw = std::env::var("https_proxy")
        .or_else(|_| std::env::var("HTTPS_PROXY"))
        .ok()?;
    if raw.is_empty() {
        return None;
    }
    let lowered = raw.to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        Some(raw)
    } else {
        Some(format!("http://{raw}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::{HttpClient, HttpRequest};
    use crate::testing::{http_response, serve_responses};

    #[tokio::test]
    async fn returns_response_without_retry_on_success() {
        let server = serve_responses(vec![http_response(200, "OK", &[], "hello")]).await;
        let client = HttpClient::new().expect("client should build");

        let response = client
            .send(HttpRequest::get(format!("http://{}/", server.addr)))
            .await
            .expect("request should succeed");

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello");
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_on_listed_status_then_returns_last_response() {
        let server = serve_responses(vec![
            http_response(503, "Service Unavailable", &[], ""),
            http_response(200, "OK", &[], "recovered"),
        ])
        .await;
        let client = HttpClient::new().expect("client should build");

        let mut request = HttpRequest::get(format!("http://{}/", server.addr));
        request.retry_on_status = vec![503];
        request.retry_delay = Duration::from_millis(1);

        let response = client.send(request).await.expect("request should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "recovered");
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unlisted_status_is_returned_not_retried() {
        let server = serve_responses(vec![http_response(500, "Internal Server Error", &[], "")])
            .await;
        let client = HttpClient::new().expect("client should build");

        let response = client
            .send(HttpRequest::get(format!("http://{}/", server.addr)))
            .await
            .expect("a response is not a transport failure");

        assert_eq!(response.status, 500);
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_on_transport_error() {
        // Bind and drop a listener so the port is very likely unused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");
        drop(listener);

        let client = HttpClient::new().expect("client should build");
        let mut request = HttpRequest::get(format!("http://{addr}/"));
        request.retry_limit = 2;
        request.retry_delay = Duration::from_millis(1);

        let error = client
            .send(request)
            .await
            .expect_err("request should exhaust retries");
        assert!(error.to_string().contains("after 2 attempts"));
    }
}
