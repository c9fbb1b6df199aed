//! Proxy Engine: the component whose correctness the rest of the gateway
//! depends on. Classifies the inbound body into Streamed/Buffered mode,
//! strips hop-by-hop headers, applies retry/timeout policy, and streams the
//! response back without ever fully buffering it.

mod retry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures::TryStreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::router::ServiceRoute;

pub use retry::is_idempotent_method;

/// Hop-by-hop headers, stripped in both directions. RFC 7230 §6.1 plus the
/// widely-sent but non-standard `Proxy-Connection`.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

enum BodyMode {
    /// Forwarded byte-for-byte as a chunked stream; `Content-Length` removed.
    Streamed(Body),
    /// Read fully into memory; `Content-Length` preserved.
    Buffered(Bytes),
}

/// Per-backend concurrency limiter: caps simultaneous upstream connections
/// and fails fast once the configured queue limit would be exceeded, rather
/// than queueing unboundedly.
struct BackendLimiter {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_limit: usize,
}

impl BackendLimiter {
    fn new(cap: usize, queue_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(cap)),
            waiting: AtomicUsize::new(0),
            queue_limit,
        }
    }

    async fn acquire(&self, service: &str) -> Result<OwnedSemaphorePermit> {
        if self.semaphore.available_permits() == 0 {
            let waiting = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
            if waiting > self.queue_limit {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::BackendBusy(service.to_string()));
            }
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            Ok(permit)
        } else {
            Ok(self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed"))
        }
    }
}

/// Forwards admitted requests to their resolved backend, owning the shared
/// HTTP client connection pool and per-backend concurrency limiters.
pub struct ProxyEngine {
    client: reqwest::Client,
    config: ProxyConfig,
    limiters: DashMap<String, Arc<BackendLimiter>>,
}

impl ProxyEngine {
    /// Build a proxy engine with an explicitly-constructed HTTP client owned
    /// for the process lifetime (never a module-level singleton).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the underlying TLS/client stack fails
    /// to initialize.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.backend_concurrency_cap)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            client,
            config,
            limiters: DashMap::new(),
        })
    }

    fn limiter_for(&self, service: &str) -> Arc<BackendLimiter> {
        self.limiters
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(BackendLimiter::new(
                    self.config.backend_concurrency_cap,
                    self.config.backend_queue_limit,
                ))
            })
            .clone()
    }

    /// Forward one admitted request to `route`, streaming the response back.
    /// Never fully buffers a streamed-mode body — see the module docs.
    pub async fn forward(
        &self,
        route: &ServiceRoute,
        path_tail: &str,
        query: Option<&str>,
        method: Method,
        mut headers: HeaderMap,
        body: Body,
        client_addr: SocketAddr,
    ) -> Response {
        let limiter = self.limiter_for(&route.name);
        let _permit = match limiter.acquire(&route.name).await {
            Ok(permit) => permit,
            Err(e) => return e.into_response(),
        };

        let body_mode = match classify_body(&headers, body, self.config.buffer_threshold_bytes).await {
            Ok(mode) => mode,
            Err(e) => return e.into_response(),
        };

        rewrite_headers(&mut headers, route, client_addr, &body_mode);

        let url = build_url(&route.base_url, path_tail, query);
        let deadline = self.config.request_deadline;

        // Streamed bodies are consumed on the first send attempt and cannot be
        // cloned for a retry, so they take exactly one attempt regardless of
        // method. Buffered bodies are cheaply re-clonable `Bytes` and go
        // through the normal retry loop when the method is idempotent.
        match body_mode {
            BodyMode::Streamed(body) => {
                let fut = self.attempt_streamed(&method, &url, &headers, body);
                match tokio::time::timeout(deadline, fut).await {
                    Ok(Ok(resp)) => stream_response(resp),
                    Ok(Err(_e)) => Error::UpstreamExhausted {
                        service: route.name.clone(),
                        attempts: 1,
                    }
                    .into_response(),
                    Err(_elapsed) => Error::BackendTimeout(route.name.clone()).into_response(),
                }
            }
            BodyMode::Buffered(bytes) => {
                let retryable = is_idempotent_method(&method);
                let fut = retry::with_retry(&self.config, retryable, &route.name, || {
                    self.attempt_buffered(&method, &url, &headers, &bytes)
                });
                match tokio::time::timeout(deadline, fut).await {
                    Ok(Ok(resp)) => stream_response(resp),
                    Ok(Err((_last_err, attempts))) => Error::UpstreamExhausted {
                        service: route.name.clone(),
                        attempts,
                    }
                    .into_response(),
                    Err(_elapsed) => Error::BackendTimeout(route.name.clone()).into_response(),
                }
            }
        }
    }

    async fn attempt_streamed(&self, method: &Method, url: &str, headers: &HeaderMap, body: Body) -> Result<reqwest::Response> {
        let stream = body.into_data_stream();
        let resp = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(classify_send_error)?;
        reject_server_error(resp)
    }

    async fn attempt_buffered(&self, method: &Method, url: &str, headers: &HeaderMap, bytes: &Bytes) -> Result<reqwest::Response> {
        let resp = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(bytes.clone())
            .send()
            .await
            .map_err(classify_send_error)?;
        reject_server_error(resp)
    }
}

fn classify_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::BackendTimeout(e.to_string())
    } else if e.is_connect() {
        Error::BackendConnect(e.to_string())
    } else {
        Error::BackendMalformed(e.to_string())
    }
}

/// A 5xx backend response is a retry trigger, same as a connection failure —
/// per the retry policy, never passed through to the caller as-is. Only a
/// successful exhaustion-free attempt (or a non-5xx response) reaches
/// [`stream_response`] untouched.
fn reject_server_error(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_server_error() {
        Err(Error::BackendMalformed(format!("backend returned {}", resp.status())))
    } else {
        Ok(resp)
    }
}

/// Classify the inbound body per the bimodal contract: multipart/chunked/
/// oversized bodies are streamed through untouched; everything else is
/// buffered up to the threshold.
async fn classify_body(headers: &HeaderMap, body: Body, threshold: usize) -> Result<BodyMode> {
    let content_type_is_multipart = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let is_chunked = headers
        .get(axum::http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));

    let content_length = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let exceeds_threshold = content_length.is_some_and(|len| len > threshold);

    if content_type_is_multipart || is_chunked || exceeds_threshold {
        debug!(multipart = content_type_is_multipart, chunked = is_chunked, "streamed body mode");
        return Ok(BodyMode::Streamed(body));
    }

    let bytes = axum::body::to_bytes(body, threshold)
        .await
        .map_err(|_| Error::RequestTooLarge)?;
    Ok(BodyMode::Buffered(bytes))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

fn rewrite_headers(headers: &mut HeaderMap, route: &ServiceRoute, client_addr: SocketAddr, body_mode: &BodyMode) {
    strip_hop_by_hop(headers);
    headers.remove(ADMIN_TOKEN_HEADER);

    if let Ok(host) = host_of(&route.base_url) {
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(axum::http::header::HOST, value);
        }
    }

    match body_mode {
        BodyMode::Streamed(_) => {
            headers.remove(axum::http::header::CONTENT_LENGTH);
        }
        BodyMode::Buffered(bytes) => {
            headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        }
    }

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", client_addr.ip()),
        None => client_addr.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }

    let proto = if route.base_url.starts_with("https://") { "https" } else { "http" };
    headers.insert(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static(proto));
}

fn host_of(base_url: &str) -> std::result::Result<String, url::ParseError> {
    let parsed = url::Url::parse(base_url)?;
    Ok(match parsed.port() {
        Some(port) => format!("{}:{port}", parsed.host_str().unwrap_or_default()),
        None => parsed.host_str().unwrap_or_default().to_string(),
    })
}

fn build_url(base_url: &str, path_tail: &str, query: Option<&str>) -> String {
    let mut url = if path_tail.is_empty() {
        base_url.to_string()
    } else {
        format!("{base_url}/{path_tail}")
    };
    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    url
}

/// Write the status line and headers as soon as they arrive, then pipe the
/// body chunk-by-chunk. The body is never buffered here: dropping the
/// returned response's body stream (caller disconnect) cancels the
/// underlying reqwest stream, which cancels the outbound request.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            headers.append(name, HeaderValue::from_bytes(value.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static("")));
        }
    }
    strip_hop_by_hop(&mut headers);

    let stream = upstream.bytes_stream().map_err(|e| {
        warn!(error = %e, "upstream response stream interrupted");
        std::io::Error::other(e)
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_tail_and_query() {
        assert_eq!(
            build_url("http://127.0.0.1:9001", "list/123", Some("a=1")),
            "http://127.0.0.1:9001/list/123?a=1"
        );
    }

    #[test]
    fn build_url_handles_empty_tail_and_query() {
        assert_eq!(build_url("http://127.0.0.1:9001", "", None), "http://127.0.0.1:9001");
    }

    #[test]
    fn host_of_includes_nonstandard_port() {
        assert_eq!(host_of("http://127.0.0.1:9001").unwrap(), "127.0.0.1:9001");
    }

    #[test]
    fn strip_hop_by_hop_removes_all_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-custom", HeaderValue::from_static("keep-me"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("x-custom").is_some());
    }

    #[tokio::test]
    async fn multipart_content_type_forces_streamed_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=----XYZ"),
        );
        let mode = classify_body(&headers, Body::from("irrelevant"), 1_048_576).await.unwrap();
        assert!(matches!(mode, BodyMode::Streamed(_)));
    }

    #[tokio::test]
    async fn small_json_body_is_buffered() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from_static("13"));
        let mode = classify_body(&headers, Body::from("{\"a\":true}"), 1_048_576).await.unwrap();
        assert!(matches!(mode, BodyMode::Buffered(_)));
    }

    #[tokio::test]
    async fn oversized_content_length_forces_streamed_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from_static("2097152"));
        let mode = classify_body(&headers, Body::from("x"), 1_048_576).await.unwrap();
        assert!(matches!(mode, BodyMode::Streamed(_)));
    }

    #[tokio::test]
    async fn chunked_transfer_encoding_forces_streamed_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mode = classify_body(&headers, Body::from("x"), 1_048_576).await.unwrap();
        assert!(matches!(mode, BodyMode::Streamed(_)));
    }

    #[test]
    fn rewrite_headers_appends_rather_than_replaces_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("secret"));
        let route = ServiceRoute {
            name: "meds".to_string(),
            base_url: "http://127.0.0.1:9001".to_string(),
            protected: false,
        };
        let client_addr: SocketAddr = "192.168.1.5:54321".parse().unwrap();
        rewrite_headers(&mut headers, &route, client_addr, &BodyMode::Buffered(Bytes::new()));

        let forwarded = headers.get("x-forwarded-for").unwrap().to_str().unwrap();
        assert_eq!(forwarded, "10.0.0.1, 192.168.1.5");
        assert!(headers.get(ADMIN_TOKEN_HEADER).is_none());
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    }
}
