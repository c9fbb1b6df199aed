//! Error types for the gateway

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors, taxonomised per the client/upstream/internal/cancelled split.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (surfaced at startup, exit code 1)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested service has no matching `ServiceRoute`
    #[error("unknown service: {0}")]
    RouteNotFound(String),

    /// Admin endpoint or protected route called without a valid token
    #[error("unauthorized")]
    Unauthorized,

    /// Admin token id does not exist
    #[error("token not found: {0}")]
    TokenNotFound(i64),

    /// Request body exceeded configured limits
    #[error("request too large")]
    RequestTooLarge,

    /// Backend connection could not be established
    #[error("backend connect failed: {0}")]
    BackendConnect(String),

    /// Backend did not respond before the deadline
    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    /// Backend returned a malformed response
    #[error("backend returned malformed response: {0}")]
    BackendMalformed(String),

    /// Retry attempts exhausted without a successful response
    #[error("upstream unavailable for {service} after {attempts} attempt(s)")]
    UpstreamExhausted {
        /// Service name that was being proxied to.
        service: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Per-backend queue limit reached; fail fast
    #[error("backend busy: {0}")]
    BackendBusy(String),

    /// Caller disconnected before the response completed
    #[error("request cancelled")]
    Cancelled,

    /// Durable store I/O failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error with no detail safe to leak to the caller
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error onto the fixed `{"error": string, "detail"?: string, ...}` JSON
    /// shape and an HTTP status code, per the error handling design.
    #[must_use]
    pub fn to_response(&self) -> Response {
        let (status, slug, detail, extra): (StatusCode, &str, Option<String>, Option<serde_json::Value>) =
            match self {
                Self::RouteNotFound(service) => (
                    StatusCode::NOT_FOUND,
                    "unknown service",
                    None,
                    Some(json!({ "service": service })),
                ),
                Self::Unauthorized => (StatusCode::FORBIDDEN, "unauthorized", None, None),
                Self::TokenNotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "token not found",
                    None,
                    Some(json!({ "id": id })),
                ),
                Self::RequestTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "request too large", None, None),
                Self::BackendConnect(detail) | Self::BackendMalformed(detail) => (
                    StatusCode::BAD_GATEWAY,
                    "upstream unavailable",
                    Some(detail.clone()),
                    None,
                ),
                Self::BackendTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream timed out", None, None),
                Self::UpstreamExhausted { service, attempts } => (
                    StatusCode::BAD_GATEWAY,
                    "upstream unavailable",
                    None,
                    Some(json!({ "service": service, "attempts": attempts })),
                ),
                Self::BackendBusy(service) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "backend busy",
                    None,
                    Some(json!({ "service": service })),
                ),
                Self::Cancelled => (StatusCode::BAD_REQUEST, "request cancelled", None, None),
                Self::Config(_) | Self::Persistence(_) | Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error", None, None)
                }
            };

        let mut body = json!({ "error": slug });
        if let Some(d) = detail {
            body["detail"] = json!(d);
        }
        if let Some(extra) = extra {
            if let (Some(obj), Some(extra_obj)) = (body.as_object_mut(), extra.as_object()) {
                for (k, v) in extra_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.to_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_not_found_maps_to_404_with_service_context() {
        let resp = Error::RouteNotFound("nonexistent".to_string()).to_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unauthorized_maps_to_403() {
        let resp = Error::Unauthorized.to_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_errors_never_leak_detail() {
        let resp = Error::Internal("database row 17 had stray bytes".to_string()).to_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn backend_busy_maps_to_503() {
        let resp = Error::BackendBusy("meds".to_string()).to_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
