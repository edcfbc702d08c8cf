//! WebSocket upgrade handling.
//!
//! Turns an inbound `GET /echo` request into a WebSocket connection:
//! - Rejected handshakes are mapped to [`UpgradeError`]
//! - The request origin is checked against an [`OriginPolicy`]
//! - Buffer sizes from [`UpgradeConfig`] are applied to the connection
//!
//! Every failure is answered with HTTP 500 and a one-field JSON body:
//!
//! ```text
//! HTTP/1.1 500 Internal Server Error
//! Content-Type: application/json; charset=UTF-8
//!
//! {"Err":"Connection header did not include 'upgrade'\n"}
//! ```

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;

/// Content type of upgrade error responses
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

/// Settings applied to every upgrade, fixed at server construction.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Read buffer size in bytes
    pub read_buffer_size: usize,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Which request origins may upgrade
    pub origin_policy: OriginPolicy,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            origin_policy: OriginPolicy::AllowList(Arc::from([])),
        }
    }
}

/// Decides whether a request origin may open a WebSocket.
#[derive(Clone)]
pub enum OriginPolicy {
    /// Accept every origin. Only suitable for demonstrations.
    AllowAny,
    /// Accept requests without an `Origin` header, same-origin requests,
    /// and the listed origins. Deny everything else.
    AllowList(Arc<[String]>),
    /// Caller-supplied predicate over the `Origin` header.
    Custom(Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>),
}

impl OriginPolicy {
    /// Build an allow-list policy. Trailing slashes are ignored.
    pub fn allow_list<I>(origins: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        OriginPolicy::AllowList(
            origins
                .into_iter()
                .map(|origin| origin.trim_end_matches('/').to_string())
                .collect(),
        )
    }

    /// Build a policy from an arbitrary predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        OriginPolicy::Custom(Arc::new(predicate))
    }

    /// Check an origin. `host` is the request's `Host` header.
    pub fn allows(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        match self {
            OriginPolicy::AllowAny => true,
            OriginPolicy::Custom(predicate) => predicate(origin),
            OriginPolicy::AllowList(allowed) => {
                let Some(origin) = origin else {
                    // Non-browser clients don't send an origin
                    return true;
                };
                is_same_origin(origin, host)
                    || allowed
                        .iter()
                        .any(|entry| entry.eq_ignore_ascii_case(origin))
            }
        }
    }
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginPolicy::AllowAny => f.write_str("AllowAny"),
            OriginPolicy::AllowList(allowed) => f.debug_tuple("AllowList").field(allowed).finish(),
            OriginPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// True when the origin's authority equals the request host.
fn is_same_origin(origin: &str, host: Option<&str>) -> bool {
    let (Some(host), Ok(uri)) = (host, origin.parse::<Uri>()) else {
        return false;
    };
    uri.authority()
        .is_some_and(|authority| authority.as_str().eq_ignore_ascii_case(host))
}

/// Reasons an upgrade request does not produce a connection.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    /// The request is not a valid WebSocket handshake
    #[error("{0}")]
    Handshake(String),
    /// The origin policy refused the request
    #[error("origin not allowed: {0}")]
    OriginRejected(String),
    /// The handshake was valid but the connection cannot be taken over
    #[error("no connection")]
    NoConnection,
}

impl From<WebSocketUpgradeRejection> for UpgradeError {
    fn from(rejection: WebSocketUpgradeRejection) -> Self {
        match rejection {
            WebSocketUpgradeRejection::ConnectionNotUpgradable(_) => UpgradeError::NoConnection,
            other => UpgradeError::Handshake(other.body_text()),
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        error_response(&self.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Build a JSON error response: `{"Err":"<message>\n"}`.
pub fn error_response(message: &str, status: StatusCode) -> Response {
    let body = serde_json::json!({ "Err": format!("{message}\n") }).to_string();

    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON))],
        body,
    )
        .into_response()
}

/// Validate an extracted upgrade against the config.
///
/// On success the returned upgrade carries the configured buffer sizes and
/// only needs a session callback. Nothing has been written to the client yet
/// when this fails, so the error can still be turned into a response.
pub fn upgrade(
    config: &UpgradeConfig,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<WebSocketUpgrade, UpgradeError> {
    let ws = ws?;

    let origin = match headers.get(header::ORIGIN) {
        Some(value) => Some(value.to_str().map_err(|_| {
            UpgradeError::OriginRejected(String::from_utf8_lossy(value.as_bytes()).into_owned())
        })?),
        None => None,
    };
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());

    if !config.origin_policy.allows(origin, host) {
        return Err(UpgradeError::OriginRejected(
            origin.unwrap_or_default().to_string(),
        ));
    }

    Ok(ws
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size))
}
