//! Request id resolution for request tracing and correlation.
//!
//! The id for a request is taken from the first source that has one:
//! 1. A [`RequestId`] already stored in the request extensions
//! 2. An upstream [`TraceContext`] (set by a tracer integration)
//! 3. The configured [`ContextFields`] key
//! 4. The configured request header (`uber-trace-id` by default)
//! 5. A freshly generated UUID v4
//!
//! The result is stored back as a [`RequestId`] extension so later lookups
//! return the same value.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{Extensions, HeaderMap, request::Parts},
};
use uuid::Uuid;

use crate::config::AggregateLogConfig;

/// Value returned by the [`RequestId`] extractor outside the middleware.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// The resolved id of the current request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extractor for the request id resolved by the middleware.
///
/// Yields [`UNKNOWN_REQUEST_ID`] when the middleware did not run.
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self(UNKNOWN_REQUEST_ID.to_string())))
    }
}

/// Span context from an upstream distributed tracer.
///
/// Tracer integrations insert this into the request extensions before the
/// logging middleware runs. It renders the way Jaeger spans do:
/// `trace_id:span_id:parent_id:flags`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace id, hex encoded.
    pub trace_id: String,
    /// Span id, hex encoded.
    pub span_id: String,
    /// Parent span id, `0` for a root span.
    pub parent_id: String,
    /// Whether the trace is sampled.
    pub sampled: bool,
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.trace_id,
            self.span_id,
            self.parent_id,
            u8::from(self.sampled)
        )
    }
}

/// String-keyed values upstream middleware attached to the request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextFields(HashMap<String, String>);

impl ContextFields {
    /// Create an empty set of fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// The value under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Resolve the request id and store it in `extensions`.
pub fn resolve_request_id(
    extensions: &mut Extensions,
    headers: &HeaderMap,
    config: &AggregateLogConfig,
) -> RequestId {
    // Already set up, so we're done
    if let Some(id) = extensions.get::<RequestId>() {
        return id.clone();
    }

    let request_id = extensions
        .get::<TraceContext>()
        .map(ToString::to_string)
        .or_else(|| {
            let field = config.context_trace_id_field.as_deref()?;
            extensions
                .get::<ContextFields>()?
                .get(field)
                .filter(|id| !id.is_empty())
                .map(String::from)
        })
        .or_else(|| {
            let header = config.trace_id_header.as_ref()?;
            headers
                .get(header)
                .and_then(|h| h.to_str().ok())
                .filter(|id| !id.is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request_id = RequestId(request_id);
    extensions.insert(request_id.clone());
    request_id
}

/// Best guess at the client address.
///
/// Checks `X-Forwarded-For` (first hop) and `X-Real-IP` before falling back
/// to the connection's peer address. Empty when none is known.
#[must_use]
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    // Try X-Forwarded-For (first IP in the chain)
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }

    // Try X-Real-IP
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}
