//! Integration test helpers for aggregate request logging.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p aggregate-log-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `middleware` - Aggregated output through a real axum router
//! - `request_id` - Request id propagation from headers and extensions
//! - `detached` - Loggers that outlive their request

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use aggregate_log_axum::{AggregateLogConfig, with_tracing};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;

/// In-memory writer that records everything the middleware writes.
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    /// Create an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Written lines parsed as JSON. Lines that do not parse are skipped.
    #[must_use]
    pub fn json_lines(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Drop everything captured so far.
    pub fn clear(&self) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl io::Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wrap `routes` in the logging middleware using `config`.
pub fn with_logging(routes: Router, config: AggregateLogConfig) -> Router {
    routes.layer(axum::middleware::from_fn_with_state(
        Arc::new(config),
        with_tracing,
    ))
}

/// Send a `GET` request with the given extra headers and return the status.
///
/// # Panics
///
/// Panics if the request cannot be built or the router fails.
pub async fn get(app: &Router, uri: &str, headers: &[(&str, &str)]) -> StatusCode {
    let mut builder = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::empty()).expect("valid request");

    app.clone()
        .oneshot(request)
        .await
        .expect("router is infallible")
        .status()
}
