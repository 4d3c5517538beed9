//! Aggregate request logging for axum.
//!
//! Every event a handler logs while serving one request is collected and
//! written as a single JSON line, together with the request's access record.
//! With aggregate logging off, the middleware falls back to a request span
//! and one access event per request.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use aggregate_log_axum::{AggregateLogConfig, with_tracing};
//! use axum::{Router, routing::get};
//!
//! let config = Arc::new(AggregateLogConfig::from_env()?.with_aggregate_logging(true));
//! let app: Router = Router::new()
//!     .route("/", get(|| async { tracing::info!("hello"); "ok" }))
//!     .layer(axum::middleware::from_fn_with_state(config, with_tracing));
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod middleware;
pub mod sink;

pub use aggregate_log_core::{
    DEFAULT_BANNER, DEFAULT_MAX_SIZE, LogBuffer, LogBufferError, LogBufferOptions,
};
pub use config::{AggregateLogConfig, ConfigError, ReducedLoggingFn, RequestSummary};
pub use middleware::{
    ContextFields, DetachedLogger, RequestId, RequestLogger, TraceContext, with_tracing,
};
pub use sink::LogSink;
