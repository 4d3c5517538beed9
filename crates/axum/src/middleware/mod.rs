//! Request logging middleware.
//!
//! # Layers
//!
//! [`with_tracing`] is the only layer. It resolves the request id, installs a
//! [`RequestLogger`] in the request extensions, and writes the access record
//! once the inner service has responded.
//!
//! # Handler extractors
//!
//! - [`RequestLogger`] for headers, errors and detached loggers
//! - [`RequestId`] when only the id is needed

pub mod access_log;
pub mod logger;
pub mod request_id;

pub use access_log::with_tracing;
pub use logger::{DetachedLogger, RequestLogger, aggregate_dispatch, buffered, buffered_scope};
pub use request_id::{
    ContextFields, RequestId, TraceContext, UNKNOWN_REQUEST_ID, client_ip, resolve_request_id,
};
