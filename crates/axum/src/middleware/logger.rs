//! Per-request logger stored in the request extensions.
//!
//! With aggregate logging on, a [`RequestLogger`] owns the request's
//! [`LogBuffer`]. Handlers keep using the plain `tracing` macros; the
//! middleware drives them under one shared dispatcher that formats each event
//! as JSON and appends it to whichever buffer is in scope for the current
//! task.

use std::fmt::{self, Write as _};
use std::future::Future;
use std::io;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use aggregate_log_core::LogBuffer;
use axum::{
    extract::FromRequestParts,
    http::{Method, request::Parts},
};
use serde_json::Value;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, dynamic_filter_fn},
    layer::SubscriberExt,
};

use crate::config::AggregateLogConfig;
use crate::middleware::request_id::{RequestId, resolve_request_id};
use crate::sink::LogSink;

/// Buffer and level events from the current task are routed to.
#[derive(Clone)]
struct BufferScope {
    buffer: LogBuffer,
    level: LevelFilter,
}

tokio::task_local! {
    static CURRENT_BUFFER: BufferScope;
}

static AGGREGATE_DISPATCH: LazyLock<Dispatch> = LazyLock::new(|| {
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .log_internal_errors(false)
        .with_writer(|| ScopedWriter)
        .with_filter(dynamic_filter_fn(|metadata, _cx| {
            CURRENT_BUFFER
                .try_with(|scope| *metadata.level() <= scope.level)
                .unwrap_or(false)
        }));

    Dispatch::new(tracing_subscriber::registry().with(layer))
});

/// Appends each formatted event to the buffer in scope. Events outside any
/// scope are discarded.
struct ScopedWriter;

impl io::Write for ScopedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match CURRENT_BUFFER.try_with(|scope| scope.buffer.append(buf)) {
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) | Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The process-wide dispatcher behind aggregate logging.
///
/// It is built once. Events only reach a buffer inside [`buffered`] or
/// [`buffered_scope`]; elsewhere it drops them.
#[must_use]
pub fn aggregate_dispatch() -> &'static Dispatch {
    &AGGREGATE_DISPATCH
}

/// Drive `future` so that its events at or above `level` are appended to
/// `buffer`.
pub fn buffered<F: Future>(
    buffer: &LogBuffer,
    level: LevelFilter,
    future: F,
) -> impl Future<Output = F::Output> + use<F> {
    let scope = BufferScope {
        buffer: buffer.clone(),
        level,
    };
    CURRENT_BUFFER.scope(scope, future.with_subscriber(aggregate_dispatch().clone()))
}

/// Run `f` so that its events at or above `level` are appended to `buffer`.
pub fn buffered_scope<R>(buffer: &LogBuffer, level: LevelFilter, f: impl FnOnce() -> R) -> R {
    let scope = BufferScope {
        buffer: buffer.clone(),
        level,
    };
    CURRENT_BUFFER.sync_scope(scope, || {
        tracing::dispatcher::with_default(aggregate_dispatch(), f)
    })
}

/// Logger for the current request.
///
/// Cheap to clone; clones share the buffer and recorded errors.
#[derive(Clone)]
pub struct RequestLogger {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<AggregateLogConfig>,
    request_id: RequestId,
    method: Method,
    path: String,
    buffer: Option<LogBuffer>,
    errors: Mutex<Vec<String>>,
}

impl RequestLogger {
    /// Create the logger for one request.
    ///
    /// A buffer is only set up when the config enables aggregate logging.
    #[must_use]
    pub fn new(
        config: Arc<AggregateLogConfig>,
        request_id: RequestId,
        method: Method,
        path: String,
    ) -> Self {
        let buffer = config
            .aggregate_logging
            .then(|| LogBuffer::new(config.buffer_options()));

        Self {
            inner: Arc::new(Inner {
                config,
                request_id,
                method,
                path,
                buffer,
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The resolved request id.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.inner.request_id
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// Request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether this request's logs are being buffered.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.inner.buffer.is_some()
    }

    /// The request's buffer, in aggregate mode.
    #[must_use]
    pub fn buffer(&self) -> Option<&LogBuffer> {
        self.inner.buffer.as_ref()
    }

    /// Drive `future` with its events going into this request's buffer.
    ///
    /// Outside aggregate mode `future` runs unchanged.
    pub async fn instrument<F: Future>(&self, future: F) -> F::Output {
        match self.buffer() {
            Some(buffer) => buffered(buffer, self.inner.config.log_level, future).await,
            None => future.await,
        }
    }

    /// Attach request-level data to the output.
    ///
    /// In aggregate mode the value becomes a top-level field of the request's
    /// JSON line. Otherwise it is logged right away as `name: value`.
    pub fn set_header(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.buffer() {
            Some(buffer) => buffer.store_header(name, value),
            None => tracing::info!(
                request_id = %self.inner.request_id,
                method = %self.inner.method,
                path = %self.inner.path,
                "{name}: {}",
                display_value(&value)
            ),
        }
    }

    /// Record a handler error. Recorded errors turn the request's access
    /// entry into an error entry and fill its `comment` field.
    pub fn record_error(&self, err: impl fmt::Display) {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.to_string());
    }

    /// Errors recorded so far.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded errors as `Error #01: ...` lines, empty when there are none.
    #[must_use]
    pub fn error_comment(&self) -> String {
        let errors = self.inner.errors.lock().unwrap_or_else(PoisonError::into_inner);
        let mut comment = String::new();
        for (i, err) in errors.iter().enumerate() {
            let _ = writeln!(comment, "Error #{:02}: {err}", i + 1);
        }
        comment
    }

    /// Run `f` with its events going into this request's buffer.
    ///
    /// Outside aggregate mode `f` runs under whatever dispatcher is current.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.buffer() {
            Some(buffer) => buffered_scope(buffer, self.inner.config.log_level, f),
            None => f(),
        }
    }

    /// A logger for work that outlives the request.
    ///
    /// Its buffer shares this request's headers, so header writes from either
    /// side show up in both outputs. Call [`DetachedLogger::flush`] when the
    /// work is done.
    #[must_use]
    pub fn detached(&self) -> DetachedLogger {
        let buffer = match self.buffer() {
            Some(buffer) => buffer.derived(),
            None => self.fresh_buffer(),
        };
        DetachedLogger::new(buffer, &self.inner.config)
    }

    /// Like [`detached`](Self::detached), but with a private copy of the
    /// current headers and the banner turned on.
    #[must_use]
    pub fn detached_with_copied_headers(&self) -> DetachedLogger {
        let buffer = LogBuffer::new(self.inner.config.buffer_options());
        match self.buffer() {
            Some(parent) => LogBuffer::copy_header(&buffer, parent),
            None => buffer.store_header(
                self.inner.config.trace_id_field.as_str(),
                self.inner.request_id.as_str(),
            ),
        }
        buffer.set_banner(true);
        DetachedLogger::new(buffer, &self.inner.config)
    }

    fn fresh_buffer(&self) -> LogBuffer {
        let buffer = LogBuffer::new(self.inner.config.buffer_options().with_banner(false));
        buffer.store_header(
            self.inner.config.trace_id_field.as_str(),
            self.inner.request_id.as_str(),
        );
        buffer
    }
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogger")
            .field("request_id", &self.inner.request_id)
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .field("buffer", &self.buffer())
            .finish_non_exhaustive()
    }
}

/// Extractor for the current request's logger.
///
/// # Example
///
/// ```ignore
/// async fn handler(logger: RequestLogger) -> &'static str {
///     logger.set_header("tenant", "acme");
///     tracing::info!("buffered with the rest of the request");
///     "ok"
/// }
/// ```
impl<S> FromRequestParts<S> for RequestLogger
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(logger) = parts.extensions.get::<Self>() {
            return Ok(logger.clone());
        }

        tracing::warn!(
            "RequestLogger not found in request extensions - logging middleware may be misconfigured"
        );
        let config = Arc::new(AggregateLogConfig::default());
        let request_id = resolve_request_id(&mut parts.extensions, &parts.headers, &config);
        let logger = Self::new(
            config,
            request_id,
            parts.method.clone(),
            parts.uri.path().to_owned(),
        );
        parts.extensions.insert(logger.clone());
        Ok(logger)
    }
}

/// Buffered logger for background work that finishes after the response.
///
/// ```ignore
/// let detached = logger.detached();
/// tokio::spawn(async move {
///     detached
///         .instrument(async {
///             tracing::info!("finished after the request");
///         })
///         .await;
///     let _ = detached.flush();
/// });
/// ```
#[derive(Clone)]
pub struct DetachedLogger {
    buffer: LogBuffer,
    level: LevelFilter,
    sink: LogSink,
}

impl DetachedLogger {
    fn new(buffer: LogBuffer, config: &AggregateLogConfig) -> Self {
        Self {
            buffer,
            level: config.log_level,
            sink: config.sink.clone(),
        }
    }

    /// The detached buffer.
    #[must_use]
    pub const fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    /// The dispatcher that formats this logger's events.
    ///
    /// Shared by every request; see [`aggregate_dispatch`].
    #[must_use]
    pub fn dispatch(&self) -> &'static Dispatch {
        aggregate_dispatch()
    }

    /// Drive `future` with its events going into the detached buffer.
    pub fn instrument<F: Future>(&self, future: F) -> impl Future<Output = F::Output> + use<F> {
        buffered(&self.buffer, self.level, future)
    }

    /// Run `f` with its events going into the detached buffer.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        buffered_scope(&self.buffer, self.level, f)
    }

    /// Render the buffer and write it to the configured sink.
    ///
    /// # Errors
    ///
    /// Returns any error from the sink's writer.
    pub fn flush(&self) -> io::Result<()> {
        self.sink.write_line(&self.buffer.render())
    }
}

impl fmt::Debug for DetachedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedLogger")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Strings log without quotes, everything else as JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
