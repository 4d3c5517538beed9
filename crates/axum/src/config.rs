//! Middleware configuration.
//!
//! Build an [`AggregateLogConfig`] with the `with_*` methods, or load it from
//! the environment with [`AggregateLogConfig::from_env`].
//!
//! # Environment Variables
//!
//! All optional:
//! - `AGGREGATE_LOG_ENABLED` - Buffer each request's logs into one line (default: false)
//! - `AGGREGATE_LOG_LEVEL` - Minimum level kept in the buffer (default: debug)
//! - `AGGREGATE_LOG_BANNER` - Add a banner to each request line (default: false)
//! - `AGGREGATE_LOG_CUSTOM_BANNER` - Banner text replacing the default one
//! - `AGGREGATE_LOG_MAX_SIZE` - Buffer ceiling in bytes (default: 100000)
//! - `AGGREGATE_LOG_EMPTY_ENTRIES` - Write requests that logged nothing (default: true)
//! - `AGGREGATE_LOG_UTC` - Format the request time in UTC (default: true)
//! - `AGGREGATE_LOG_TIME_FORMAT` - strftime format for the request time (default: RFC 3339)
//! - `AGGREGATE_LOG_TRACE_ID_FIELD` - Header key for the request id (default: requestID)
//! - `AGGREGATE_LOG_TRACE_ID_HEADER` - Request header carrying a trace id (default: uber-trace-id, empty disables)
//! - `AGGREGATE_LOG_CONTEXT_TRACE_ID_FIELD` - Context field carrying a trace id (default: `RequestID`, empty disables)

use std::fmt::{self, Write as _};
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use aggregate_log_core::{DEFAULT_BANNER, DEFAULT_MAX_SIZE, LogBufferOptions};
use axum::http::{HeaderName, Method, StatusCode};
use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

use crate::sink::LogSink;

/// Header key used for the request id in aggregated output.
pub const DEFAULT_TRACE_ID_FIELD: &str = "requestID";

/// Request header a Jaeger-style tracer puts its trace id in.
pub const DEFAULT_TRACE_ID_HEADER: &str = "uber-trace-id";

/// Context field upstream middleware may have stored a request id under.
pub const DEFAULT_CONTEXT_TRACE_ID_FIELD: &str = "RequestID";

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Decides whether a finished request's logs are written at all.
///
/// Return `false` to drop the request's output, e.g. to only keep requests
/// that did not succeed.
pub type ReducedLoggingFn = Arc<dyn Fn(&RequestSummary) -> bool + Send + Sync>;

/// What the middleware knows about a request once the response is ready.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    /// Resolved request or trace id.
    pub request_id: String,
    /// Response status.
    pub status: StatusCode,
    /// Request method.
    pub method: Method,
    /// Request path, captured before inner services ran.
    pub path: String,
    /// Client address, empty when unknown.
    pub client_ip: String,
    /// Time spent in inner services.
    pub latency: Duration,
    /// `User-Agent` header, empty when absent.
    pub user_agent: String,
    /// Completion time formatted per the config.
    pub time: String,
    /// Errors recorded while handling, one `Error #NN: ...` line each.
    pub comment: String,
}

impl RequestSummary {
    /// Latency right-aligned in a 13 character column.
    #[must_use]
    pub fn formatted_latency(&self) -> String {
        format!("{:>13}", format!("{:?}", self.latency))
    }

    /// Whether any error was recorded for the request.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.comment.is_empty()
    }
}

/// Request logging middleware configuration.
///
/// Each middleware instance owns its configuration, so several instances in
/// one process can use different trace id fields or sinks.
#[derive(Clone)]
pub struct AggregateLogConfig {
    /// Buffer each request's logs and write them as one JSON line.
    pub aggregate_logging: bool,
    /// Minimum level kept in the buffer.
    pub log_level: LevelFilter,
    /// Add a banner to each request's output.
    pub use_banner: bool,
    /// Banner text replacing [`DEFAULT_BANNER`].
    pub custom_banner: Option<String>,
    /// Buffer ceiling in bytes.
    pub max_buffer_size: usize,
    /// Write aggregated output even when nothing was logged.
    pub empty_aggregate_entries: bool,
    /// Format the request time in UTC instead of local time.
    pub utc: bool,
    /// strftime format for the request time; RFC 3339 when `None`.
    pub time_format: Option<String>,
    /// Header key for the request id in aggregated output. Unused in
    /// immediate mode.
    pub trace_id_field: String,
    /// Request header checked for a trace id.
    pub trace_id_header: Option<HeaderName>,
    /// [`ContextFields`](crate::middleware::ContextFields) key checked for a trace id.
    pub context_trace_id_field: Option<String>,
    /// Where aggregated output goes.
    pub sink: LogSink,
    /// Optional filter applied to every finished request.
    pub reduced_logging: Option<ReducedLoggingFn>,
}

impl fmt::Debug for AggregateLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateLogConfig")
            .field("aggregate_logging", &self.aggregate_logging)
            .field("log_level", &self.log_level)
            .field("use_banner", &self.use_banner)
            .field("custom_banner", &self.custom_banner)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("empty_aggregate_entries", &self.empty_aggregate_entries)
            .field("utc", &self.utc)
            .field("time_format", &self.time_format)
            .field("trace_id_field", &self.trace_id_field)
            .field("trace_id_header", &self.trace_id_header)
            .field("context_trace_id_field", &self.context_trace_id_field)
            .field("sink", &self.sink)
            .field(
                "reduced_logging",
                &self.reduced_logging.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl Default for AggregateLogConfig {
    fn default() -> Self {
        Self {
            aggregate_logging: false,
            log_level: LevelFilter::DEBUG,
            use_banner: false,
            custom_banner: None,
            max_buffer_size: DEFAULT_MAX_SIZE,
            empty_aggregate_entries: true,
            utc: true,
            time_format: None,
            trace_id_field: DEFAULT_TRACE_ID_FIELD.to_string(),
            trace_id_header: Some(HeaderName::from_static(DEFAULT_TRACE_ID_HEADER)),
            context_trace_id_field: Some(DEFAULT_CONTEXT_TRACE_ID_FIELD.to_string()),
            sink: LogSink::stdout(),
            reduced_logging: None,
        }
    }
}

impl AggregateLogConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source.
    ///
    /// Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value is present but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let trace_id_header = match lookup("AGGREGATE_LOG_TRACE_ID_HEADER") {
            None => defaults.trace_id_header,
            Some(value) if value.is_empty() => None,
            Some(value) => Some(parse_value("AGGREGATE_LOG_TRACE_ID_HEADER", &value)?),
        };
        let context_trace_id_field = match lookup("AGGREGATE_LOG_CONTEXT_TRACE_ID_FIELD") {
            None => defaults.context_trace_id_field,
            Some(value) if value.is_empty() => None,
            Some(value) => Some(value),
        };

        Ok(Self {
            aggregate_logging: parse_or(
                &lookup,
                "AGGREGATE_LOG_ENABLED",
                defaults.aggregate_logging,
            )?,
            log_level: parse_or(&lookup, "AGGREGATE_LOG_LEVEL", defaults.log_level)?,
            use_banner: parse_or(&lookup, "AGGREGATE_LOG_BANNER", defaults.use_banner)?,
            custom_banner: lookup("AGGREGATE_LOG_CUSTOM_BANNER").filter(|s| !s.is_empty()),
            max_buffer_size: parse_or(
                &lookup,
                "AGGREGATE_LOG_MAX_SIZE",
                defaults.max_buffer_size,
            )?,
            empty_aggregate_entries: parse_or(
                &lookup,
                "AGGREGATE_LOG_EMPTY_ENTRIES",
                defaults.empty_aggregate_entries,
            )?,
            utc: parse_or(&lookup, "AGGREGATE_LOG_UTC", defaults.utc)?,
            time_format: lookup("AGGREGATE_LOG_TIME_FORMAT").filter(|s| !s.is_empty()),
            trace_id_field: lookup("AGGREGATE_LOG_TRACE_ID_FIELD")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.trace_id_field),
            trace_id_header,
            context_trace_id_field,
            sink: defaults.sink,
            reduced_logging: None,
        })
    }

    /// Buffer each request's logs and write them as one JSON line.
    #[must_use]
    pub const fn with_aggregate_logging(mut self, enabled: bool) -> Self {
        self.aggregate_logging = enabled;
        self
    }

    /// Minimum level kept in the buffer.
    #[must_use]
    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Add a banner to each request's output.
    #[must_use]
    pub const fn with_banner(mut self, enabled: bool) -> Self {
        self.use_banner = enabled;
        self
    }

    /// Replace the default banner text.
    #[must_use]
    pub fn with_custom_banner(mut self, banner: impl Into<String>) -> Self {
        self.custom_banner = Some(banner.into());
        self
    }

    /// Buffer ceiling in bytes.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, max_size: usize) -> Self {
        self.max_buffer_size = max_size;
        self
    }

    /// Whether requests that buffered no entries are still written.
    #[must_use]
    pub const fn with_empty_aggregate_entries(mut self, enabled: bool) -> Self {
        self.empty_aggregate_entries = enabled;
        self
    }

    /// Format the request time in UTC (`true`) or local time.
    #[must_use]
    pub const fn with_utc(mut self, utc: bool) -> Self {
        self.utc = utc;
        self
    }

    /// strftime format for the request time.
    #[must_use]
    pub fn with_time_format(mut self, format: impl Into<String>) -> Self {
        self.time_format = Some(format.into());
        self
    }

    /// Header key for the request id in aggregated output.
    ///
    /// Only applies in aggregate mode. Immediate-mode access events always
    /// carry the id in a `request_id` field.
    #[must_use]
    pub fn with_trace_id_field(mut self, field: impl Into<String>) -> Self {
        self.trace_id_field = field.into();
        self
    }

    /// Request header checked for a trace id; `None` disables the check.
    #[must_use]
    pub fn with_trace_id_header(mut self, header: Option<HeaderName>) -> Self {
        self.trace_id_header = header;
        self
    }

    /// Context field checked for a trace id; `None` disables the check.
    #[must_use]
    pub fn with_context_trace_id_field(mut self, field: Option<String>) -> Self {
        self.context_trace_id_field = field;
        self
    }

    /// Write aggregated output to `writer` instead of stdout.
    #[must_use]
    pub fn with_writer(mut self, writer: impl io::Write + Send + 'static) -> Self {
        self.sink = LogSink::new(writer);
        self
    }

    /// Write aggregated output to an existing sink.
    #[must_use]
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Only write a request's logs when `filter` returns `true`.
    #[must_use]
    pub fn with_reduced_logging<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RequestSummary) -> bool + Send + Sync + 'static,
    {
        self.reduced_logging = Some(Arc::new(filter));
        self
    }

    /// Banner text in effect.
    #[must_use]
    pub fn banner_text(&self) -> &str {
        self.custom_banner.as_deref().unwrap_or(DEFAULT_BANNER)
    }

    /// Options for a request's buffer.
    #[must_use]
    pub fn buffer_options(&self) -> LogBufferOptions {
        LogBufferOptions::default()
            .with_banner(self.use_banner)
            .with_custom_banner(self.banner_text())
            .with_max_size(self.max_buffer_size)
    }

    /// Whether the reduced-logging filter keeps `summary`.
    #[must_use]
    pub fn should_log(&self, summary: &RequestSummary) -> bool {
        self.reduced_logging
            .as_ref()
            .is_none_or(|filter| filter(summary))
    }

    /// Format `at` for the `time` field.
    ///
    /// An unusable format string falls back to RFC 3339.
    #[must_use]
    pub fn format_time(&self, at: DateTime<Utc>) -> String {
        if self.utc {
            format_in(&at, self.time_format.as_deref())
        } else {
            format_in(&at.with_timezone(&Local), self.time_format.as_deref())
        }
    }
}

fn format_in<Tz>(at: &DateTime<Tz>, format: Option<&str>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if let Some(format) = format {
        let mut out = String::new();
        if write!(out, "{}", at.format(format)).is_ok() {
            return out;
        }
    }
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a present value, keeping `default` when the key is unset.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key).map_or(Ok(default), |value| parse_value(key, &value))
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}
