//! Access logging middleware.
//!
//! Wraps every request, resolves its id, and writes one access record once
//! the response is ready. In aggregate mode the handler's own events are
//! buffered and written together with the access record as a single JSON
//! line.

use std::sync::Arc;
use std::time::Instant;

use aggregate_log_core::LogBuffer;
use axum::{
    extract::{Request, State},
    http::header::USER_AGENT,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::Level;

use crate::config::{AggregateLogConfig, RequestSummary};
use crate::middleware::logger::RequestLogger;
use crate::middleware::request_id::{client_ip, resolve_request_id};

/// Emit the access event for `$summary` at `$level`.
macro_rules! access_event {
    ($level:expr, $summary:ident, $($message:tt)+) => {
        tracing::event!(
            $level,
            request_id = %$summary.request_id,
            status = $summary.status.as_u16(),
            method = %$summary.method,
            path = %$summary.path,
            ip = %$summary.client_ip,
            latency = %$summary.formatted_latency(),
            "user-agent" = %$summary.user_agent,
            time = %$summary.time,
            comment = %$summary.comment,
            $($message)+
        )
    };
}

/// Request logging middleware.
///
/// Apply with `axum::middleware::from_fn_with_state`:
///
/// ```ignore
/// let config = Arc::new(AggregateLogConfig::default().with_aggregate_logging(true));
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(config, with_tracing));
/// ```
pub async fn with_tracing(
    State(config): State<Arc<AggregateLogConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();

    let (mut parts, body) = request.into_parts();
    let request_id = resolve_request_id(&mut parts.extensions, &parts.headers, &config);
    let client_ip = client_ip(&parts.headers, &parts.extensions);
    let user_agent = parts
        .headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let method = parts.method.clone();
    let path = parts.uri.path().to_owned();

    let logger = RequestLogger::new(
        Arc::clone(&config),
        request_id.clone(),
        method.clone(),
        path.clone(),
    );
    parts.extensions.insert(logger.clone());
    let request = Request::from_parts(parts, body);

    let response = if logger.is_aggregate() {
        logger.instrument(next.run(request)).await
    } else {
        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %method,
            path = %path,
        );
        tracing::Instrument::instrument(next.run(request), span).await
    };

    let summary = RequestSummary {
        request_id: request_id.0,
        status: response.status(),
        method,
        path,
        client_ip,
        latency: start.elapsed(),
        user_agent,
        time: config.format_time(Utc::now()),
        comment: logger.error_comment(),
    };

    if !config.should_log(&summary) {
        return response;
    }

    match logger.buffer() {
        Some(buffer) => write_aggregate(&config, &logger, buffer, &summary),
        None => log_access(&config, &summary),
    }

    response
}

/// Store the summary as buffer headers and write the rendered line.
fn write_aggregate(
    config: &AggregateLogConfig,
    logger: &RequestLogger,
    buffer: &LogBuffer,
    summary: &RequestSummary,
) {
    buffer.store_header(config.trace_id_field.as_str(), summary.request_id.as_str());
    buffer.store_header("status", summary.status.as_u16());
    buffer.store_header("method", summary.method.as_str());
    buffer.store_header("path", summary.path.as_str());
    buffer.store_header("ip", summary.client_ip.as_str());
    buffer.store_header("latency", summary.formatted_latency());
    buffer.store_header("user-agent", summary.user_agent.as_str());
    buffer.store_header("time", summary.time.as_str());
    buffer.store_header("comment", summary.comment.as_str());

    if summary.has_errors() {
        let before = buffer.len();
        logger.in_scope(|| tracing::error!("{}", summary.comment.trim_end()));
        if buffer.len() == before && Level::ERROR <= config.log_level {
            tracing::warn!(
                request_id = %summary.request_id,
                max_size = buffer.max_size(),
                "Log buffer full, error entry dropped"
            );
        }
    }

    if !config.empty_aggregate_entries && buffer.is_empty() {
        return;
    }

    if let Err(e) = config.sink.write_line(&buffer.render()) {
        tracing::warn!(
            request_id = %summary.request_id,
            error = %e,
            "Failed to write aggregated request log"
        );
    }
}

/// Emit the access record to the application's subscriber.
fn log_access(config: &AggregateLogConfig, summary: &RequestSummary) {
    if summary.has_errors() {
        access_event!(Level::ERROR, summary, "{}", summary.comment.trim_end());
    } else if config.use_banner {
        access_event!(Level::INFO, summary, "{}", config.banner_text());
    } else {
        access_event!(Level::INFO, summary, "request completed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use serde_json::Value;
    use tower::ServiceExt;
    use tracing::instrument::WithSubscriber;
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| io::Error::other("Mutex poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    async fn ok_handler(logger: RequestLogger) -> &'static str {
        tracing::debug!("debug entry");
        tracing::info!("info entry");
        logger.set_header("handler", "ok");
        "ok"
    }

    async fn fail_handler(logger: RequestLogger) -> StatusCode {
        logger.record_error("bad token");
        StatusCode::UNAUTHORIZED
    }

    fn app(config: AggregateLogConfig) -> Router {
        Router::new()
            .route("/", get(ok_handler))
            .route("/fail", get(fail_handler))
            .route("/quiet", get(|| async { "quiet" }))
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(config),
                with_tracing,
            ))
    }

    async fn call(app: Router, uri: &str) -> StatusCode {
        let request = axum::http::Request::builder()
            .uri(uri)
            .header("uber-trace-id", "trace-123")
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_aggregate_line_shape() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_writer(captured.clone());

        assert_eq!(call(app(config), "/").await, StatusCode::OK);

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["requestID"], "trace-123");
        assert_eq!(line["status"], 200);
        assert_eq!(line["method"], "GET");
        assert_eq!(line["path"], "/");
        assert_eq!(line["user-agent"], "test-agent");
        assert_eq!(line["handler"], "ok");
        assert_eq!(line["comment"], "");
        assert_eq!(line["latency"].as_str().unwrap().len(), 13);
        assert!(line.get("banner").is_none());

        let entries = line["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["message"], "debug entry");
        assert_eq!(entries[1]["message"], "info entry");
    }

    #[tokio::test]
    async fn test_aggregate_respects_level() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_log_level(LevelFilter::INFO)
            .with_writer(captured.clone());

        call(app(config), "/").await;

        let lines = captured.lines();
        let entries = lines[0]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["level"], "INFO");
    }

    #[tokio::test]
    async fn test_aggregate_error_entry() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_empty_aggregate_entries(false)
            .with_writer(captured.clone());

        assert_eq!(call(app(config), "/fail").await, StatusCode::UNAUTHORIZED);

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["status"], 401);
        assert_eq!(lines[0]["comment"], "Error #01: bad token\n");
        let entries = lines[0]["entries"].as_array().unwrap();
        assert_eq!(entries[0]["level"], "ERROR");
        assert_eq!(entries[0]["message"], "Error #01: bad token");
    }

    #[tokio::test]
    async fn test_empty_aggregate_entries_skipped() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_empty_aggregate_entries(false)
            .with_writer(captured.clone());

        call(app(config), "/quiet").await;
        assert!(captured.lines().is_empty());
    }

    #[tokio::test]
    async fn test_empty_aggregate_entries_written_by_default() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_writer(captured.clone());

        call(app(config), "/quiet").await;
        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["entries"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_reduced_logging_drops_success() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_writer(captured.clone())
            .with_reduced_logging(|s| !s.status.is_success());

        let app = app(config);
        call(app.clone(), "/").await;
        assert!(captured.lines().is_empty());

        call(app, "/fail").await;
        assert_eq!(captured.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_immediate_mode_writes_nothing_to_sink() {
        let captured = Captured::default();
        let config = AggregateLogConfig::default().with_writer(captured.clone());

        assert_eq!(call(app(config.clone()), "/").await, StatusCode::OK);
        assert_eq!(call(app(config), "/fail").await, StatusCode::UNAUTHORIZED);
        assert!(captured.lines().is_empty());
    }

    /// Subscriber that records the application-level events as JSON lines.
    fn app_subscriber(out: &Captured) -> impl tracing::Subscriber + Send + Sync {
        let out = out.clone();
        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_ansi(false)
            .with_writer(move || out.clone())
            .finish()
    }

    #[tokio::test]
    async fn test_full_buffer_warns_when_error_entry_dropped() {
        let captured = Captured::default();
        let events = Captured::default();
        let config = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_max_buffer_size(300)
            .with_writer(captured.clone());
        let app = Router::new()
            .route(
                "/",
                get(|logger: RequestLogger| async move {
                    for i in 0..50 {
                        tracing::info!(i, "filler entry");
                    }
                    logger.record_error("boom");
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(config),
                with_tracing,
            ));

        let status = call(app, "/").with_subscriber(app_subscriber(&events)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["comment"], "Error #01: boom\n");
        let entries = lines[0]["entries"].as_array().unwrap();
        assert!(!entries.is_empty() && entries.len() < 50);
        assert!(entries.iter().all(|e| e["level"] == "INFO"));

        let warnings = events.lines();
        assert!(warnings.iter().any(|w| {
            w["level"] == "WARN" && w["message"] == "Log buffer full, error entry dropped"
        }));
    }

    #[tokio::test]
    async fn test_immediate_access_event_fields() {
        let captured = Captured::default();
        let events = Captured::default();
        let config = AggregateLogConfig::default().with_writer(captured.clone());

        let status = call(app(config), "/fail")
            .with_subscriber(app_subscriber(&events))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(captured.lines().is_empty());

        let lines = events.lines();
        let access = lines.iter().find(|l| l.get("status").is_some()).unwrap();
        assert_eq!(access["level"], "ERROR");
        assert_eq!(access["status"], 401);
        assert_eq!(access["request_id"], "trace-123");
        assert_eq!(access["user-agent"], "test-agent");
        assert_eq!(access["message"], "Error #01: bad token");
        assert!(access.get("user_agent").is_none());
    }
}
