//! Demo HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # Aggregate every request's logs into one JSON line
//! aggregate-log-demo serve --aggregate --banner
//!
//! # Only keep warnings and errors in the aggregated line
//! aggregate-log-demo serve --aggregate --level warn
//! ```
//!
//! # Routes
//!
//! - `GET /` - logs a few entries, sets a header, and spawns a task that
//!   logs after the response is sent
//! - `GET /fail` - records an error and responds `401 Unauthorized`
//!
//! The middleware also reads `AGGREGATE_LOG_*` variables; flags win over the
//! environment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aggregate_log_axum::{AggregateLogConfig, ConfigError, RequestLogger, with_tracing};
use axum::{Router, http::StatusCode, routing::get};
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

/// Errors that can occur while running the demo server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Middleware configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listener could not be bound.
    #[error("Failed to bind to {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    /// The server stopped with an error.
    #[error("Server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Flags for the `serve` subcommand.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub addr: SocketAddr,
    pub aggregate: bool,
    pub banner: bool,
    pub level: Option<LevelFilter>,
    pub custom_banner: Option<String>,
}

/// Apply command line flags on top of the environment config.
#[must_use]
pub fn apply_options(mut config: AggregateLogConfig, options: &ServeOptions) -> AggregateLogConfig {
    if options.aggregate {
        config = config.with_aggregate_logging(true);
    }
    if options.banner {
        config = config.with_banner(true);
    }
    if let Some(level) = options.level {
        config = config.with_log_level(level);
    }
    if let Some(banner) = &options.custom_banner {
        config = config.with_custom_banner(banner.clone());
    }
    config
}

/// Build the demo router.
pub fn router(config: Arc<AggregateLogConfig>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/fail", get(fail))
        .layer(axum::middleware::from_fn_with_state(config, with_tracing))
}

/// Run the demo server until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns `ServeError` if the config is invalid, the address cannot be
/// bound, or the server fails.
pub async fn run(options: ServeOptions) -> Result<(), ServeError> {
    let config = apply_options(AggregateLogConfig::from_env()?, &options);
    tracing::info!(
        aggregate = config.aggregate_logging,
        banner = config.use_banner,
        level = %config.log_level,
        "Request logging configured"
    );

    let app = router(Arc::new(config));

    let listener = tokio::net::TcpListener::bind(options.addr)
        .await
        .map_err(|e| ServeError::Bind(options.addr, e))?;
    tracing::info!("demo listening on {}", options.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(ServeError::Server)
}

async fn hello(logger: RequestLogger) -> &'static str {
    logger.set_header(
        "new-header-index-name",
        "this is how you set new header level data",
    );

    tracing::info!(
        "this will be aggregated into one write with the access log and will show up when the request is completed"
    );
    tracing::debug!(
        comment = "this is an aggregated log entry with a comment field",
        "aggregated entry with comment field"
    );

    // The request's buffer is written before this task finishes.
    let detached = logger.detached();
    tokio::spawn(async move {
        detached
            .instrument(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                tracing::info!("Hi from a task completing after the request");
            })
            .await;

        if let Err(e) = detached.flush() {
            tracing::warn!(error = %e, "Failed to write detached request log");
        }
    });

    "Hello world!"
}

async fn fail(logger: RequestLogger) -> StatusCode {
    tracing::warn!("rejecting request without credentials");
    logger.record_error("unauthorized: missing credentials");
    StatusCode::UNAUTHORIZED
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn options() -> ServeOptions {
        ServeOptions {
            addr: SocketAddr::from(([127, 0, 0, 1], 29090)),
            aggregate: false,
            banner: false,
            level: None,
            custom_banner: None,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let options = ServeOptions {
            aggregate: true,
            banner: true,
            level: Some(LevelFilter::WARN),
            custom_banner: Some("== demo ==".to_string()),
            ..options()
        };
        let config = apply_options(AggregateLogConfig::default(), &options);
        assert!(config.aggregate_logging);
        assert!(config.use_banner);
        assert_eq!(config.log_level, LevelFilter::WARN);
        assert_eq!(config.banner_text(), "== demo ==");
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let base = AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_log_level(LevelFilter::ERROR);
        let config = apply_options(base, &options());
        assert!(config.aggregate_logging);
        assert_eq!(config.log_level, LevelFilter::ERROR);
        assert!(!config.use_banner);
    }

    #[tokio::test]
    async fn test_routes() {
        let config = AggregateLogConfig::default().with_writer(std::io::sink());
        let app = router(Arc::new(config));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
