//! Loggers that outlive their request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aggregate_log_axum::{AggregateLogConfig, RequestLogger};
use aggregate_log_integration_tests::{CapturedOutput, get, with_logging};
use axum::{Router, routing::get as get_route};
use serde_json::Value;
use tokio::sync::oneshot;

#[tokio::test]
async fn test_detached_logger_flushes_after_request() {
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    let handler = move |logger: RequestLogger| {
        let done = done_tx.lock().ok().and_then(|mut tx| tx.take());
        async move {
            logger.set_header("new-header-index-name", "shared");
            tracing::info!("during the request");

            let detached = logger.detached();
            tokio::spawn(async move {
                detached
                    .instrument(async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        tracing::info!("Hi from a task completing after the request");
                    })
                    .await;
                let _ = detached.flush();
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
            "Hello world!"
        }
    };

    let output = CapturedOutput::new();
    let app = with_logging(
        Router::new().route("/", get_route(handler)),
        AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_writer(output.clone()),
    );

    get(&app, "/", &[("uber-trace-id", "detached-1")]).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), done_rx).await;

    let lines = output.json_lines();
    assert_eq!(lines.len(), 2);

    let request_line = lines.first().cloned().unwrap_or_default();
    let detached_line = lines.get(1).cloned().unwrap_or_default();

    assert!(request_line.to_string().contains("during the request"));
    assert!(!request_line.to_string().contains("completing after"));

    assert!(detached_line.to_string().contains("completing after the request"));
    assert!(!detached_line.to_string().contains("during the request"));
    // Headers are shared, including the access fields stored after the response
    assert_eq!(detached_line["new-header-index-name"], "shared");
    assert_eq!(detached_line["requestID"], "detached-1");
    assert_eq!(detached_line["status"], 200);
    assert_eq!(detached_line.get("banner"), None::<&Value>);
}

#[tokio::test]
async fn test_detached_with_copied_headers_snapshot() {
    let output = CapturedOutput::new();
    let copy_output = output.clone();

    let handler = move |logger: RequestLogger| async move {
        logger.set_header("before", 1);
        let detached = logger.detached_with_copied_headers();
        logger.set_header("after", 2);

        detached.in_scope(|| tracing::warn!("copied logger entry"));
        let _ = detached.flush();
        "ok"
    };

    let app = with_logging(
        Router::new().route("/", get_route(handler)),
        AggregateLogConfig::default()
            .with_aggregate_logging(true)
            .with_writer(copy_output),
    );

    get(&app, "/", &[]).await;

    let lines = output.json_lines();
    assert_eq!(lines.len(), 2);

    // The detached line is flushed inside the handler, so it comes first
    let detached_line = lines.first().cloned().unwrap_or_default();
    assert_eq!(detached_line["before"], 1);
    assert_eq!(detached_line.get("after"), None);
    assert!(detached_line.get("banner").is_some());
    assert!(detached_line.to_string().contains("copied logger entry"));

    let request_line = lines.get(1).cloned().unwrap_or_default();
    assert_eq!(request_line["before"], 1);
    assert_eq!(request_line["after"], 2);
    assert!(!request_line.to_string().contains("copied logger entry"));
}
