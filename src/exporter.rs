//! Prometheus scrape endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::MetricsSink;

/// Content type of the Prometheus text exposition format.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Build the exporter router: `GET /metrics` and `GET /health`.
pub fn router(sink: Arc<MetricsSink>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .fallback(fallback)
        .with_state(sink)
}

/// Serve the router on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, sink: Arc<MetricsSink>, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("exporter listener has no local address")?;
    info!(%addr, "serving metrics");

    axum::serve(listener, router(sink))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("metrics exporter failed")?;

    info!(%addr, "metrics exporter stopped");
    Ok(())
}

async fn metrics(State(sink): State<Arc<MetricsSink>>) -> Response {
    match sink.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

async fn health(State(sink): State<Arc<MetricsSink>>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "totals": sink.snapshot(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    }))
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Counter, Phase};
    use axum::body::Body;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_text_format() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        sink.increment_counter(Counter::DiscoverSent);
        sink.observe_latency(Phase::RequestAck, 42.0);

        let resp = router(sink)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], TEXT_FORMAT);
        let body = body_string(resp).await;
        assert!(body.contains("discover_packets_sent 1"));
        assert!(body.contains("request_ack_latency_count 1"));
        assert!(body.contains("# TYPE discover_offer_latency histogram"));
    }

    #[tokio::test]
    async fn test_health_reports_totals() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        sink.increment_counter(Counter::RequestSent);

        let resp = router(sink)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["totals"]["requests_sent"], 1);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let resp = router(sink)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_answers_and_stops_on_cancel() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, sink, cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("discover_packets_sent 0"));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("exporter did not shut down")
            .unwrap()
            .unwrap();
    }
}
