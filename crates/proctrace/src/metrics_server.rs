//! Prometheus scrape endpoint.

use crate::metrics::PipelineMetrics;
use crate::shutdown::ShutdownSignal;
use axum::extract::State;
use axum::http::{StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};
use tokio::net::TcpListener;

/// Routes `GET /metrics` and `GET /` to the text exposition of `metrics`.
pub fn router(metrics: PipelineMetrics) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<PipelineMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serves the scrape endpoint on `listener` until `stop` is triggered.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: PipelineMetrics,
    stop: ShutdownSignal,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "metrics server listening");
    }

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { stop.wait().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_scrape_and_shutdown() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.inc_records_received();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = ShutdownSignal::new();
        let server = tokio::spawn(serve_metrics(listener, metrics, stop.clone()));

        for path in ["/metrics", "/"] {
            let response = get(addr, path).await;
            assert!(response.starts_with("HTTP/1.1 200"), "{response}");
            assert!(response.contains("text/plain; version=0.0.4"));
            assert!(response.contains("records_received_total 1"));
        }
        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        stop.shutdown();
        server.await.unwrap().unwrap();
    }
}
