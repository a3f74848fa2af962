//! HTTP endpoint for Prometheus scraping.
//!
//! Serves `GET /metrics` (text exposition) and `GET /health`. The registry is
//! only ever read here; nothing is pushed.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::prometheus::MetricsRegistry;
use crate::error::MetricsError;

/// Builds the metrics router.
pub fn router(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<MetricsRegistry>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        metrics.export(),
    )
}

async fn health_handler() -> &'static str {
    "ok"
}

/// A bound metrics endpoint, ready to serve.
pub struct MetricsServer {
    listener: TcpListener,
    metrics: MetricsRegistry,
}

impl MetricsServer {
    /// Binds the endpoint on all interfaces.
    ///
    /// Binding happens up front so a port conflict fails worker startup
    /// instead of surfacing later from a background task.
    pub async fn bind(port: u16, metrics: MetricsRegistry) -> Result<Self, MetricsError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MetricsError::Bind { port, source })?;
        Ok(Self { listener, metrics })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, MetricsError> {
        self.listener.local_addr().map_err(MetricsError::Serve)
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MetricsError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Prometheus metrics server started");
        }

        axum::serve(self.listener, router(self.metrics))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(MetricsError::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_exposition() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.set_queue_depth(12);
        metrics.record_job_success();

        let server = MetricsServer::bind(0, metrics).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let base = format!("http://127.0.0.1:{}", port);
        let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert!(response.status().is_success());
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));

        let body = response.text().await.unwrap();
        assert!(body.contains(r#"agent_queue_depth{queue="default"} 12"#));
        assert!(body.contains(r#"agent_jobs_processed_total{status="ok"} 1"#));

        let health = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(health, "ok");

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server should stop on cancel")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let metrics = MetricsRegistry::new().unwrap();
        let first = MetricsServer::bind(0, metrics.clone()).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = MetricsServer::bind(port, metrics).await.err().unwrap();
        assert!(matches!(err, MetricsError::Bind { .. }));
    }
}
