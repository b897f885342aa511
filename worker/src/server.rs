//! HTTP endpoints for Prometheus scraping and liveness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use boxoffice_runtime::metrics::PrometheusMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Router serving `GET /metrics` and `GET /health`.
pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health_check))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<PrometheusMetrics>>) -> (StatusCode, String) {
    match metrics.render() {
        Some(body) => (StatusCode::OK, body),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed by this process".to_string(),
        ),
    }
}

#[allow(clippy::unused_async)]
async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Metrics server running on its own task.
pub struct MetricsServer {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve [`router`] until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the address cannot be bound.
    pub async fn start(addr: SocketAddr, metrics: Arc<PrometheusMetrics>) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tracing::info!(%addr, "Metrics server listening");

        let join = tokio::spawn(async move {
            let served = axum::serve(listener, router(metrics))
                .with_graceful_shutdown(async move {
                    shutdown_rx.changed().await.ok();
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });

        Ok(Self { shutdown_tx, join })
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).ok();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Metrics server task ended abnormally");
        }
    }
}
