//! Prometheus scrape endpoint

use crate::errors::{PipelineError, Result};
use crate::metrics::MetricsRegistry;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A running `/metrics` server. Stops when its token is cancelled.
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve the registry until `token` is cancelled.
    pub async fn start(
        registry: MetricsRegistry,
        addr: SocketAddr,
        token: CancellationToken,
    ) -> Result<Self> {
        let metrics_handler = move || {
            let registry = registry.clone();
            async move {
                match registry.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Failed to encode metrics: {}", e),
                        )
                            .into_response()
                    }
                }
            }
        };

        let app = Router::new().route("/metrics", get(metrics_handler)).route(
            "/",
            get(|| async { "telemetry sidecar\n\nGET /metrics - Prometheus metrics endpoint\n" }),
        );

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            PipelineError::Metrics(format!("failed to bind metrics server on {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Metrics HTTP server listening");

        let task = tokio::spawn(async move {
            let shutdown = token.cancelled_owned();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Metrics server error: {}", e);
            }
            info!("Metrics HTTP server stopped");
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish after its token was cancelled.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!("Metrics server task failed: {}", e);
        }
    }
}
