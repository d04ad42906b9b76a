//! Sidecar assembly: builds one pipe from configuration and runs it

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::fetcher::{FileFetcher, FileSourceSettings};
use crate::forwarder::{HttpForwarder, HttpForwarderSettings};
use crate::gatherer::{Gatherer, GathererConfig};
use crate::metrics::{MetricsRegistry, PipelineMetrics};
use crate::metrics_server::MetricsServer;
use crate::pipeline::Pipeline;
use crate::processor::{ForwardProcessor, ForwardProcessorSettings};
use crate::queue::build_queue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// The sidecar process: file source, queue, gateway forwarder.
pub struct SidecarCollector {
    config: Config,
    collector_id: String,
    registry: MetricsRegistry,
    metrics: PipelineMetrics,
    pipeline: Pipeline,
}

impl SidecarCollector {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let registry = MetricsRegistry::new();
        let metrics = registry.pipeline_metrics()?;

        let queue = build_queue(&config)?;
        let fetcher = FileFetcher::new(FileSourceSettings::from(&config));
        let gatherer = Gatherer::new(
            GathererConfig::from(&config),
            Box::new(fetcher),
            queue,
            metrics.clone(),
        );

        let forwarder = HttpForwarder::new(HttpForwarderSettings::from(&config))?;
        let processor = ForwardProcessor::new(
            Arc::new(forwarder),
            ForwardProcessorSettings::from(&config),
        );

        Ok(Self {
            collector_id: Uuid::new_v4().to_string(),
            pipeline: Pipeline::new(gatherer, Arc::new(processor)),
            config,
            registry,
            metrics,
        })
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Run until Ctrl-C.
    pub async fn start(self) -> Result<()> {
        let token = CancellationToken::new();

        let signal_token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to wait for shutdown signal: {}", e),
            }
            signal_token.cancel();
        });

        self.run(token).await
    }

    /// Prepare the pipe and run it until `token` is cancelled.
    #[instrument(skip_all, fields(pipe = %self.config.pipe_name))]
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(
            collector_id = %self.collector_id,
            service = %self.config.service_name,
            "Starting sidecar collector"
        );

        let server_token = token.child_token();
        let server = match self.config.metrics_addr {
            Some(addr) => Some(
                MetricsServer::start(self.registry.clone(), addr, server_token.clone()).await?,
            ),
            None => {
                info!("Metrics HTTP server disabled");
                None
            }
        };

        if let Err(e) = self.pipeline.prepare().await {
            server_token.cancel();
            if let Some(server) = server {
                server.stopped().await;
            }
            return Err(e);
        }

        let reporter = tokio::spawn(report_metrics(
            self.config.pipe_name.clone(),
            self.metrics.clone(),
            self.config.metrics_interval,
            token.clone(),
        ));

        let result = self.pipeline.run(token.clone()).await;
        token.cancel();
        let _ = reporter.await;
        if let Some(server) = server {
            server.stopped().await;
        }

        let summary = self.metrics.summary(&self.config.pipe_name);
        info!(
            fetched = summary.fetched,
            abandoned = summary.abandoned,
            delivered = summary.delivered,
            errors = summary.errors,
            "Sidecar collector shutdown complete"
        );
        result
    }
}

const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Log a metrics summary every `period` until cancelled.
async fn report_metrics(
    pipe: String,
    metrics: PipelineMetrics,
    period: Duration,
    token: CancellationToken,
) {
    let mut metrics_interval = interval(period.max(MIN_REPORT_INTERVAL));
    metrics_interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = metrics_interval.tick() => {}
        }

        let summary = metrics.summary(&pipe);
        info!(
            pipe = %pipe,
            fetched = summary.fetched,
            abandoned = summary.abandoned,
            delivered = summary.delivered,
            errors = summary.errors,
            "Pipeline metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueKind;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            partition_count: 0,
            ..Config::default()
        };
        assert!(matches!(
            SidecarCollector::new(config),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_report_interval_does_not_panic() {
        let metrics = MetricsRegistry::new().pipeline_metrics().unwrap();
        let token = CancellationToken::new();
        let reporter = tokio::spawn(report_metrics(
            "pipe".to_string(),
            metrics,
            Duration::ZERO,
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        reporter.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_lines_reach_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/telemetry"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "ERROR: payment failed").unwrap();
        log.flush().unwrap();
        let queue_dir = TempDir::new().unwrap();

        let config = Config {
            gateway_url: server.uri(),
            log_paths: vec![log.path().to_string_lossy().to_string()],
            file_poll_interval: Duration::from_millis(10),
            partition_count: 2,
            queue_kind: QueueKind::File,
            queue_dir: queue_dir.path().to_path_buf(),
            empty_poll_interval: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(5),
            flush_interval: Duration::from_millis(20),
            retry_backoff_ms: 5,
            metrics_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..Config::default()
        };

        let collector = SidecarCollector::new(config).unwrap();
        let registry = collector.registry().clone();
        let token = CancellationToken::new();
        let running = tokio::spawn(collector.run(token.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.received_requests().await.unwrap_or_default().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        running.await.unwrap().unwrap();

        let text = registry.encode_text().unwrap();
        assert!(text.contains("gatherer_fetch_count"));
        assert!(text.contains("queue_output_count"));
    }
}
