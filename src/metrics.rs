//! Prometheus counters for the ingestion pipeline
//!
//! A [`MetricsRegistry`] is created once at startup and handed to every
//! component that records metrics. Nothing here registers against the
//! process-global default registry.
//!
//! | Metric | Labels | Values |
//! |--------|--------|--------|
//! | `gatherer_fetch_count` | `pipe`, `status` | `all`, `abandoned` |
//! | `queue_output_count` | `pipe`, `status` | `success`, `error` |

use crate::errors::{PipelineError, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub const STATUS_ALL: &str = "all";
pub const STATUS_ABANDONED: &str = "abandoned";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Owner of the prometheus registry for one sidecar process.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// Register the pipeline counters. Fails if called twice on the same registry.
    pub fn pipeline_metrics(&self) -> Result<PipelineMetrics> {
        PipelineMetrics::new(&self.registry)
    }

    /// Render every registered metric in the prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PipelineError::Metrics(e.to_string()))
    }
}

/// Counters recording fetch and queue output outcomes, keyed by pipe name.
#[derive(Clone)]
pub struct PipelineMetrics {
    fetch_count: IntCounterVec,
    queue_output_count: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let fetch_count = IntCounterVec::new(
            Opts::new(
                "gatherer_fetch_count",
                "Total number of the receiving count in the Gatherer.",
            ),
            &["pipe", "status"],
        )?;
        registry.register(Box::new(fetch_count.clone()))?;

        let queue_output_count = IntCounterVec::new(
            Opts::new(
                "queue_output_count",
                "Total number of the output count in the Queue of Gatherer.",
            ),
            &["pipe", "status"],
        )?;
        registry.register(Box::new(queue_output_count.clone()))?;

        Ok(Self {
            fetch_count,
            queue_output_count,
        })
    }

    pub fn inc_fetch(&self, pipe: &str, status: &str) {
        self.fetch_count.with_label_values(&[pipe, status]).inc();
    }

    pub fn inc_queue_output(&self, pipe: &str, status: &str) {
        self.queue_output_count.with_label_values(&[pipe, status]).inc();
    }

    pub fn fetch_count(&self, pipe: &str, status: &str) -> u64 {
        self.fetch_count.with_label_values(&[pipe, status]).get()
    }

    pub fn queue_output_count(&self, pipe: &str, status: &str) -> u64 {
        self.queue_output_count.with_label_values(&[pipe, status]).get()
    }

    /// One-line summary used by the periodic metrics report.
    pub fn summary(&self, pipe: &str) -> MetricsSnapshot {
        MetricsSnapshot {
            fetched: self.fetch_count(pipe, STATUS_ALL),
            abandoned: self.fetch_count(pipe, STATUS_ABANDONED),
            delivered: self.queue_output_count(pipe, STATUS_SUCCESS),
            errors: self.queue_output_count(pipe, STATUS_ERROR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub fetched: u64,
    pub abandoned: u64,
    pub delivered: u64,
    pub errors: u64,
}
