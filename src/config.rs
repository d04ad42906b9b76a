//! Configuration management for the sidecar pipeline

use crate::queue::PartitionPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Storage backing the partitioned queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Memory,
    File,
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(QueueKind::Memory),
            "file" | "disk" => Ok(QueueKind::File),
            other => Err(format!("unknown queue kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pipe name used to label logs and metrics
    pub pipe_name: String,

    /// Name of the service being monitored
    pub service_name: String,

    /// Kubernetes pod name
    pub pod_name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// URL of the telemetry gateway
    pub gateway_url: String,

    /// Path to application log files
    pub log_paths: Vec<String>,

    /// How often tailed log files are checked for new lines
    pub file_poll_interval: Duration,

    /// Number of queue partitions, one consumer task each
    pub partition_count: usize,

    /// Undequeued events a partition holds before enqueue is rejected
    pub partition_capacity: usize,

    /// Queue storage
    pub queue_kind: QueueKind,

    /// Directory for the file queue
    pub queue_dir: PathBuf,

    /// Advancing acks between watermark checkpoints (file queue)
    pub checkpoint_every: usize,

    /// How events are assigned to partitions
    pub partition_policy: PartitionPolicy,

    /// Sleep between dequeue attempts on an empty partition
    pub empty_poll_interval: Duration,

    /// Best-effort drain window before the queue is closed
    pub shutdown_grace: Duration,

    /// Batch size for forwarded telemetry
    pub batch_size: usize,

    /// Flush interval for partially filled batches
    pub flush_interval: Duration,

    /// Maximum retry attempts for failed transmissions
    pub max_retries: u32,

    /// Retry backoff base
    pub retry_backoff_ms: u64,

    /// HTTP timeout for gateway requests
    pub http_timeout: Duration,

    /// Interval of the periodic metrics summary log
    pub metrics_interval: Duration,

    /// Listen address of the prometheus scrape endpoint; `None` disables it
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipe_name: "default-pipe".to_string(),
            service_name: "unknown-service".to_string(),
            pod_name: "unknown-pod".to_string(),
            namespace: "default".to_string(),
            gateway_url: "http://telemetry-gateway:9090".to_string(),
            log_paths: vec!["/var/log/app/application.log".to_string()],
            file_poll_interval: Duration::from_millis(500),
            partition_count: 4,
            partition_capacity: 10000,
            queue_kind: QueueKind::File,
            queue_dir: PathBuf::from("/var/lib/sidecar/queue"),
            checkpoint_every: 64,
            partition_policy: PartitionPolicy::KeyHash,
            empty_poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff_ms: 1000,
            http_timeout: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            metrics_addr: Some(SocketAddr::from(([0, 0, 0, 0], 1234))),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source; unset or unparsable
    /// values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(pipe_name) = lookup("PIPE_NAME") {
            config.pipe_name = pipe_name;
        }

        if let Some(service_name) = lookup("SERVICE_NAME") {
            config.service_name = service_name;
        }

        if let Some(pod_name) = lookup("POD_NAME") {
            config.pod_name = pod_name;
        }

        if let Some(namespace) = lookup("NAMESPACE") {
            config.namespace = namespace;
        }

        if let Some(gateway_url) = lookup("GATEWAY_URL") {
            config.gateway_url = gateway_url;
        }

        if let Some(log_paths) = lookup("LOG_PATHS") {
            config.log_paths = log_paths
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(ms) = parse(&lookup, "FILE_POLL_INTERVAL_MS") {
            config.file_poll_interval = Duration::from_millis(ms);
        }

        if let Some(count) = parse(&lookup, "PARTITION_COUNT") {
            config.partition_count = count;
        }

        if let Some(capacity) = parse(&lookup, "PARTITION_CAPACITY") {
            config.partition_capacity = capacity;
        }

        if let Some(kind) = parse(&lookup, "QUEUE_KIND") {
            config.queue_kind = kind;
        }

        if let Some(queue_dir) = lookup("QUEUE_DIR") {
            config.queue_dir = PathBuf::from(queue_dir);
        }

        if let Some(acks) = parse(&lookup, "CHECKPOINT_EVERY") {
            config.checkpoint_every = acks;
        }

        if let Some(policy) = parse(&lookup, "PARTITION_POLICY") {
            config.partition_policy = policy;
        }

        if let Some(ms) = parse(&lookup, "EMPTY_POLL_INTERVAL_MS") {
            config.empty_poll_interval = Duration::from_millis(ms);
        }

        if let Some(seconds) = parse(&lookup, "SHUTDOWN_GRACE_SECONDS") {
            config.shutdown_grace = Duration::from_secs(seconds);
        }

        if let Some(size) = parse(&lookup, "BATCH_SIZE") {
            config.batch_size = size;
        }

        if let Some(seconds) = parse(&lookup, "FLUSH_INTERVAL_SECONDS") {
            config.flush_interval = Duration::from_secs(seconds);
        }

        if let Some(retries) = parse(&lookup, "MAX_RETRIES") {
            config.max_retries = retries;
        }

        if let Some(ms) = parse(&lookup, "RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = ms;
        }

        if let Some(seconds) = parse(&lookup, "HTTP_TIMEOUT_SECONDS") {
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse(&lookup, "METRICS_INTERVAL_SECONDS") {
            config.metrics_interval = Duration::from_secs(seconds);
        }

        if let Some(addr) = lookup("METRICS_ADDR") {
            let addr = addr.trim();
            if addr.is_empty() || addr.eq_ignore_ascii_case("off") {
                config.metrics_addr = None;
            } else if let Ok(addr) = addr.parse() {
                config.metrics_addr = Some(addr);
            }
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pipe_name.is_empty() {
            return Err("pipe_name cannot be empty".to_string());
        }

        if self.service_name.is_empty() {
            return Err("service_name cannot be empty".to_string());
        }

        if self.gateway_url.is_empty() {
            return Err("gateway_url cannot be empty".to_string());
        }

        if self.log_paths.is_empty() {
            return Err("at least one log path must be specified".to_string());
        }

        if self.partition_count == 0 {
            return Err("partition_count must be greater than 0".to_string());
        }

        if self.partition_capacity == 0 {
            return Err("partition_capacity must be greater than 0".to_string());
        }

        if self.queue_kind == QueueKind::File && self.queue_dir.as_os_str().is_empty() {
            return Err("queue_dir is required for the file queue".to_string());
        }

        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        let intervals = [
            ("empty_poll_interval", self.empty_poll_interval),
            ("file_poll_interval", self.file_poll_interval),
            ("flush_interval", self.flush_interval),
            ("metrics_interval", self.metrics_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|value| value.trim().parse().ok())
}
