//! Forwarders deliver batches of queued events to the telemetry gateway

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::event::{EventType, SequenceEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delivers a batch downstream. A returned `Ok` means every event in the
/// batch was accepted and may be acknowledged.
#[async_trait]
pub trait Forwarder: Send + Sync {
    fn name(&self) -> &str;

    /// The only event type this forwarder accepts, or `None` for all of them.
    fn forward_type(&self) -> Option<EventType> {
        None
    }

    async fn forward(&self, events: &[SequenceEvent]) -> Result<()>;
}

/// Wire body posted to the gateway
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardBatch {
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub pipe: String,
    pub items: Vec<ForwardItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ForwardItem {
    pub partition: usize,
    pub position: u64,
    pub event_type: EventType,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The event payload as JSON when it parses, otherwise as a lossy string
    pub payload: Value,
}

impl ForwardBatch {
    /// Build a batch from `events`, keeping only `forward_type` when given.
    pub fn new(pipe: &str, events: &[SequenceEvent], forward_type: Option<EventType>) -> Self {
        let items = events
            .iter()
            .filter(|seq| forward_type.is_none_or(|wanted| seq.event.event_type == wanted))
            .map(ForwardItem::from)
            .collect();

        Self {
            batch_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            pipe: pipe.to_string(),
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<&SequenceEvent> for ForwardItem {
    fn from(seq: &SequenceEvent) -> Self {
        let payload = serde_json::from_slice(&seq.event.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&seq.event.payload).into_owned())
        });

        Self {
            partition: seq.partition(),
            position: seq.position(),
            event_type: seq.event.event_type,
            timestamp: seq.event.timestamp,
            key: seq.event.key.clone(),
            payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpForwarderSettings {
    pub pipe_name: String,
    pub gateway_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub forward_type: Option<EventType>,
}

impl From<&Config> for HttpForwarderSettings {
    fn from(config: &Config) -> Self {
        Self {
            pipe_name: config.pipe_name.clone(),
            gateway_url: config.gateway_url.clone(),
            timeout: config.http_timeout,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            forward_type: None,
        }
    }
}

/// Posts JSON batches to `{gateway}/v1/telemetry`
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    settings: HttpForwarderSettings,
}

impl HttpForwarder {
    pub fn new(settings: HttpForwarderSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("telemetry_sidecar/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PipelineError::Http)?;

        Ok(Self { client, settings })
    }

    fn url(&self) -> String {
        format!("{}/v1/telemetry", self.settings.gateway_url.trim_end_matches('/'))
    }

    /// Backoff before retry `attempt` (1-based): exponential with up to 10% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .settings
            .retry_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if base >= 10 {
            rand::rng().random_range(0..=base / 10)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn send_batch(&self, batch: &ForwardBatch) -> Result<()> {
        let url = self.url();
        debug!(
            batch_id = %batch.batch_id,
            items = batch.items.len(),
            "Sending batch to {}",
            url
        );

        let mut attempt = 0;
        loop {
            let error = match self.send_attempt(&url, batch).await {
                Ok(()) => {
                    info!(
                        batch_id = %batch.batch_id,
                        attempt = attempt + 1,
                        "Successfully forwarded batch"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.settings.max_retries {
                error!(
                    batch_id = %batch.batch_id,
                    attempts = attempt,
                    "Failed to forward batch: {}",
                    error
                );
                return Err(error);
            }

            let backoff = self.backoff(attempt);
            warn!(
                batch_id = %batch.batch_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Failed to forward batch, retrying: {}",
                error
            );
            sleep(backoff).await;
        }
    }

    async fn send_attempt(&self, url: &str, batch: &ForwardBatch) -> Result<()> {
        let response = timeout(self.settings.timeout, self.client.post(url).json(batch).send())
            .await
            .map_err(|_| PipelineError::Transport("Request timeout".to_string()))?
            .map_err(PipelineError::Http)?;

        handle_response(response, &batch.batch_id).await
    }
}

async fn handle_response(response: Response, batch_id: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        debug!(batch_id, "Batch accepted by gateway");
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    let message = match status.as_u16() {
        400 => format!("Bad request for batch {}: {}", batch_id, body),
        401 => format!("Unauthorized for batch {}: {}", batch_id, body),
        403 => format!("Forbidden for batch {}: {}", batch_id, body),
        404 => format!("Gateway endpoint not found for batch {}: {}", batch_id, body),
        413 => format!("Batch {} too large: {}", batch_id, body),
        429 => format!("Rate limited for batch {}: {}", batch_id, body),
        500..=599 => format!("Gateway server error for batch {}: {}", batch_id, body),
        _ => format!("Unexpected response {} for batch {}: {}", status, batch_id, body),
    };

    Err(PipelineError::Transport(message))
}

#[async_trait]
impl Forwarder for HttpForwarder {
    fn name(&self) -> &str {
        "http-forwarder"
    }

    fn forward_type(&self) -> Option<EventType> {
        self.settings.forward_type
    }

    async fn forward(&self, events: &[SequenceEvent]) -> Result<()> {
        let batch = ForwardBatch::new(&self.settings.pipe_name, events, self.forward_type());
        if batch.is_empty() {
            debug!("No events of the forwarded type in batch, skipping");
            return Ok(());
        }
        self.send_batch(&batch).await
    }
}
