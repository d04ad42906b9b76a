//! Partitioned, ack-tracked event queues
//!
//! Every partition keeps three cursors: the next position to assign, the
//! next position to serve and the highest acknowledged position. Serving
//! runs ahead of acknowledgement, so consumers can pipeline deliveries while
//! the watermark alone decides what is safe to discard.
//!
//! Two implementations are provided:
//!
//! - [`MemoryQueue`]: partitions live in memory; anything unacknowledged is
//!   lost on close.
//! - [`FileQueue`]: partitions are backed by append-only segments on disk;
//!   anything above the watermark is redelivered after a restart.

pub mod file;
pub mod memory;
pub mod partition;
pub mod router;

pub use file::FileQueue;
pub use memory::MemoryQueue;
pub use partition::{AckOutcome, PartitionCursors};
pub use router::{PartitionPolicy, Router};

use crate::config::{Config, QueueKind};
use crate::errors::{PipelineError, Result};
use crate::event::{Event, Offset, SequenceEvent};
use async_trait::async_trait;
use std::sync::Arc;

/// A durable-or-not, partitioned buffer with per-partition ack watermarks.
///
/// `enqueue` is called by a single producer and `dequeue(p)` by a single
/// consumer per partition. `ack` may arrive from anywhere at any time.
#[async_trait]
pub trait PartitionedQueue: Send + Sync {
    /// Implementation identifier for logs and metrics.
    fn name(&self) -> &str;

    /// Acquire storage. Must succeed exactly once before any other call.
    async fn initialize(&self) -> Result<()>;

    fn total_partition_count(&self) -> usize;

    /// Route and store an event, returning the offset it was assigned.
    async fn enqueue(&self, event: Event) -> Result<Offset>;

    /// Next unread event of `partition`, or `PipelineError::Empty`.
    async fn dequeue(&self, partition: usize) -> Result<SequenceEvent>;

    /// Advance the partition watermark; stale acks are ignored.
    async fn ack(&self, offset: &Offset);

    /// Flush and release storage. Every later call fails with `Closed`.
    async fn close(&self) -> Result<()>;

    async fn cursors(&self, partition: usize) -> Result<PartitionCursors>;
}

/// Sizing and routing shared by the queue implementations.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub partition_count: usize,
    pub partition_capacity: usize,
    pub policy: PartitionPolicy,
}

impl QueueSettings {
    pub fn new(partition_count: usize, partition_capacity: usize) -> Self {
        Self {
            partition_count,
            partition_capacity,
            policy: PartitionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PartitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(PipelineError::Config(
                "partition_count must be greater than 0".to_string(),
            ));
        }
        if self.partition_capacity == 0 {
            return Err(PipelineError::Config(
                "partition_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&Config> for QueueSettings {
    fn from(config: &Config) -> Self {
        QueueSettings::new(config.partition_count, config.partition_capacity)
            .with_policy(config.partition_policy)
    }
}

/// Build the queue selected by the configuration.
pub fn build_queue(config: &Config) -> Result<Arc<dyn PartitionedQueue>> {
    let settings = QueueSettings::from(config);
    settings.validate()?;

    let queue: Arc<dyn PartitionedQueue> = match config.queue_kind {
        QueueKind::Memory => Arc::new(MemoryQueue::new(settings)),
        QueueKind::File => Arc::new(
            FileQueue::new(config.queue_dir.clone(), settings)
                .with_checkpoint_every(config.checkpoint_every),
        ),
    };
    Ok(queue)
}

pub(crate) fn check_partition(partition: usize, count: usize) -> Result<()> {
    if partition >= count {
        return Err(PipelineError::PartitionOutOfRange { partition, count });
    }
    Ok(())
}
