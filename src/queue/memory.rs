//! In-memory partitioned queue

use super::partition::{AckOutcome, Partition, PartitionCursors};
use super::{PartitionedQueue, QueueSettings, Router, check_partition};
use crate::errors::{PipelineError, Result};
use crate::event::{Event, Offset, SequenceEvent};
use async_trait::async_trait;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const NAME: &str = "memory-queue";

/// Queue whose partitions live only in process memory.
///
/// Unacknowledged events do not survive `close`.
#[derive(Debug)]
pub struct MemoryQueue {
    settings: QueueSettings,
    router: Router,
    partitions: OnceLock<Vec<Mutex<Partition>>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            router: Router::new(settings.policy, settings.partition_count),
            settings,
            partitions: OnceLock::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn partitions(&self) -> Result<&[Mutex<Partition>]> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        self.partitions
            .get()
            .map(Vec::as_slice)
            .ok_or(PipelineError::NotInitialized)
    }

    fn partition(&self, index: usize) -> Result<&Mutex<Partition>> {
        let partitions = self.partitions()?;
        check_partition(index, partitions.len())?;
        Ok(&partitions[index])
    }
}

#[async_trait]
impl PartitionedQueue for MemoryQueue {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::QueueInit(format!(
                "{} can only be initialized once",
                NAME
            )));
        }
        self.settings.validate()?;

        let partitions = (0..self.settings.partition_count)
            .map(|p| Mutex::new(Partition::new(p, self.settings.partition_capacity)))
            .collect();
        self.partitions
            .set(partitions)
            .map_err(|_| PipelineError::QueueInit("partitions already allocated".to_string()))?;

        info!(
            queue = NAME,
            partitions = self.settings.partition_count,
            capacity = self.settings.partition_capacity,
            policy = %self.router.policy(),
            "Queue initialized"
        );
        Ok(())
    }

    fn total_partition_count(&self) -> usize {
        self.settings.partition_count
    }

    async fn enqueue(&self, event: Event) -> Result<Offset> {
        let index = self.router.route(&event);
        let mut partition = self.partition(index)?.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        partition.push(event)
    }

    async fn dequeue(&self, partition: usize) -> Result<SequenceEvent> {
        let mut state = self.partition(partition)?.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        state.pop()
    }

    async fn ack(&self, offset: &Offset) {
        let slot = match self.partition(offset.partition) {
            Ok(slot) => slot,
            Err(e) => {
                debug!(queue = NAME, offset = %offset, "Ignoring ack: {}", e);
                return;
            }
        };

        if let AckOutcome::Clamped(watermark) = slot.lock().await.ack(offset.position) {
            warn!(
                queue = NAME,
                offset = %offset,
                watermark,
                "Ack beyond served position, clamped"
            );
        }
    }

    async fn close(&self) -> Result<()> {
        let partitions = self
            .partitions
            .get()
            .ok_or(PipelineError::NotInitialized)?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::Closed);
        }

        let mut dropped = 0;
        for slot in partitions {
            // Wait out any operation already holding the partition.
            let state = slot.lock().await;
            let cursors = state.cursors();
            dropped += cursors.write_cursor - 1 - cursors.ack_watermark;
        }

        if dropped > 0 {
            warn!(
                queue = NAME,
                unacknowledged = dropped,
                "Closing in-memory queue with unacknowledged events"
            );
        }
        info!(queue = NAME, "Queue closed");
        Ok(())
    }

    async fn cursors(&self, partition: usize) -> Result<PartitionCursors> {
        Ok(self.partition(partition)?.lock().await.cursors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::queue::PartitionPolicy;

    fn keyed(key: &str, tag: &str) -> Event {
        Event::new(EventType::Log, tag.as_bytes().to_vec()).with_key(key)
    }

    async fn ready(partitions: usize, capacity: usize) -> MemoryQueue {
        let queue = MemoryQueue::new(
            QueueSettings::new(partitions, capacity).with_policy(PartitionPolicy::RoundRobin),
        );
        queue.initialize().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail() {
        let queue = MemoryQueue::new(QueueSettings::new(2, 4));
        let err = queue.dequeue(0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let queue = ready(1, 4).await;
        assert!(matches!(
            queue.initialize().await,
            Err(PipelineError::QueueInit(_))
        ));
    }

    #[tokio::test]
    async fn test_round_robin_spreads_events() {
        let queue = ready(2, 4).await;
        let a = queue.enqueue(keyed("k", "a")).await.unwrap();
        let b = queue.enqueue(keyed("k", "b")).await.unwrap();
        let c = queue.enqueue(keyed("k", "c")).await.unwrap();

        assert_eq!((a.partition, a.position), (0, 1));
        assert_eq!((b.partition, b.position), (1, 1));
        assert_eq!((c.partition, c.position), (0, 2));

        assert_eq!(queue.dequeue(0).await.unwrap().event.payload, b"a");
        assert_eq!(queue.dequeue(0).await.unwrap().event.payload, b"c");
        assert_eq!(queue.dequeue(1).await.unwrap().event.payload, b"b");
        assert!(queue.dequeue(1).await.unwrap_err().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_partition() {
        let queue = ready(2, 4).await;
        let err = queue.dequeue(2).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PartitionOutOfRange { partition: 2, count: 2 }
        ));
    }

    #[tokio::test]
    async fn test_ack_tracks_watermark() {
        let queue = ready(1, 8).await;
        for tag in ["a", "b", "c"] {
            queue.enqueue(keyed("k", tag)).await.unwrap();
        }
        for _ in 0..3 {
            queue.dequeue(0).await.unwrap();
        }

        queue.ack(&Offset::new(0, 2)).await;
        queue.ack(&Offset::new(0, 1)).await;
        assert_eq!(queue.cursors(0).await.unwrap().ack_watermark, 2);

        queue.ack(&Offset::new(5, 1)).await;
    }

    #[tokio::test]
    async fn test_everything_fails_after_close() {
        let queue = ready(1, 8).await;
        queue.enqueue(keyed("k", "a")).await.unwrap();
        queue.close().await.unwrap();

        assert!(queue.enqueue(keyed("k", "b")).await.unwrap_err().is_closed());
        assert!(queue.dequeue(0).await.unwrap_err().is_closed());
        assert!(queue.close().await.unwrap_err().is_closed());
        queue.ack(&Offset::new(0, 1)).await;
    }
}
