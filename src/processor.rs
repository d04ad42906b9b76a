//! Per-partition sinks draining the gatherer's output handoffs

use crate::config::Config;
use crate::errors::Result;
use crate::event::SequenceEvent;
use crate::forwarder::Forwarder;
use crate::gatherer::Acker;
use crate::handoff::HandoffReceiver;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Consumes one partition's handoff and acknowledges what it delivered.
///
/// `process` runs until the token is cancelled or the handoff closes.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        output: HandoffReceiver,
        acker: Acker,
        token: CancellationToken,
    ) -> Result<()>;
}

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ForwardProcessorSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_backoff: Duration,
}

impl From<&Config> for ForwardProcessorSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval.max(MIN_FLUSH_INTERVAL),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Batches handoff output and hands each batch to a [`Forwarder`].
///
/// A batch is acknowledged through its last offset only after the forwarder
/// accepted it. A failed batch is retried as a whole until it goes through
/// or the token is cancelled, so nothing past undelivered data is acked.
pub struct ForwardProcessor {
    forwarder: Arc<dyn Forwarder>,
    settings: ForwardProcessorSettings,
}

impl ForwardProcessor {
    pub fn new(forwarder: Arc<dyn Forwarder>, settings: ForwardProcessorSettings) -> Self {
        Self {
            forwarder,
            settings,
        }
    }

    /// Returns false if cancelled before the batch was delivered.
    async fn deliver(
        &self,
        partition: usize,
        batch: &mut Vec<SequenceEvent>,
        acker: &Acker,
        token: &CancellationToken,
    ) -> bool {
        let Some(last) = batch.last().map(|seq| seq.offset) else {
            return true;
        };

        loop {
            match self.forwarder.forward(batch).await {
                Ok(()) => {
                    acker.ack(&last).await;
                    debug!(partition, events = batch.len(), ack = %last, "batch delivered");
                    batch.clear();
                    return true;
                }
                Err(e) => {
                    warn!(
                        partition,
                        events = batch.len(),
                        forwarder = self.forwarder.name(),
                        "forwarding failed, retrying batch: {}",
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return false,
                        _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Processor for ForwardProcessor {
    fn name(&self) -> &str {
        "forward-processor"
    }

    #[instrument(skip_all, fields(partition = output.partition()))]
    async fn process(
        &self,
        mut output: HandoffReceiver,
        acker: Acker,
        token: CancellationToken,
    ) -> Result<()> {
        let partition = output.partition();
        let batch_size = self.settings.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut flush = interval(self.settings.flush_interval.max(MIN_FLUSH_INTERVAL));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = output.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size
                            && !self.deliver(partition, &mut batch, &acker, &token).await
                        {
                            break;
                        }
                    }
                    None => {
                        info!("handoff closed, flushing remaining events");
                        self.deliver(partition, &mut batch, &acker, &token).await;
                        break;
                    }
                },
                _ = flush.tick() => {
                    if !self.deliver(partition, &mut batch, &acker, &token).await {
                        break;
                    }
                }
            }
        }

        if !batch.is_empty() {
            info!(
                pending = batch.len(),
                "stopping with undelivered events, they stay unacknowledged"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::event::{Event, EventType};
    use crate::handoff;
    use crate::queue::{MemoryQueue, PartitionPolicy, PartitionedQueue, QueueSettings};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingForwarder {
        batches: Mutex<Vec<Vec<u64>>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        fn name(&self) -> &str {
            "recording"
        }

        async fn forward(&self, events: &[SequenceEvent]) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PipelineError::Transport("unavailable".to_string()));
            }
            self.batches
                .lock()
                .unwrap()
                .push(events.iter().map(SequenceEvent::position).collect());
            Ok(())
        }
    }

    fn settings(batch_size: usize) -> ForwardProcessorSettings {
        ForwardProcessorSettings {
            batch_size,
            flush_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(5),
        }
    }

    async fn queue_with(events: usize) -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::new(
            QueueSettings::new(1, 16).with_policy(PartitionPolicy::RoundRobin),
        ));
        queue.initialize().await.unwrap();
        for _ in 0..events {
            queue.enqueue(Event::new(EventType::Log, b"{}".to_vec())).await.unwrap();
        }
        queue
    }

    async fn feed(queue: &Arc<MemoryQueue>, sender: &handoff::HandoffSender, count: usize) {
        for _ in 0..count {
            let event = queue.dequeue(0).await.unwrap();
            sender.send(event).await.unwrap();
        }
    }

    async fn wait_for_watermark(queue: &Arc<MemoryQueue>, watermark: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.cursors(0).await.unwrap().ack_watermark < watermark {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_full_batch_is_forwarded_and_acked() {
        let queue = queue_with(3).await;
        let forwarder = Arc::new(RecordingForwarder::default());
        let processor = ForwardProcessor::new(forwarder.clone(), settings(3));
        let (sender, receiver) = handoff::channel(0);
        let token = CancellationToken::new();

        let acker = Acker::new(queue.clone());
        let task = tokio::spawn({
            let token = token.clone();
            async move { processor.process(receiver, acker, token).await }
        });

        feed(&queue, &sender, 3).await;
        wait_for_watermark(&queue, 3).await;

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(forwarder.batches.lock().unwrap()[0], vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_interval() {
        let queue = queue_with(2).await;
        let forwarder = Arc::new(RecordingForwarder::default());
        let processor = ForwardProcessor::new(forwarder.clone(), settings(100));
        let (sender, receiver) = handoff::channel(0);
        let token = CancellationToken::new();

        let acker = Acker::new(queue.clone());
        let task = tokio::spawn({
            let token = token.clone();
            async move { processor.process(receiver, acker, token).await }
        });

        feed(&queue, &sender, 2).await;
        wait_for_watermark(&queue, 2).await;

        token.cancel();
        task.await.unwrap().unwrap();
        let delivered: Vec<u64> = forwarder.batches.lock().unwrap().concat();
        assert_eq!(delivered, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_before_ack() {
        let queue = queue_with(2).await;
        let forwarder = Arc::new(RecordingForwarder {
            failures_left: AtomicU32::new(2),
            ..Default::default()
        });
        let processor = ForwardProcessor::new(forwarder.clone(), settings(2));
        let (sender, receiver) = handoff::channel(0);
        let token = CancellationToken::new();

        let acker = Acker::new(queue.clone());
        let task = tokio::spawn({
            let token = token.clone();
            async move { processor.process(receiver, acker, token).await }
        });

        feed(&queue, &sender, 2).await;
        wait_for_watermark(&queue, 2).await;

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(forwarder.failures_left.load(Ordering::SeqCst), 0);
        assert_eq!(*forwarder.batches.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_zero_flush_interval_is_clamped() {
        let config = Config {
            flush_interval: Duration::ZERO,
            batch_size: 0,
            ..Config::default()
        };
        let settings = ForwardProcessorSettings::from(&config);
        assert_eq!(settings.flush_interval, MIN_FLUSH_INTERVAL);
        assert_eq!(settings.batch_size, 1);
    }

    #[tokio::test]
    async fn test_zero_flush_interval_still_flushes() {
        let queue = queue_with(1).await;
        let forwarder = Arc::new(RecordingForwarder::default());
        let processor = ForwardProcessor::new(
            forwarder.clone(),
            ForwardProcessorSettings {
                batch_size: 100,
                flush_interval: Duration::ZERO,
                retry_backoff: Duration::from_millis(5),
            },
        );
        let (sender, receiver) = handoff::channel(0);
        let token = CancellationToken::new();

        let acker = Acker::new(queue.clone());
        let task = tokio::spawn({
            let token = token.clone();
            async move { processor.process(receiver, acker, token).await }
        });

        feed(&queue, &sender, 1).await;
        wait_for_watermark(&queue, 1).await;

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*forwarder.batches.lock().unwrap(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_leaves_batch_unacked() {
        let queue = queue_with(1).await;
        let forwarder = Arc::new(RecordingForwarder {
            failures_left: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let processor = ForwardProcessor::new(forwarder, settings(1));
        let (sender, receiver) = handoff::channel(0);
        let token = CancellationToken::new();

        let acker = Acker::new(queue.clone());
        let task = tokio::spawn({
            let token = token.clone();
            async move { processor.process(receiver, acker, token).await }
        });

        feed(&queue, &sender, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(queue.cursors(0).await.unwrap().ack_watermark, 0);
    }
}
