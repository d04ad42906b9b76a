//! Fetcher-driven gatherer
//!
//! The gatherer wires a [`Fetcher`] into a [`PartitionedQueue`] and the
//! queue back out to one [`HandoffReceiver`] per partition:
//!
//! ```text
//! fetcher ──▶ producer task ──enqueue──▶ queue ──dequeue(p)──▶ consumer task p ──▶ handoff p
//! ```
//!
//! `boot` runs one producer and one consumer per partition until the
//! cancellation token fires, then closes the queue after a grace period.
//! Enqueue and dequeue failures never stop a task; they are counted and logged.

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::event::{Event, Offset};
use crate::fetcher::Fetcher;
use crate::handoff::{self, HandoffReceiver, HandoffSender};
use crate::metrics::{
    PipelineMetrics, STATUS_ABANDONED, STATUS_ALL, STATUS_ERROR, STATUS_SUCCESS,
};
use crate::queue::PartitionedQueue;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GathererState {
    Created,
    Prepared,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for GathererState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GathererState::Created => "created",
            GathererState::Prepared => "prepared",
            GathererState::Running => "running",
            GathererState::ShuttingDown => "shutting-down",
            GathererState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct GathererConfig {
    pub pipe_name: String,
    /// Sleep after an empty dequeue
    pub empty_poll_interval: Duration,
    /// Best-effort drain window before the queue is closed; not a delivery guarantee
    pub shutdown_grace: Duration,
}

impl Default for GathererConfig {
    fn default() -> Self {
        Self {
            pipe_name: "default-pipe".to_string(),
            empty_poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for GathererConfig {
    fn from(config: &Config) -> Self {
        Self {
            pipe_name: config.pipe_name.clone(),
            empty_poll_interval: config.empty_poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// The sink's only way to move queue state: advancing partition watermarks.
#[derive(Clone)]
pub struct Acker {
    queue: Arc<dyn PartitionedQueue>,
}

impl Acker {
    pub fn new(queue: Arc<dyn PartitionedQueue>) -> Self {
        Self { queue }
    }

    pub async fn ack(&self, offset: &Offset) {
        self.queue.ack(offset).await;
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("queue", &self.queue.name())
            .finish()
    }
}

pub struct Gatherer {
    inner: Arc<Inner>,
}

struct Inner {
    config: GathererConfig,
    fetcher: Box<dyn Fetcher>,
    queue: Arc<dyn PartitionedQueue>,
    metrics: PipelineMetrics,
    state: watch::Sender<GathererState>,
    outputs: OnceLock<Vec<HandoffSender>>,
    receivers: Mutex<Vec<Option<HandoffReceiver>>>,
    shutdown: OnceCell<()>,
}

impl Gatherer {
    pub fn new(
        config: GathererConfig,
        fetcher: Box<dyn Fetcher>,
        queue: Arc<dyn PartitionedQueue>,
        metrics: PipelineMetrics,
    ) -> Self {
        let (state, _) = watch::channel(GathererState::Created);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                queue,
                metrics,
                state,
                outputs: OnceLock::new(),
                receivers: Mutex::new(Vec::new()),
                shutdown: OnceCell::new(),
            }),
        }
    }

    pub fn state(&self) -> GathererState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GathererState> {
        self.inner.state.subscribe()
    }

    pub fn pipe_name(&self) -> &str {
        &self.inner.config.pipe_name
    }

    /// Initialize the queue and allocate one output handoff per partition.
    pub async fn prepare(&self) -> Result<()> {
        let inner = &self.inner;
        let pipe = inner.config.pipe_name.as_str();
        inner.expect_state(GathererState::Created, "prepare")?;

        info!(pipe, "fetcher gatherer module is preparing...");
        if let Err(e) = inner.queue.initialize().await {
            error!(
                pipe,
                queue = inner.queue.name(),
                "the queue failed when initializing: {}",
                e
            );
            return Err(e);
        }

        let count = inner.queue.total_partition_count();
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..count).map(handoff::channel).unzip();
        inner
            .outputs
            .set(senders)
            .map_err(|_| PipelineError::Config("gatherer prepared twice".to_string()))?;
        *inner.lock_receivers() = receivers.into_iter().map(Some).collect();

        inner.state.send_replace(GathererState::Prepared);
        Ok(())
    }

    /// Number of partitions, and so of output handoffs. Zero before `prepare`.
    pub fn partition_count(&self) -> usize {
        self.inner.outputs.get().map_or(0, Vec::len)
    }

    /// Claim the output handoff of partition `index`. Each can be taken once.
    pub fn take_output(&self, index: usize) -> Option<HandoffReceiver> {
        self.inner
            .lock_receivers()
            .get_mut(index)
            .and_then(Option::take)
    }

    pub fn acker(&self) -> Acker {
        Acker {
            queue: Arc::clone(&self.inner.queue),
        }
    }

    pub async fn ack(&self, offset: &Offset) {
        self.inner.queue.ack(offset).await;
    }

    /// Run the producer and every partition consumer until `token` is
    /// cancelled and all of them have exited.
    ///
    /// Every output handoff must have been claimed; an unclaimed partition
    /// would stall forever.
    pub async fn boot(&self, token: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let pipe = inner.config.pipe_name.as_str();
        inner.expect_state(GathererState::Prepared, "boot")?;

        let unclaimed: Vec<usize> = inner
            .lock_receivers()
            .iter()
            .enumerate()
            .filter_map(|(index, receiver)| receiver.as_ref().map(|_| index))
            .collect();
        if !unclaimed.is_empty() {
            return Err(PipelineError::Config(format!(
                "no processor attached to partitions {:?}",
                unclaimed
            )));
        }

        inner.state.send_replace(GathererState::Running);
        info!(
            pipe,
            partitions = self.partition_count(),
            fetcher = inner.fetcher.name(),
            queue = inner.queue.name(),
            "fetch_gatherer module is starting..."
        );

        let token = token.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(inner).produce(token.clone()));
        for partition in 0..self.partition_count() {
            tasks.spawn(Arc::clone(inner).consume(partition, token.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(pipe, "gatherer task failed: {}", e);
            }
        }

        inner.shutdown().await;
        inner.state.send_replace(GathererState::Stopped);
        info!(pipe, "fetcher gatherer module stopped");
        Ok(())
    }

    /// Wait out the grace period, then close the queue. Runs once; later
    /// callers wait for the first to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl fmt::Debug for Gatherer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatherer")
            .field("pipe", &self.inner.config.pipe_name)
            .field("state", &self.state())
            .field("partitions", &self.partition_count())
            .finish()
    }
}

impl Inner {
    fn expect_state(&self, expected: GathererState, operation: &str) -> Result<()> {
        let current = *self.state.borrow();
        if current != expected {
            return Err(PipelineError::Config(format!(
                "cannot {} gatherer in state {}",
                operation, current
            )));
        }
        Ok(())
    }

    fn lock_receivers(&self) -> std::sync::MutexGuard<'_, Vec<Option<HandoffReceiver>>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn produce(self: Arc<Self>, token: CancellationToken) {
        let pipe = self.config.pipe_name.as_str();

        let Some(mut events) = self.fetcher.fetch(token.clone()) else {
            error!(
                pipe,
                fetcher = self.fetcher.name(),
                "fetcher was already started elsewhere, nothing to gather"
            );
            token.cancelled().await;
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = events.recv() => match received {
                    Some(event) => self.enqueue(event).await,
                    None => {
                        info!(pipe, fetcher = self.fetcher.name(), "fetcher stream ended");
                        token.cancelled().await;
                        break;
                    }
                },
            }
        }

        debug!(pipe, "producer task stopped");
    }

    async fn enqueue(&self, event: Event) {
        let pipe = self.config.pipe_name.as_str();
        let result = self.queue.enqueue(event).await;
        self.metrics.inc_fetch(pipe, STATUS_ALL);

        match result {
            Ok(_) => {}
            Err(e @ PipelineError::QueueFull { .. }) => {
                self.metrics.inc_fetch(pipe, STATUS_ABANDONED);
                warn!(pipe, "cannot put event into queue, dropping it: {}", e);
            }
            Err(e) => {
                self.metrics.inc_fetch(pipe, STATUS_ABANDONED);
                error!(pipe, "cannot put event into queue: {}", e);
            }
        }
    }

    async fn consume(self: Arc<Self>, partition: usize, token: CancellationToken) {
        let pipe = self.config.pipe_name.as_str();
        let Some(output) = self.outputs.get().and_then(|outputs| outputs.get(partition)) else {
            error!(pipe, partition, "no output handoff for partition");
            return;
        };

        while !token.is_cancelled() {
            match self.queue.dequeue(partition).await {
                Ok(event) => {
                    let position = event.position();
                    tokio::select! {
                        biased;
                        sent = output.send(event) => match sent {
                            Ok(()) => self.metrics.inc_queue_output(pipe, STATUS_SUCCESS),
                            Err(e) => {
                                self.metrics.inc_queue_output(pipe, STATUS_ERROR);
                                error!(pipe, partition, position, "{}, waiting for shutdown", e);
                                token.cancelled().await;
                                break;
                            }
                        },
                        _ = token.cancelled() => {
                            debug!(pipe, partition, position, "cancelled during handoff, event stays unacknowledged");
                            break;
                        }
                    }
                }
                Err(PipelineError::Empty) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.empty_poll_interval) => {}
                    }
                }
                Err(PipelineError::Closed) => {
                    warn!(pipe, partition, "queue closed, consumer exiting");
                    break;
                }
                Err(e) => {
                    self.metrics.inc_queue_output(pipe, STATUS_ERROR);
                    error!(pipe, partition, "error in popping from the queue: {}", e);
                    tokio::task::yield_now().await;
                }
            }
        }

        self.shutdown().await;
        debug!(pipe, partition, "consumer task stopped");
    }

    async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                let pipe = self.config.pipe_name.as_str();
                self.state.send_replace(GathererState::ShuttingDown);
                info!(pipe, "fetcher gatherer module is closing");

                tokio::time::sleep(self.config.shutdown_grace).await;
                if let Err(e) = self.queue.close().await {
                    error!(
                        pipe,
                        queue = self.queue.name(),
                        "failure occurs when closing queue: {}",
                        e
                    );
                }
            })
            .await;
    }
}
