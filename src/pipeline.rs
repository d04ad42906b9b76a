//! A pipe: one gatherer feeding one processor per partition

use crate::errors::{PipelineError, Result};
use crate::gatherer::Gatherer;
use crate::handoff::HandoffReceiver;
use crate::processor::Processor;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Pipeline {
    gatherer: Arc<Gatherer>,
    processor: Arc<dyn Processor>,
    outputs: Vec<HandoffReceiver>,
}

impl Pipeline {
    pub fn new(gatherer: Gatherer, processor: Arc<dyn Processor>) -> Self {
        Self {
            gatherer: Arc::new(gatherer),
            processor,
            outputs: Vec::new(),
        }
    }

    pub fn gatherer(&self) -> &Gatherer {
        &self.gatherer
    }

    /// Prepare the gatherer and claim every partition's output for the processor.
    pub async fn prepare(&mut self) -> Result<()> {
        self.gatherer.prepare().await?;
        self.outputs = (0..self.gatherer.partition_count())
            .map(|partition| {
                self.gatherer.take_output(partition).ok_or_else(|| {
                    PipelineError::Config(format!(
                        "output of partition {} already claimed",
                        partition
                    ))
                })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Run until `token` is cancelled: one processor task per partition plus
    /// the gatherer. Returns once every task has stopped.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let pipe = self.gatherer.pipe_name().to_string();
        info!(
            pipe = %pipe,
            processor = self.processor.name(),
            partitions = self.outputs.len(),
            "pipe is starting"
        );

        let mut processors = JoinSet::new();
        for output in self.outputs {
            let processor = Arc::clone(&self.processor);
            let acker = self.gatherer.acker();
            let token = token.clone();
            processors.spawn(async move {
                let partition = output.partition();
                (partition, processor.process(output, acker, token).await)
            });
        }

        let booted = self.gatherer.boot(token.clone()).await;
        if booted.is_err() {
            token.cancel();
        }

        while let Some(joined) = processors.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((partition, Err(e))) => {
                    error!(pipe = %pipe, partition, "processor stopped with error: {}", e)
                }
                Err(e) => error!(pipe = %pipe, "processor task failed: {}", e),
            }
        }

        info!(pipe = %pipe, "pipe stopped");
        booted
    }
}
