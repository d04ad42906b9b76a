//! Synchronous single-item handoff between a partition consumer and the sink
//!
//! `send` does not return until the receiving side has taken the event, so a
//! slow sink stalls the partition consumer that feeds it. That stall is the
//! pipeline's backpressure path back to the queue.

use crate::errors::{PipelineError, Result};
use crate::event::SequenceEvent;
use tokio::sync::{mpsc, oneshot};

type Slot = (SequenceEvent, oneshot::Sender<()>);

/// Create a connected handoff pair for `partition`.
pub fn channel(partition: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        HandoffSender { partition, tx },
        HandoffReceiver { partition, rx },
    )
}

#[derive(Debug)]
pub struct HandoffSender {
    partition: usize,
    tx: mpsc::Sender<Slot>,
}

impl HandoffSender {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Hand `event` over and wait until the receiver has taken it.
    ///
    /// Fails with `HandoffClosed` if the receiver is dropped before taking
    /// the event; the event is lost with it.
    pub async fn send(&self, event: SequenceEvent) -> Result<()> {
        let (taken_tx, taken_rx) = oneshot::channel();
        self.tx
            .send((event, taken_tx))
            .await
            .map_err(|_| PipelineError::HandoffClosed(self.partition))?;
        taken_rx
            .await
            .map_err(|_| PipelineError::HandoffClosed(self.partition))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct HandoffReceiver {
    partition: usize,
    rx: mpsc::Receiver<Slot>,
}

impl HandoffReceiver {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Take the next event. Returns `None` once the sender is gone.
    pub async fn recv(&mut self) -> Option<SequenceEvent> {
        let (event, taken) = self.rx.recv().await?;
        // The sender may have stopped waiting on cancellation.
        let _ = taken.send(());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType, Offset};
    use std::time::Duration;

    fn sequence_event(position: u64) -> SequenceEvent {
        SequenceEvent {
            offset: Offset::new(0, position),
            event: Event::new(EventType::Log, vec![]),
        }
    }

    #[tokio::test]
    async fn test_send_blocks_until_taken() {
        let (tx, mut rx) = channel(0);

        let send = tokio::spawn(async move { tx.send(sequence_event(1)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.position(), 1);
        assert!(send.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (tx, rx) = channel(3);
        drop(rx);

        let result = tx.send(sequence_event(1)).await;
        assert!(matches!(result, Err(PipelineError::HandoffClosed(3))));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_sender_dropped() {
        let (tx, mut rx) = channel(0);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
