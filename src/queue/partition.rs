//! Cursor bookkeeping for a single partition

use crate::errors::{PipelineError, Result};
use crate::event::{Event, Offset, SequenceEvent};
use serde::Serialize;
use std::collections::VecDeque;

/// Snapshot of one partition's cursors.
///
/// Positions start at 1; a watermark of 0 means nothing has been
/// acknowledged. `ack_watermark < read_cursor <= write_cursor` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionCursors {
    pub write_cursor: u64,
    pub read_cursor: u64,
    pub ack_watermark: u64,
    pub pending: usize,
}

/// Result of applying an ack to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Advanced(u64),
    /// At or behind the current watermark.
    Stale,
    /// Beyond anything served so far; the watermark moved to the last served position.
    Clamped(u64),
}

#[derive(Debug)]
pub struct Partition {
    index: usize,
    capacity: usize,
    pending: VecDeque<SequenceEvent>,
    write_cursor: u64,
    read_cursor: u64,
    ack_watermark: u64,
}

impl Partition {
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            capacity,
            pending: VecDeque::new(),
            write_cursor: 1,
            read_cursor: 1,
            ack_watermark: 0,
        }
    }

    /// Rebuild a partition from events that survived a restart.
    ///
    /// `pending` must be in increasing position order, all above `ack_watermark`.
    pub fn restore(
        index: usize,
        capacity: usize,
        pending: Vec<SequenceEvent>,
        ack_watermark: u64,
    ) -> Self {
        let write_cursor = pending
            .last()
            .map(|e| e.position() + 1)
            .unwrap_or(ack_watermark + 1)
            .max(ack_watermark + 1);
        let read_cursor = pending
            .first()
            .map(|e| e.position())
            .unwrap_or(write_cursor);

        Self {
            index,
            capacity,
            pending: pending.into(),
            write_cursor,
            read_cursor,
            ack_watermark,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Stamp `event` with the next position without storing it.
    pub fn prepare(&self, event: Event) -> Result<SequenceEvent> {
        if self.is_full() {
            return Err(PipelineError::QueueFull {
                partition: self.index,
                capacity: self.capacity,
            });
        }

        Ok(SequenceEvent {
            offset: Offset::new(self.index, self.write_cursor),
            event,
        })
    }

    /// Store an event produced by [`Partition::prepare`].
    pub fn commit(&mut self, prepared: SequenceEvent) -> Offset {
        debug_assert_eq!(prepared.position(), self.write_cursor);
        let offset = prepared.offset;
        self.pending.push_back(prepared);
        self.write_cursor += 1;
        offset
    }

    pub fn push(&mut self, event: Event) -> Result<Offset> {
        let prepared = self.prepare(event)?;
        Ok(self.commit(prepared))
    }

    pub fn pop(&mut self) -> Result<SequenceEvent> {
        let event = self.pending.pop_front().ok_or(PipelineError::Empty)?;
        self.read_cursor = event.position() + 1;
        Ok(event)
    }

    pub fn ack(&mut self, position: u64) -> AckOutcome {
        if position <= self.ack_watermark {
            return AckOutcome::Stale;
        }

        let served = self.read_cursor - 1;
        if position > served {
            if served <= self.ack_watermark {
                return AckOutcome::Stale;
            }
            self.ack_watermark = served;
            return AckOutcome::Clamped(served);
        }

        self.ack_watermark = position;
        AckOutcome::Advanced(position)
    }

    pub fn ack_watermark(&self) -> u64 {
        self.ack_watermark
    }

    pub fn cursors(&self) -> PartitionCursors {
        PartitionCursors {
            write_cursor: self.write_cursor,
            read_cursor: self.read_cursor,
            ack_watermark: self.ack_watermark,
            pending: self.pending.len(),
        }
    }
}
