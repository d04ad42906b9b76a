//! File-backed partitioned queue
//!
//! Each partition owns two files under the queue directory:
//!
//! - `partition-<p>.log`: append-only segment, one JSON `SequenceEvent` per line.
//! - `partition-<p>.ack`: last checkpointed ack watermark.
//!
//! `initialize` replays every segment, drops what the checkpoint already
//! covers and rewrites the segment with the survivors, so the queue resumes
//! with every unacknowledged event pending again. A torn final line left by
//! a crash mid-append is discarded; corruption anywhere else fails startup.
//!
//! The watermark is checkpointed every `checkpoint_every` advancing acks and
//! on close. A crash between checkpoints redelivers events acknowledged since
//! the last one. Once a checkpoint covers at least half of the segment (and
//! no fewer than `COMPACT_MIN_ACKED` records) the segment is compacted while
//! the queue runs, so its size tracks the unacknowledged backlog.
//!
//! An exclusive lock on `queue.lock` is held from `initialize` to `close`.

use super::partition::{AckOutcome, Partition, PartitionCursors};
use super::{PartitionedQueue, QueueSettings, Router, check_partition};
use crate::errors::{PipelineError, Result};
use crate::event::{Event, Offset, SequenceEvent};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const NAME: &str = "file-queue";

const LOCK_FILE: &str = "queue.lock";
const DEFAULT_CHECKPOINT_EVERY: usize = 64;
const COMPACT_MIN_ACKED: u64 = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    watermark: u64,
}

#[derive(Debug)]
struct FilePartition {
    state: Partition,
    segment: File,
    segment_len: u64,
    segment_path: PathBuf,
    checkpoint_path: PathBuf,
    /// Every position in the segment is above this one
    segment_base: u64,
    acks_since_checkpoint: usize,
}

impl FilePartition {
    async fn open(dir: &Path, index: usize, capacity: usize) -> Result<Self> {
        let segment_path = dir.join(format!("partition-{}.log", index));
        let checkpoint_path = dir.join(format!("partition-{}.ack", index));

        let watermark = read_checkpoint(&checkpoint_path).await?;
        let survivors = compact_segment(index, &segment_path, watermark).await?;

        let segment = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)
            .await?;
        let segment_len = segment.metadata().await?.len();

        if !survivors.is_empty() {
            info!(
                queue = NAME,
                partition = index,
                backlog = survivors.len(),
                watermark,
                "Recovered unacknowledged events"
            );
        }

        Ok(Self {
            state: Partition::restore(index, capacity, survivors, watermark),
            segment,
            segment_len,
            segment_path,
            checkpoint_path,
            segment_base: watermark,
            acks_since_checkpoint: 0,
        })
    }

    async fn append(&mut self, event: Event) -> Result<Offset> {
        let prepared = self.state.prepare(event)?;
        let mut line = serde_json::to_vec(&prepared)?;
        line.push(b'\n');

        if let Err(e) = self.write_line(&line).await {
            // Drop any partial line so it cannot end up in the middle of the segment.
            if let Err(truncate_err) = self.segment.set_len(self.segment_len).await {
                warn!(
                    queue = NAME,
                    partition = self.state.index(),
                    "Failed to roll back partial segment write: {}",
                    truncate_err
                );
            }
            return Err(e);
        }

        self.segment_len += line.len() as u64;
        Ok(self.state.commit(prepared))
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.segment.write_all(line).await?;
        self.segment.flush().await?;
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<()> {
        let body = serde_json::to_vec(&Checkpoint {
            watermark: self.state.ack_watermark(),
        })?;
        write_atomically(&self.checkpoint_path, &body).await?;
        self.acks_since_checkpoint = 0;
        self.compact_if_mostly_acked().await
    }

    /// Rewrite the segment without acknowledged records. Only runs after the
    /// watermark it drops has been checkpointed.
    async fn compact_if_mostly_acked(&mut self) -> Result<()> {
        let cursors = self.state.cursors();
        let watermark = cursors.ack_watermark;
        let acked = watermark.saturating_sub(self.segment_base);
        let records = cursors
            .write_cursor
            .saturating_sub(1)
            .saturating_sub(self.segment_base);
        if acked < COMPACT_MIN_ACKED || acked.saturating_mul(2) < records {
            return Ok(());
        }

        compact_segment(self.state.index(), &self.segment_path, watermark).await?;
        self.segment = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.segment_path)
            .await?;
        self.segment_len = self.segment.metadata().await?.len();
        self.segment_base = watermark;
        Ok(())
    }

    async fn close(&mut self) -> Result<usize> {
        self.segment.flush().await?;
        self.segment.sync_all().await?;
        self.checkpoint().await?;

        let retained = compact_segment(
            self.state.index(),
            &self.segment_path,
            self.state.ack_watermark(),
        )
        .await?;
        Ok(retained.len())
    }
}

/// Queue whose partitions survive restarts.
#[derive(Debug)]
pub struct FileQueue {
    dir: PathBuf,
    settings: QueueSettings,
    router: Router,
    checkpoint_every: usize,
    partitions: OnceLock<Vec<Mutex<FilePartition>>>,
    lock_file: OnceLock<std::fs::File>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl FileQueue {
    pub fn new(dir: impl Into<PathBuf>, settings: QueueSettings) -> Self {
        Self {
            dir: dir.into(),
            router: Router::new(settings.policy, settings.partition_count),
            settings,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            partitions: OnceLock::new(),
            lock_file: OnceLock::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Checkpoint the watermark after this many advancing acks.
    pub fn with_checkpoint_every(mut self, acks: usize) -> Self {
        self.checkpoint_every = acks.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partitions(&self) -> Result<&[Mutex<FilePartition>]> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        self.partitions
            .get()
            .map(Vec::as_slice)
            .ok_or(PipelineError::NotInitialized)
    }

    fn partition(&self, index: usize) -> Result<&Mutex<FilePartition>> {
        let partitions = self.partitions()?;
        check_partition(index, partitions.len())?;
        Ok(&partitions[index])
    }

    fn acquire_lock(&self) -> Result<std::fs::File> {
        let path = self.dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                PipelineError::QueueInit(format!(
                    "cannot open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        FileExt::try_lock_exclusive(&file).map_err(|e| {
            PipelineError::QueueInit(format!(
                "queue directory {} is locked by another process: {}",
                self.dir.display(),
                e
            ))
        })?;
        Ok(file)
    }
}

#[async_trait]
impl PartitionedQueue for FileQueue {
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

        fs::create_dir_all(&self.dir).await.map_err(|e| {
            PipelineError::QueueInit(format!(
                "cannot create queue directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        let lock_file = self.acquire_lock()?;

        let mut partitions = Vec::with_capacity(self.settings.partition_count);
        for index in 0..self.settings.partition_count {
            let partition =
                FilePartition::open(&self.dir, index, self.settings.partition_capacity).await?;
            partitions.push(Mutex::new(partition));
        }

        self.partitions
            .set(partitions)
            .map_err(|_| PipelineError::QueueInit("partitions already allocated".to_string()))?;
        self.lock_file
            .set(lock_file)
            .map_err(|_| PipelineError::QueueInit("lock already held".to_string()))?;

        info!(
            queue = NAME,
            dir = %self.dir.display(),
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
        partition.append(event).await
    }

    async fn dequeue(&self, partition: usize) -> Result<SequenceEvent> {
        let mut slot = self.partition(partition)?.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        slot.state.pop()
    }

    async fn ack(&self, offset: &Offset) {
        let slot = match self.partition(offset.partition) {
            Ok(slot) => slot,
            Err(e) => {
                debug!(queue = NAME, offset = %offset, "Ignoring ack: {}", e);
                return;
            }
        };

        let mut partition = slot.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        match partition.state.ack(offset.position) {
            AckOutcome::Stale => return,
            AckOutcome::Advanced(_) => {}
            AckOutcome::Clamped(watermark) => {
                warn!(
                    queue = NAME,
                    offset = %offset,
                    watermark,
                    "Ack beyond served position, clamped"
                );
            }
        }

        partition.acks_since_checkpoint += 1;
        if partition.acks_since_checkpoint >= self.checkpoint_every {
            if let Err(e) = partition.checkpoint().await {
                warn!(
                    queue = NAME,
                    partition = offset.partition,
                    "Failed to checkpoint ack watermark: {}",
                    e
                );
            }
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

        let mut first_error = None;
        let mut retained = 0;
        for slot in partitions {
            let mut partition = slot.lock().await;
            match partition.close().await {
                Ok(count) => retained += count,
                Err(e) => {
                    warn!(
                        queue = NAME,
                        partition = partition.state.index(),
                        "Failed to close partition: {}",
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(lock_file) = self.lock_file.get() {
            if let Err(e) = FileExt::unlock(lock_file) {
                warn!(queue = NAME, "Failed to release queue lock: {}", e);
            }
        }

        info!(
            queue = NAME,
            retained, "Queue closed, unacknowledged events kept for redelivery"
        );
        first_error.map_or(Ok(()), Err)
    }

    async fn cursors(&self, partition: usize) -> Result<PartitionCursors> {
        Ok(self.partition(partition)?.lock().await.state.cursors())
    }
}

async fn read_checkpoint(path: &Path) -> Result<u64> {
    let body = match fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let checkpoint: Checkpoint = serde_json::from_slice(&body).map_err(|e| {
        PipelineError::QueueInit(format!("invalid checkpoint {}: {}", path.display(), e))
    })?;
    Ok(checkpoint.watermark)
}

/// Rewrite a segment keeping only positions above `watermark`.
async fn compact_segment(
    partition: usize,
    path: &Path,
    watermark: u64,
) -> Result<Vec<SequenceEvent>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let survivors: Vec<SequenceEvent> = replay_segment(partition, &contents)?
        .into_iter()
        .filter(|record| record.position() > watermark)
        .collect();

    let mut body = Vec::new();
    for record in &survivors {
        serde_json::to_writer(&mut body, record)?;
        body.push(b'\n');
    }
    write_atomically(path, &body).await?;

    debug!(
        queue = NAME,
        partition,
        retained = survivors.len(),
        watermark,
        "Compacted segment"
    );
    Ok(survivors)
}

/// Parse a segment body into records, in position order.
fn replay_segment(partition: usize, contents: &str) -> Result<Vec<SequenceEvent>> {
    let lines: Vec<&str> = contents.lines().collect();
    let last = lines.iter().rposition(|line| !line.trim().is_empty());

    let mut records: Vec<SequenceEvent> = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let corrupt = |reason: String| PipelineError::CorruptLog {
            partition,
            line: idx + 1,
            reason,
        };

        let record: SequenceEvent = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) if Some(idx) == last => {
                warn!(
                    queue = NAME,
                    partition,
                    line = idx + 1,
                    "Discarding torn tail record: {}",
                    e
                );
                break;
            }
            Err(e) => return Err(corrupt(e.to_string())),
        };

        if record.partition() != partition {
            return Err(corrupt(format!(
                "record belongs to partition {}",
                record.partition()
            )));
        }
        if let Some(previous) = records.last() {
            if record.position() <= previous.position() {
                return Err(corrupt(format!(
                    "position {} does not follow {}",
                    record.position(),
                    previous.position()
                )));
            }
        }
        records.push(record);
    }

    Ok(records)
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).await?;
    file.write_all(body).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::queue::PartitionPolicy;
    use tempfile::TempDir;

    fn settings(partitions: usize, capacity: usize) -> QueueSettings {
        QueueSettings::new(partitions, capacity).with_policy(PartitionPolicy::RoundRobin)
    }

    fn event(tag: &str) -> Event {
        Event::new(EventType::Log, tag.as_bytes().to_vec())
    }

    fn line(partition: usize, position: u64, tag: &str) -> String {
        let record = SequenceEvent {
            offset: Offset::new(partition, position),
            event: event(tag).with_timestamp(1),
        };
        serde_json::to_string(&record).unwrap()
    }

    #[test]
    fn test_replay_discards_torn_tail() {
        let contents = format!("{}\n{}\n{{\"offset\":{{\"parti", line(0, 1, "a"), line(0, 2, "b"));
        let records = replay_segment(0, &contents).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].position(), 2);
    }

    #[test]
    fn test_replay_rejects_mid_file_corruption() {
        let contents = format!("{}\nnot json\n{}\n", line(0, 1, "a"), line(0, 3, "c"));
        let err = replay_segment(0, &contents).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptLog { partition: 0, line: 2, .. }));
    }

    #[test]
    fn test_replay_rejects_out_of_order_positions() {
        let contents = format!("{}\n{}\n", line(1, 5, "a"), line(1, 4, "b"));
        assert!(matches!(
            replay_segment(1, &contents),
            Err(PipelineError::CorruptLog { line: 2, .. })
        ));
    }

    #[test]
    fn test_replay_rejects_foreign_partition() {
        let contents = format!("{}\n", line(3, 1, "a"));
        assert!(replay_segment(0, &contents).is_err());
    }

    #[tokio::test]
    async fn test_unacknowledged_events_survive_restart() {
        let dir = TempDir::new().unwrap();

        let queue = FileQueue::new(dir.path(), settings(1, 16));
        queue.initialize().await.unwrap();
        for tag in ["a", "b", "c"] {
            queue.enqueue(event(tag)).await.unwrap();
        }
        for _ in 0..3 {
            queue.dequeue(0).await.unwrap();
        }
        queue.ack(&Offset::new(0, 2)).await;
        queue.close().await.unwrap();

        let reopened = FileQueue::new(dir.path(), settings(1, 16));
        reopened.initialize().await.unwrap();

        let redelivered = reopened.dequeue(0).await.unwrap();
        assert_eq!(redelivered.position(), 3);
        assert_eq!(redelivered.event.payload, b"c");
        assert!(reopened.dequeue(0).await.unwrap_err().is_empty());

        let next = reopened.enqueue(event("d")).await.unwrap();
        assert_eq!(next.position, 4);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_instance_cannot_take_the_lock() {
        let dir = TempDir::new().unwrap();
        let first = FileQueue::new(dir.path(), settings(1, 4));
        first.initialize().await.unwrap();

        let second = FileQueue::new(dir.path(), settings(1, 4));
        assert!(matches!(
            second.initialize().await,
            Err(PipelineError::QueueInit(_))
        ));
        // A failed instance stays unusable.
        assert!(second.initialize().await.is_err());

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_written_after_threshold() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path(), settings(1, 8)).with_checkpoint_every(2);
        queue.initialize().await.unwrap();

        for tag in ["a", "b", "c"] {
            queue.enqueue(event(tag)).await.unwrap();
            queue.dequeue(0).await.unwrap();
        }
        queue.ack(&Offset::new(0, 1)).await;
        assert_eq!(read_checkpoint(&dir.path().join("partition-0.ack")).await.unwrap(), 0);

        queue.ack(&Offset::new(0, 2)).await;
        assert_eq!(read_checkpoint(&dir.path().join("partition-0.ack")).await.unwrap(), 2);

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_compacts_acknowledged_records() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path(), settings(1, 8));
        queue.initialize().await.unwrap();

        for tag in ["a", "b"] {
            queue.enqueue(event(tag)).await.unwrap();
        }
        queue.dequeue(0).await.unwrap();
        queue.ack(&Offset::new(0, 1)).await;
        queue.close().await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("partition-0.log")).unwrap();
        let records = replay_segment(0, &contents).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position(), 2);
        assert!(queue.dequeue(0).await.unwrap_err().is_closed());
    }

    fn segment_lines(dir: &Path, partition: usize) -> usize {
        std::fs::read_to_string(dir.join(format!("partition-{}.log", partition)))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_segment_is_compacted_while_running() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path(), settings(1, 4)).with_checkpoint_every(1);
        queue.initialize().await.unwrap();

        for _ in 0..1000 {
            queue.enqueue(event("x")).await.unwrap();
            let seq = queue.dequeue(0).await.unwrap();
            queue.ack(&seq.offset).await;
        }

        let cursors = queue.cursors(0).await.unwrap();
        assert_eq!(cursors.ack_watermark, 1000);
        assert!(segment_lines(dir.path(), 0) < COMPACT_MIN_ACKED as usize);

        queue.close().await.unwrap();
        let reopened = FileQueue::new(dir.path(), settings(1, 4));
        reopened.initialize().await.unwrap();
        assert!(reopened.dequeue(0).await.unwrap_err().is_empty());
        assert_eq!(reopened.enqueue(event("y")).await.unwrap().position, 1001);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_running_compaction_keeps_unacknowledged_records() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path(), settings(1, 512)).with_checkpoint_every(1);
        queue.initialize().await.unwrap();

        for i in 0..300 {
            queue.enqueue(event(&i.to_string())).await.unwrap();
        }
        for _ in 0..300 {
            queue.dequeue(0).await.unwrap();
        }
        for position in 1..=290 {
            queue.ack(&Offset::new(0, position)).await;
        }

        let lines = segment_lines(dir.path(), 0);
        assert!(lines < 300 && lines >= 10, "segment has {} lines", lines);

        // Appends after a running compaction land in the new segment.
        queue.enqueue(event("late")).await.unwrap();
        assert_eq!(segment_lines(dir.path(), 0), lines + 1);

        queue.close().await.unwrap();
        let reopened = FileQueue::new(dir.path(), settings(1, 512));
        reopened.initialize().await.unwrap();
        let mut positions = Vec::new();
        while let Ok(seq) = reopened.dequeue(0).await {
            positions.push(seq.position());
        }
        assert_eq!(positions, (291..=301).collect::<Vec<u64>>());
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_partition_rejects_without_writing() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path(), settings(1, 1));
        queue.initialize().await.unwrap();

        queue.enqueue(event("x")).await.unwrap();
        assert!(matches!(
            queue.enqueue(event("y")).await,
            Err(PipelineError::QueueFull { partition: 0, capacity: 1 })
        ));
        assert_eq!(segment_lines(dir.path(), 0), 1);

        assert_eq!(queue.dequeue(0).await.unwrap().event.payload, b"x");
        assert_eq!(queue.enqueue(event("y")).await.unwrap().position, 2);
        queue.close().await.unwrap();
    }
}
