//! Tails application log files and turns each line into events

use super::Fetcher;
use super::parser::{ParsedLine, SourceIdentity, parse_line};
use crate::config::Config;
use crate::errors::Result;
use crate::event::{Event, EventType};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_PAUSE: Duration = Duration::from_secs(30);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct FileSourceSettings {
    pub identity: SourceIdentity,
    pub log_paths: Vec<String>,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl From<&Config> for FileSourceSettings {
    fn from(config: &Config) -> Self {
        Self {
            identity: SourceIdentity {
                service_name: config.service_name.clone(),
                pod_name: config.pod_name.clone(),
                namespace: config.namespace.clone(),
            },
            log_paths: config.log_paths.clone(),
            poll_interval: config.file_poll_interval.max(MIN_POLL_INTERVAL),
            channel_capacity: config.batch_size.max(1),
        }
    }
}

/// Read position for one tailed file
#[derive(Debug, Clone)]
struct FileState {
    path: String,
    last_position: u64,
    last_modified: Option<SystemTime>,
}

/// Fetcher emitting a `Log` event per line and a `Trace` event per span line.
///
/// Events are keyed by file path so one file's lines stay in order under
/// key-hash routing.
#[derive(Debug)]
pub struct FileFetcher {
    settings: Arc<FileSourceSettings>,
    started: AtomicBool,
}

impl FileFetcher {
    pub fn new(settings: FileSourceSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            started: AtomicBool::new(false),
        }
    }
}

impl Fetcher for FileFetcher {
    fn name(&self) -> &str {
        "file-fetcher"
    }

    fn fetch(&self, token: CancellationToken) -> Option<mpsc::Receiver<Event>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        for path in &self.settings.log_paths {
            let tailer = FileTailer {
                state: FileState {
                    path: path.clone(),
                    last_position: 0,
                    last_modified: None,
                },
                settings: Arc::clone(&self.settings),
                output: tx.clone(),
            };
            tokio::spawn(tailer.run(token.clone()));
        }
        Some(rx)
    }
}

struct FileTailer {
    state: FileState,
    settings: Arc<FileSourceSettings>,
    output: mpsc::Sender<Event>,
}

impl FileTailer {
    #[instrument(skip(self, token), fields(path = %self.state.path))]
    async fn run(mut self, token: CancellationToken) {
        info!("Starting file monitor");

        let mut check_interval = interval(self.settings.poll_interval.max(MIN_POLL_INTERVAL));
        let mut consecutive_errors = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = check_interval.tick() => {}
            }

            match self.check_and_read_file().await {
                Ok(TailProgress::Read(lines)) => {
                    consecutive_errors = 0;
                    if lines > 0 {
                        debug!(lines, "Read new lines");
                    }
                }
                Ok(TailProgress::OutputClosed) => {
                    info!("Event stream closed, stopping file monitor");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors <= MAX_CONSECUTIVE_ERRORS {
                        warn!(attempt = consecutive_errors, "Error reading file: {}", e);
                    }

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("Too many consecutive errors reading file, pausing for 30 seconds");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_PAUSE) => {}
                        }
                        consecutive_errors = 0;
                    }
                }
            }
        }

        debug!("File monitor stopped");
    }

    /// Check the file for changes and read new content
    async fn check_and_read_file(&mut self) -> Result<TailProgress> {
        if !Path::new(&self.state.path).exists() {
            return Ok(TailProgress::Read(0));
        }

        let metadata = tokio::fs::metadata(&self.state.path).await?;
        let current_size = metadata.len();
        let current_modified = metadata.modified().ok();

        if current_size < self.state.last_position {
            debug!("File appears to have been truncated or rotated");
            self.state.last_position = 0;
        } else if self.state.last_modified == current_modified
            && current_size == self.state.last_position
        {
            return Ok(TailProgress::Read(0));
        }

        let progress = self.read_from_last_position().await?;
        self.state.last_modified = current_modified;
        Ok(progress)
    }

    /// Read complete lines from the last position; a trailing partial line
    /// is left for the next pass. Invalid UTF-8 is replaced, never retried.
    async fn read_from_last_position(&mut self) -> Result<TailProgress> {
        let mut file = File::open(&self.state.path).await?;
        file.seek(SeekFrom::Start(self.state.last_position)).await?;

        let mut reader = BufReader::new(file);
        let mut lines_read = 0;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let bytes_read = reader.read_until(b'\n', &mut buf).await?;
            if bytes_read == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            self.state.last_position += bytes_read as u64;
            lines_read += 1;

            let line = String::from_utf8_lossy(&buf);
            for event in self.events_for_line(&line)? {
                if self.output.send(event).await.is_err() {
                    return Ok(TailProgress::OutputClosed);
                }
            }
        }

        Ok(TailProgress::Read(lines_read))
    }

    fn events_for_line(&self, line: &str) -> Result<Vec<Event>> {
        parse_line(line, &self.settings.identity)
            .into_iter()
            .map(|parsed| {
                let (event_type, timestamp, payload) = match parsed {
                    ParsedLine::Log(entry) => {
                        (EventType::Log, entry.timestamp, serde_json::to_vec(&entry)?)
                    }
                    ParsedLine::Span(span) => {
                        (EventType::Trace, span.start_time, serde_json::to_vec(&span)?)
                    }
                };
                Ok(Event::new(event_type, payload)
                    .with_timestamp(timestamp)
                    .with_key(self.state.path.clone()))
            })
            .collect()
    }
}

enum TailProgress {
    Read(usize),
    OutputClosed,
}
