//! Error types for the ingestion pipeline

use std::fmt;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug)]
pub enum PipelineError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Metric registration or encoding failed
    Metrics(String),

    /// Queue storage could not be acquired
    QueueInit(String),

    /// Queue used before `initialize`
    NotInitialized,

    /// Partition holds `capacity` undequeued events
    QueueFull { partition: usize, capacity: usize },

    /// Nothing to dequeue right now; poll again later
    Empty,

    /// Queue was closed
    Closed,

    /// Partition index outside `0..count`
    PartitionOutOfRange { partition: usize, count: usize },

    /// Persisted segment could not be replayed
    CorruptLog { partition: usize, line: usize, reason: String },

    /// Receiving side of a handoff has gone away
    HandoffClosed(usize),

    /// Transport error
    Transport(String),

    /// Generic error with message
    Other(String),
}

impl PipelineError {
    /// `Empty` is a polling signal, not a failure.
    pub fn is_empty(&self) -> bool {
        matches!(self, PipelineError::Empty)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineError::Closed)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io(err) => write!(f, "IO error: {}", err),
            PipelineError::Http(err) => write!(f, "HTTP error: {}", err),
            PipelineError::Json(err) => write!(f, "JSON error: {}", err),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Metrics(msg) => write!(f, "Metrics error: {}", msg),
            PipelineError::QueueInit(msg) => write!(f, "Queue initialization failed: {}", msg),
            PipelineError::NotInitialized => write!(f, "Queue is not initialized"),
            PipelineError::QueueFull { partition, capacity } => write!(
                f,
                "Partition {} is full (capacity {})",
                partition, capacity
            ),
            PipelineError::Empty => write!(f, "Partition is empty"),
            PipelineError::Closed => write!(f, "Queue is closed"),
            PipelineError::PartitionOutOfRange { partition, count } => write!(
                f,
                "Partition {} out of range (partition count {})",
                partition, count
            ),
            PipelineError::CorruptLog { partition, line, reason } => write!(
                f,
                "Corrupt segment for partition {} at line {}: {}",
                partition, line, reason
            ),
            PipelineError::HandoffClosed(partition) => {
                write!(f, "Output handoff for partition {} is closed", partition)
            }
            PipelineError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PipelineError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::Http(err) => Some(err),
            PipelineError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Http(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Json(err)
    }
}

impl From<prometheus::Error> for PipelineError {
    fn from(err: prometheus::Error) -> Self {
        PipelineError::Metrics(err.to_string())
    }
}
