//! Log and span records produced by the file source

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Unix milliseconds
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    pub service_name: String,
    pub pod_name: String,
    pub namespace: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Recognise a level name, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" | "INFORMATION" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" | "ERR" => Some(LogLevel::Error),
            "FATAL" | "CRITICAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        LogLevel::parse(s).unwrap_or(LogLevel::Info)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub status: SpanStatus,
    pub service_name: String,
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl From<&str> for SpanStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "OK" | "SUCCESS" | "COMPLETED" => SpanStatus::Ok,
            "ERROR" | "FAILED" | "FAILURE" => SpanStatus::Error,
            "TIMEOUT" | "TIMEDOUT" => SpanStatus::Timeout,
            "CANCELLED" | "CANCELED" | "ABORTED" => SpanStatus::Cancelled,
            _ => SpanStatus::Ok,
        }
    }
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        message: String,
        service_name: String,
        pod_name: String,
        namespace: String,
    ) -> Self {
        Self {
            timestamp: crate::event::current_timestamp_millis(),
            level,
            message,
            service_name,
            pod_name,
            namespace,
            trace_id: None,
            span_id: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_trace_context(mut self, trace_id: String, span_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self
    }
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new span ID
pub fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
