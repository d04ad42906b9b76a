//! Parsing of tailed log lines into log entries and spans

use crate::telemetry::{
    LogEntry, LogLevel, SpanStatus, TraceSpan, generate_span_id, generate_trace_id,
};
use serde_json::Value;
use std::collections::HashMap;

/// Identity stamped onto every parsed record.
#[derive(Debug, Clone)]
pub struct SourceIdentity {
    pub service_name: String,
    pub pod_name: String,
    pub namespace: String,
}

/// What a single line turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Log(LogEntry),
    Span(TraceSpan),
}

/// Parse one line. Blank lines and JSON objects without a message yield nothing.
pub fn parse_line(line: &str, identity: &SourceIdentity) -> Vec<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            let mut parsed = Vec::new();
            if let Some(entry) = parse_json_log(&json, identity) {
                parsed.push(ParsedLine::Log(entry));
            }
            if let Some(span) = parse_json_span(&json, identity) {
                parsed.push(ParsedLine::Span(span));
            }
            return parsed;
        }
    }

    vec![ParsedLine::Log(parse_plain_log(trimmed, identity))]
}

fn first_str<'a>(json: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| json[*key].as_str())
}

fn first_i64(json: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| json[*key].as_i64())
}

fn string_map(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_json_log(json: &Value, identity: &SourceIdentity) -> Option<LogEntry> {
    let message = first_str(json, &["message", "msg", "text"])?;
    if message.is_empty() {
        return None;
    }

    let level = first_str(json, &["level", "severity", "log_level"]).unwrap_or("INFO");

    let mut entry = LogEntry::new(
        LogLevel::from(level),
        message.to_string(),
        identity.service_name.clone(),
        identity.pod_name.clone(),
        identity.namespace.clone(),
    );

    if let Some(timestamp) = first_i64(json, &["timestamp", "@timestamp", "time"]) {
        entry.timestamp = timestamp;
    }

    entry.trace_id = first_str(json, &["trace_id", "traceId", "trace-id"]).map(String::from);
    entry.span_id = first_str(json, &["span_id", "spanId", "span-id"]).map(String::from);

    entry.attributes = string_map(&json["attributes"]);
    for field in ["user_id", "request_id", "session_id", "correlation_id"] {
        if let Some(value) = json[field].as_str() {
            entry.attributes.insert(field.to_string(), value.to_string());
        }
    }

    Some(entry)
}

fn parse_json_span(json: &Value, identity: &SourceIdentity) -> Option<TraceSpan> {
    // Only lines that declare both a span and an operation describe a span.
    let span_id = first_str(json, &["span_id", "spanId"])?;
    let operation_name = first_str(json, &["operation", "operation_name", "method"])?;

    let start_time = first_i64(json, &["start_time", "startTime"])
        .unwrap_or_else(crate::event::current_timestamp_millis);
    let end_time = first_i64(json, &["end_time", "endTime"]).unwrap_or(start_time);
    let duration_ms = json["duration_ms"]
        .as_u64()
        .or_else(|| json["duration"].as_u64())
        .unwrap_or_else(|| end_time.saturating_sub(start_time).max(0) as u64);

    Some(TraceSpan {
        trace_id: first_str(json, &["trace_id", "traceId"])
            .map(String::from)
            .unwrap_or_else(generate_trace_id),
        span_id: if span_id.is_empty() {
            generate_span_id()
        } else {
            span_id.to_string()
        },
        parent_span_id: first_str(json, &["parent_span_id", "parentSpanId"]).map(String::from),
        operation_name: operation_name.to_string(),
        start_time,
        end_time,
        duration_ms,
        status: SpanStatus::from(first_str(json, &["status", "span_status"]).unwrap_or("OK")),
        service_name: identity.service_name.clone(),
        tags: string_map(&json["tags"]),
    })
}

/// Unstructured line: look for a level token among the leading words,
/// e.g. `[2023-12-01T10:30:45Z] INFO: msg`, `2023/12/01 10:30:45 [error] msg`
/// or `ERROR: msg`. The message is whatever follows the level token.
fn parse_plain_log(line: &str, identity: &SourceIdentity) -> LogEntry {
    let mut level = LogLevel::Info;
    let mut message = line;

    let mut rest = line;
    for _ in 0..4 {
        let rest_trimmed = rest.trim_start();
        let end = rest_trimmed
            .find(char::is_whitespace)
            .unwrap_or(rest_trimmed.len());
        let (token, after) = rest_trimmed.split_at(end);
        if token.is_empty() {
            break;
        }

        let word = token.trim_matches(|c: char| !c.is_ascii_alphabetic());
        if let Some(found) = LogLevel::parse(word) {
            level = found;
            let after = after.trim_start().trim_start_matches(['-', ':']).trim_start();
            if !after.is_empty() {
                message = after;
            }
            break;
        }
        rest = after;
    }

    LogEntry::new(
        level,
        message.to_string(),
        identity.service_name.clone(),
        identity.pod_name.clone(),
        identity.namespace.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SourceIdentity {
        SourceIdentity {
            service_name: "checkout".to_string(),
            pod_name: "checkout-7d9".to_string(),
            namespace: "shop".to_string(),
        }
    }

    fn only_log(parsed: Vec<ParsedLine>) -> LogEntry {
        match parsed.as_slice() {
            [ParsedLine::Log(entry)] => entry.clone(),
            other => panic!("expected a single log entry, got {:?}", other),
        }
    }

    #[test]
    fn test_json_log_with_aliases() {
        let line = r#"{"msg":"payment failed","severity":"error","time":1700000000000,"traceId":"t1","request_id":"r-9"}"#;
        let entry = only_log(parse_line(line, &identity()));

        assert_eq!(entry.message, "payment failed");
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.timestamp, 1_700_000_000_000);
        assert_eq!(entry.trace_id.as_deref(), Some("t1"));
        assert_eq!(entry.attributes.get("request_id").map(String::as_str), Some("r-9"));
        assert_eq!(entry.service_name, "checkout");
    }

    #[test]
    fn test_json_span_line_yields_log_and_span() {
        let line = r#"{"message":"GET /cart","span_id":"s1","trace_id":"t1","operation":"GET /cart","duration_ms":12,"status":"failed"}"#;
        let parsed = parse_line(line, &identity());

        assert_eq!(parsed.len(), 2);
        match &parsed[1] {
            ParsedLine::Span(span) => {
                assert_eq!(span.operation_name, "GET /cart");
                assert_eq!(span.duration_ms, 12);
                assert_eq!(span.status, SpanStatus::Error);
                assert_eq!(span.trace_id, "t1");
            }
            other => panic!("expected span, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_levels() {
        let entry = only_log(parse_line("[2023-12-01T10:30:45Z] WARN: disk almost full", &identity()));
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "disk almost full");

        let entry = only_log(parse_line("2023/12/01 10:30:45 [error] upstream timed out", &identity()));
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "upstream timed out");

        let entry = only_log(parse_line("just some output", &identity()));
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message, "just some output");
    }

    #[test]
    fn test_blank_and_messageless_lines_are_skipped() {
        assert!(parse_line("   ", &identity()).is_empty());
        assert!(parse_line(r#"{"level":"info"}"#, &identity()).is_empty());
    }

    #[test]
    fn test_invalid_json_falls_back_to_plain_text() {
        let entry = only_log(parse_line("{not json", &identity()));
        assert_eq!(entry.message, "{not json");
    }
}
