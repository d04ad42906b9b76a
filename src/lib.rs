//! Telemetry Sidecar Pipeline Library
//!
//! Events pulled from a source are buffered in a partitioned, ack-tracked
//! queue and fanned out to one sink task per partition. Delivery is
//! at-least-once: a position is only released once the sink acknowledges it.

pub mod collector;
pub mod config;
pub mod errors;
pub mod event;
pub mod fetcher;
pub mod forwarder;
pub mod gatherer;
pub mod handoff;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod receiver;
pub mod telemetry;

pub use collector::SidecarCollector;
pub use config::{Config, QueueKind};
pub use errors::{PipelineError, Result};
pub use event::{Event, EventType, Offset, SequenceEvent};
pub use fetcher::{ChannelFetcher, EventSender, Fetcher, FileFetcher};
pub use forwarder::{Forwarder, HttpForwarder};
pub use gatherer::{Acker, Gatherer, GathererConfig, GathererState};
pub use handoff::{HandoffReceiver, HandoffSender};
pub use metrics::{MetricsRegistry, PipelineMetrics};
pub use metrics_server::MetricsServer;
pub use pipeline::Pipeline;
pub use processor::{ForwardProcessor, Processor};
pub use queue::{FileQueue, MemoryQueue, PartitionPolicy, PartitionedQueue, QueueSettings};
pub use receiver::MeterReceiver;
pub use telemetry::{LogEntry, TraceSpan};
