//! Meter receiver: the protocol-facing edge that turns meter reports into events
//!
//! Agents report meters over a client stream where only the first item names
//! its service and instance. The receiver remembers those per stream and
//! stamps them onto every later item before it enters the pipeline.

use crate::errors::{PipelineError, Result};
use crate::event::{Event, EventType};
use crate::fetcher::EventSender;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MeterData {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub service_instance: String,
    /// Unix milliseconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub values: Vec<MeterValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeterValue {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// A batch of meter items reported in one message
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MeterCollection {
    pub items: Vec<MeterData>,
}

/// Service identity remembered for the lifetime of one report stream.
#[derive(Debug, Default)]
struct StreamSession {
    service: String,
    service_instance: String,
}

impl StreamSession {
    fn correlate(&mut self, item: &mut MeterData) {
        if !item.service.is_empty() {
            self.service = item.service.clone();
        }
        if !item.service_instance.is_empty() {
            self.service_instance = item.service_instance.clone();
        }
        item.service.clone_from(&self.service);
        item.service_instance.clone_from(&self.service_instance);
    }
}

#[derive(Debug, Clone)]
pub struct MeterReceiver {
    output: EventSender,
}

impl MeterReceiver {
    pub fn new(output: EventSender) -> Self {
        Self { output }
    }

    /// Drain one report stream, correlating service identity across its
    /// items. Returns the number of events emitted once the stream ends.
    pub async fn collect<S>(&self, stream: S) -> Result<usize>
    where
        S: Stream<Item = Result<MeterData>>,
    {
        let mut session = StreamSession::default();
        let mut stream = std::pin::pin!(stream);
        let mut emitted = 0;

        while let Some(item) = stream.next().await {
            let mut item = item?;
            session.correlate(&mut item);

            let key = format!("{}/{}", item.service, item.service_instance);
            self.emit(Event::new(EventType::Meter, serde_json::to_vec(&item)?).with_key(key))
                .await?;
            emitted += 1;
        }

        debug!(emitted, service = %session.service, "meter stream finished");
        Ok(emitted)
    }

    /// Drain a stream of collections. Each collection becomes one event as
    /// is, without identity correlation.
    pub async fn collect_batch<S>(&self, stream: S) -> Result<usize>
    where
        S: Stream<Item = Result<MeterCollection>>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut emitted = 0;

        while let Some(collection) = stream.next().await {
            let collection = collection?;
            self.emit(Event::new(EventType::Meter, serde_json::to_vec(&collection)?))
                .await?;
            emitted += 1;
        }

        debug!(emitted, "meter batch stream finished");
        Ok(emitted)
    }

    async fn emit(&self, event: Event) -> Result<()> {
        self.output
            .send(event)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::mpsc;

    fn item(service: &str, instance: &str, value: f64) -> MeterData {
        MeterData {
            service: service.to_string(),
            service_instance: instance.to_string(),
            timestamp: 1,
            values: vec![MeterValue {
                name: "cpu".to_string(),
                labels: HashMap::new(),
                value,
            }],
        }
    }

    #[tokio::test]
    async fn test_first_item_identity_is_stamped_on_later_items() {
        let (tx, mut rx) = mpsc::channel(8);
        let receiver = MeterReceiver::new(tx);

        let items = vec![
            Ok(item("checkout", "pod-1", 0.5)),
            Ok(item("", "", 0.6)),
            Ok(item("", "pod-2", 0.7)),
        ];
        assert_eq!(receiver.collect(stream::iter(items)).await.unwrap(), 3);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.event_type, EventType::Meter);
            let data: MeterData = serde_json::from_slice(&event.payload).unwrap();
            seen.push((data.service, data.service_instance, event.key.unwrap()));
        }

        assert_eq!(seen[1].0, "checkout");
        assert_eq!(seen[1].1, "pod-1");
        assert_eq!(seen[2].1, "pod-2");
        assert_eq!(seen[2].2, "checkout/pod-2");
    }

    #[tokio::test]
    async fn test_sessions_do_not_leak_between_streams() {
        let (tx, mut rx) = mpsc::channel(8);
        let receiver = MeterReceiver::new(tx);

        receiver
            .collect(stream::iter(vec![Ok(item("a", "a-1", 1.0))]))
            .await
            .unwrap();
        receiver
            .collect(stream::iter(vec![Ok(item("", "", 2.0))]))
            .await
            .unwrap();

        let _first = rx.recv().await.unwrap();
        let second: MeterData = serde_json::from_slice(&rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(second.service, "");
    }

    #[tokio::test]
    async fn test_stream_error_stops_collection() {
        let (tx, _rx) = mpsc::channel(8);
        let receiver = MeterReceiver::new(tx);

        let items = vec![
            Ok(item("svc", "i", 1.0)),
            Err(PipelineError::Transport("reset by peer".to_string())),
            Ok(item("svc", "i", 2.0)),
        ];
        assert!(matches!(
            receiver.collect(stream::iter(items)).await,
            Err(PipelineError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_collections_pass_through() {
        let (tx, mut rx) = mpsc::channel(8);
        let receiver = MeterReceiver::new(tx);

        let collection = MeterCollection {
            items: vec![item("svc", "i", 1.0), item("", "", 2.0)],
        };
        let count = receiver
            .collect_batch(stream::iter(vec![Ok(collection.clone())]))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let event = rx.recv().await.unwrap();
        assert!(event.key.is_none());
        let decoded: MeterCollection = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(decoded, collection);
    }

    #[tokio::test]
    async fn test_closed_pipeline_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let receiver = MeterReceiver::new(tx);

        let result = receiver.collect(stream::iter(vec![Ok(item("s", "i", 1.0))])).await;
        assert!(matches!(result, Err(PipelineError::Closed)));
    }
}
