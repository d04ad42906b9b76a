//! Event sources drained by the gatherer's producer task

pub mod channel;
pub mod file;
pub mod parser;

pub use channel::{ChannelFetcher, EventSender};
pub use file::{FileFetcher, FileSourceSettings};

use crate::event::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Produces a stream of events.
///
/// `fetch` starts the source and hands out its output stream. Starting is
/// idempotent: every call after the first returns `None`. The source is
/// responsible for stopping once `token` is cancelled.
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self, token: CancellationToken) -> Option<mpsc::Receiver<Event>>;
}
