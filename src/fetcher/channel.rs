//! Fetcher fed by in-process producers such as protocol receivers

use super::Fetcher;
use crate::event::Event;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type EventSender = mpsc::Sender<Event>;

/// A fetcher whose events are pushed through an [`EventSender`].
#[derive(Debug)]
pub struct ChannelFetcher {
    name: String,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl ChannelFetcher {
    /// Create a fetcher and the sender that feeds it.
    pub fn new(name: impl Into<String>, capacity: usize) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let fetcher = Self {
            name: name.into(),
            receiver: Mutex::new(Some(rx)),
        };
        (tx, fetcher)
    }
}

impl Fetcher for ChannelFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, _token: CancellationToken) -> Option<mpsc::Receiver<Event>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
