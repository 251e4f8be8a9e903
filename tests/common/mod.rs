//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use slirc_link::{Backend, ConnectionConfig, Error, Handler};
use tokio::sync::mpsc;

/// Every host notification, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connect,
    Message(String),
    Close,
    Error(String),
}

/// Handler forwarding each notification to a channel.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Handler for Recorder {
    fn on_connect(&self) {
        let _ = self.tx.send(Event::Connect);
    }

    fn on_message(&self, line: &str) {
        let _ = self.tx.send(Event::Message(line.to_string()));
    }

    fn on_close(&self) {
        let _ = self.tx.send(Event::Close);
    }

    fn on_error(&self, error: &Error) {
        let _ = self.tx.send(Event::Error(error.to_string()));
    }
}

/// A backend on the current runtime with default settings.
pub fn backend() -> (Backend, mpsc::UnboundedReceiver<Event>) {
    backend_with(ConnectionConfig::default())
}

pub fn backend_with(config: ConnectionConfig) -> (Backend, mpsc::UnboundedReceiver<Event>) {
    let (recorder, rx) = Recorder::new();
    let backend = Backend::new(tokio::runtime::Handle::current(), config, recorder);
    (backend, rx)
}

/// Everything already queued, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
