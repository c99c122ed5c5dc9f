//! Shared helpers for transport integration tests.

#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use empire_client::transport::EventSink;
use empire_client::{CloseReason, TransportError};

/// How long any single expected event may take.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Message(String),
    Error(String),
    Close(CloseReason),
}

/// Sink that forwards every event into a channel.
pub struct RecordingSink {
    tx: Mutex<Sender<Event>>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, Events) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self { tx: Mutex::new(tx) }),
            Events { rx },
        )
    }

    fn record(&self, event: Event) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

impl EventSink for RecordingSink {
    fn on_open(&self) {
        self.record(Event::Open);
    }

    fn on_message(&self, text: &str) {
        self.record(Event::Message(text.to_string()));
    }

    fn on_error(&self, error: &TransportError) {
        self.record(Event::Error(error.to_string()));
    }

    fn on_close(&self, reason: &CloseReason) {
        self.record(Event::Close(reason.clone()));
    }
}

/// Receiving end of a [`RecordingSink`].
pub struct Events {
    rx: Receiver<Event>,
}

impl Events {
    /// Next event, panicking if none arrives in time.
    pub fn next(&self) -> Event {
        match self.rx.recv_timeout(EVENT_TIMEOUT) {
            Ok(event) => event,
            Err(e) => panic!("no event within {EVENT_TIMEOUT:?}: {e}"),
        }
    }

    /// Collect events up to and including the close.
    pub fn until_close(&self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = self.next();
            let done = matches!(event, Event::Close(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// Assert nothing else arrives within `wait`.
    pub fn assert_quiet(&self, wait: Duration) {
        match self.rx.recv_timeout(wait) {
            Ok(event) => panic!("unexpected event {event:?}"),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
    }
}
