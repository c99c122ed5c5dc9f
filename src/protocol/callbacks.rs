//! User callbacks.
//!
//! `on_send` runs on the caller's thread as part of a send. The other four
//! run on the connection thread; a slow callback stalls that connection's
//! reads.

use std::fmt;

use crate::transport::{CloseReason, TransportError};

type TextCallback = Box<dyn Fn(&str) + Send + Sync>;
type OpenCallback = Box<dyn Fn() + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&TransportError) + Send + Sync>;
type CloseCallback = Box<dyn Fn(&CloseReason) + Send + Sync>;

/// The five optional event handlers, fixed at construction.
#[derive(Default)]
pub struct Callbacks {
    send: Option<TextCallback>,
    open: Option<OpenCallback>,
    message: Option<TextCallback>,
    error: Option<ErrorCallback>,
    close: Option<CloseCallback>,
}

impl Callbacks {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the raw text of every command handed to an open connection.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.send = Some(Box::new(f));
        self
    }

    /// Called once the connection is established.
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.open = Some(Box::new(f));
        self
    }

    /// Called with every inbound message, matched by a waiter or not.
    pub fn on_message(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    /// Called for transport and decode failures.
    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Called exactly once, last.
    pub fn on_close(mut self, f: impl Fn(&CloseReason) + Send + Sync + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }

    pub(crate) fn sent(&self, text: &str) {
        if let Some(f) = &self.send {
            f(text);
        }
    }

    pub(crate) fn opened(&self) {
        if let Some(f) = &self.open {
            f();
        }
    }

    pub(crate) fn message(&self, text: &str) {
        if let Some(f) = &self.message {
            f(text);
        }
    }

    pub(crate) fn error(&self, error: &TransportError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    pub(crate) fn closed(&self, reason: &CloseReason) {
        if let Some(f) = &self.close {
            f(reason);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_send", &self.send.is_some())
            .field("on_open", &self.open.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_close", &self.close.is_some())
            .finish()
    }
}
