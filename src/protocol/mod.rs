//! Protocol Core
//!
//! Transport-independent half of the client: encodes commands, decodes
//! responses, and correlates responses with callers blocked in
//! [`Client::wait_for_json_response`].
//!
//! Correlation is by command code only. The server has no request id, so
//! the oldest outstanding wait for a code receives the next response with
//! that code. Callers that need strict pairing must not overlap requests
//! with the same code.

pub mod callbacks;
pub mod client;
pub mod dispatch;
pub mod message;

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::transport::{CloseReason, TransportError};

pub use callbacks::Callbacks;
pub use client::Client;
pub use dispatch::{Dispatcher, PendingResponse};
pub use message::{Command, Inbound, MessageError, Response};

/// Errors raised on the caller's thread.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No matching response before the deadline.
    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        /// Command code (or event) being awaited.
        waiting_for: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The connection closed before a response arrived.
    #[error("Connection closed while waiting for {waiting_for}")]
    ConnectionClosed {
        /// Command code being awaited.
        waiting_for: String,
    },

    /// The connection closed before it ever opened.
    #[error("Connection failed before opening: {0}")]
    OpenFailed(CloseReason),

    /// The server answered with a non-zero status.
    #[error("Server rejected {code} with status {status}: {data}")]
    Remote {
        /// Command code.
        code: String,
        /// Server status code.
        status: i64,
        /// Whatever payload came with the failure.
        data: Value,
    },

    /// Transport failure (closed connection, write error, bad config).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload could not be serialized.
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Command could not be built for the wire.
    #[error("Invalid command: {0}")]
    Message(#[from] MessageError),
}

impl ProtocolError {
    /// The server status, if this is a remote failure.
    pub fn remote_status(&self) -> Option<i64> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Fail with [`ProtocolError::Remote`] if the server reported an error.
pub fn raise_for_status(response: &Response) -> Result<(), ProtocolError> {
    if response.is_error() {
        return Err(ProtocolError::Remote {
            code: response.code.clone(),
            status: response.status,
            data: response.data.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raise_for_status_ok() {
        let resp = Response::new("cra", 0, json!({"AAM": {}}));
        assert!(raise_for_status(&resp).is_ok());
    }

    #[test]
    fn test_raise_for_status_error() {
        let resp = Response::new("cra", 95, json!(null));
        let err = raise_for_status(&resp).unwrap_err();
        assert_eq!(err.remote_status(), Some(95));
        assert!(err.to_string().contains("cra"));
    }
}
