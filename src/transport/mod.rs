//! Transport Layer
//!
//! Two interchangeable wire transports behind one contract:
//!
//! - [`StreamTransport`]: raw TCP, NUL-terminated text messages.
//! - [`FrameTransport`]: WebSocket, one text frame per message.
//!
//! Each live connection owns exactly one background thread. That thread runs
//! the connect, then the read loop, and is the only place the [`EventSink`]
//! is called from. Callers only ever touch [`Transport::send`],
//! [`Transport::close`] and [`Transport::join`].

pub mod frame;
pub mod framing;
pub mod stream;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::config::{ClientConfig, ConfigError, Endpoint, TransportKind};

pub use frame::FrameTransport;
pub use framing::NulFramer;
pub use stream::StreamTransport;

// =============================================================================
// ERRORS
// =============================================================================

/// Transport-level failures.
///
/// Everything raised on the reader thread is reported through
/// [`EventSink::on_error`]; only `send` returns these to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The initial connect could not be established.
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Target that was dialed.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Peer reset or I/O error while reading an open connection.
    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    /// Writing to the socket failed.
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    /// WebSocket protocol or I/O error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Outgoing message cannot be represented in the wire framing.
    #[error("Cannot frame message: {0}")]
    Unframeable(String),

    /// Malformed inbound framing or payload.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The connection is closing or closed.
    #[error("Connection closed")]
    Closed,

    /// The connection has not finished opening.
    #[error("Connection not open (state: {0})")]
    NotOpen(ConnectionState),

    /// The connection thread could not be started.
    #[error("Failed to spawn connection thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Bad configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Connection lifecycle.
///
/// `Init → Connecting → Open → Closing → Closed`, with `Connecting → Closed`
/// and `Open → Closed` on error. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, reader not yet running.
    Init,
    /// Reader thread is dialing.
    Connecting,
    /// Connected; messages flow.
    Open,
    /// Local close requested, reader winding down.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Closing or closed: no more dispatch, no more errors.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Code and reason passed to [`EventSink::on_close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket-style close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Abnormal closure (no close handshake, I/O failure, connect failure).
    pub const ABNORMAL: u16 = 1006;
    /// Peer sent a message larger than allowed.
    pub const TOO_BIG: u16 = 1009;

    /// Build a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Peer closed the connection cleanly.
    pub fn remote() -> Self {
        Self::new(Self::NORMAL, "Connection closed")
    }

    /// Connection dropped because of an error.
    pub fn error() -> Self {
        Self::new(Self::ABNORMAL, "Connection error")
    }

    /// Closed by a local `close()` call.
    pub fn local() -> Self {
        Self::new(Self::NORMAL, "Closed by client")
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Shared lifecycle state of one connection.
///
/// Only the reader thread calls [`Lifecycle::finish`], so `on_close` is
/// reported exactly once.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<ConnectionState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Init),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    /// `Init → Connecting`. False if a close already happened.
    pub(crate) fn begin_connect(&self) -> bool {
        self.advance(ConnectionState::Init, ConnectionState::Connecting)
    }

    /// `Connecting → Open`. False if a close raced the connect.
    pub(crate) fn mark_open(&self) -> bool {
        self.advance(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// Move to `Closing`. Returns true only for the call that did it.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_closing() {
            return false;
        }
        *state = ConnectionState::Closing;
        true
    }

    /// Move to `Closed`. Returns true only for the call that did it.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Receiver of connection events, called from the connection's own thread.
///
/// Ordering: `on_open` precedes every `on_message`/`on_error`, and
/// `on_close` is the last call, made exactly once.
pub trait EventSink: Send + Sync {
    /// Connection established.
    fn on_open(&self);
    /// One complete inbound text message.
    fn on_message(&self, text: &str);
    /// A transport failure; never called once a local close started.
    fn on_error(&self, error: &TransportError);
    /// Final event for this connection.
    fn on_close(&self, reason: &CloseReason);
}

/// A live connection, independent of wire format.
pub trait Transport: Send + Sync {
    /// Send one text message. Fails fast when not open.
    fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Block until the reader thread exits.
    fn join(&self);

    /// Remote endpoint.
    fn endpoint(&self) -> &Endpoint;
}

/// Open the transport selected by `config`, reporting into `sink`.
///
/// Never blocks on the network: connecting happens on the new thread.
pub fn connect(
    config: &ClientConfig,
    sink: Arc<dyn EventSink>,
) -> Result<Box<dyn Transport>, TransportError> {
    let endpoint = config.endpoint()?;
    match config.resolved_transport(&endpoint) {
        TransportKind::Frame => Ok(Box::new(FrameTransport::connect(
            endpoint,
            config.connect_timeout,
            sink,
        )?)),
        TransportKind::Stream | TransportKind::Auto => Ok(Box::new(StreamTransport::connect(
            endpoint,
            config.connect_timeout,
            config.max_message_size,
            sink,
        )?)),
    }
}

/// Join a reader thread, unless called from that very thread.
pub(crate) fn join_reader(handle: &Mutex<Option<JoinHandle<()>>>) {
    let taken = {
        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(h) if h.thread().id() == thread::current().id() => return,
            _ => guard.take(),
        }
    };
    if let Some(h) = taken {
        if h.join().is_err() {
            tracing::error!("Connection thread panicked");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), ConnectionState::Init);
        assert!(lc.begin_connect());
        assert!(lc.mark_open());
        assert_eq!(lc.state(), ConnectionState::Open);
        assert!(lc.begin_close());
        assert!(lc.is_closing());
        assert!(lc.finish());
        assert_eq!(lc.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_lifecycle_close_is_reported_once() {
        let lc = Lifecycle::new();
        assert!(lc.begin_connect());
        assert!(lc.begin_close());
        assert!(!lc.begin_close());
        assert!(lc.finish());
        assert!(!lc.finish());
    }

    #[test]
    fn test_lifecycle_closed_is_terminal() {
        let lc = Lifecycle::new();
        assert!(lc.begin_connect());
        assert!(lc.finish());
        assert!(!lc.mark_open());
        assert!(!lc.begin_close());
        assert!(!lc.begin_connect());
        assert_eq!(lc.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_during_connect_blocks_open() {
        let lc = Lifecycle::new();
        assert!(lc.begin_connect());
        assert!(lc.begin_close());
        assert!(!lc.mark_open());
    }
}
