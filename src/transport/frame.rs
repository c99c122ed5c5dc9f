//! WebSocket transport.
//!
//! The WebSocket library already delivers whole frames, so this adapter only
//! renames lifecycle events into the [`EventSink`] contract, decodes binary
//! frames as UTF-8, and passes `send`/`close` through.
//!
//! # Threading Model
//!
//! Each connection spawns one OS thread that owns a single-threaded tokio
//! runtime. The thread reads from the socket and listens on an unbounded
//! channel for outgoing messages, so callers never need a runtime of their own.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;
use crate::transport::{
    join_reader, CloseReason, ConnectionState, EventSink, Lifecycle, Transport, TransportError,
};

/// How long to wait for the peer to drop the socket after its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outgoing command from the caller to the connection thread.
#[derive(Debug)]
enum Outgoing {
    /// Send a UTF-8 text frame.
    Text(String),
    /// Initiate a graceful close.
    Close,
}

/// WebSocket connection exchanging one text frame per message.
pub struct FrameTransport {
    endpoint: Endpoint,
    lifecycle: Arc<Lifecycle>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTransport {
    /// Start connecting to `endpoint` on a background thread.
    pub fn connect(
        endpoint: Endpoint,
        connect_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, TransportError> {
        let lifecycle = Arc::new(Lifecycle::new());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let thread_endpoint = endpoint.clone();
        let thread_lifecycle = Arc::clone(&lifecycle);
        let handle = thread::Builder::new()
            .name(format!("frame-{}", endpoint.authority()))
            .spawn(move || {
                run_thread(
                    &thread_endpoint,
                    &thread_lifecycle,
                    sink.as_ref(),
                    connect_timeout,
                    outgoing_rx,
                );
            })
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            endpoint,
            lifecycle,
            outgoing,
            reader: Mutex::new(Some(handle)),
        })
    }
}

impl Transport for FrameTransport {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        match self.lifecycle.state() {
            ConnectionState::Open => {}
            state if state.is_closing() => return Err(TransportError::Closed),
            state => return Err(TransportError::NotOpen(state)),
        }
        self.outgoing
            .send(Outgoing::Text(text.to_string()))
            .map_err(|_| TransportError::Closed)?;
        debug!("Queued {} bytes for {}", text.len(), self.endpoint);
        Ok(())
    }

    fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        info!("Closing connection to {}", self.endpoint);
        // Thread may already be gone; nothing left to close then.
        let _ = self.outgoing.send(Outgoing::Close);
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn join(&self) {
        join_reader(&self.reader);
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// CONNECTION THREAD
// =============================================================================

fn run_thread(
    endpoint: &Endpoint,
    lifecycle: &Lifecycle,
    sink: &dyn EventSink,
    connect_timeout: Duration,
    outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let reason = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt.block_on(run_connection(
            endpoint,
            lifecycle,
            sink,
            connect_timeout,
            outgoing_rx,
        )),
        Err(e) => {
            error!("Failed to build runtime for {}: {}", endpoint, e);
            if lifecycle.begin_connect() {
                sink.on_error(&TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                });
                Some(CloseReason::new(CloseReason::ABNORMAL, "Connection failed"))
            } else {
                None
            }
        }
    };

    let reason = reason.unwrap_or_else(CloseReason::local);
    if lifecycle.finish() {
        info!("Connection to {} closed: {} {}", endpoint, reason.code, reason.reason);
        sink.on_close(&reason);
    }
}

/// Drive one connection. Returns `None` for a locally initiated close.
async fn run_connection(
    endpoint: &Endpoint,
    lifecycle: &Lifecycle,
    sink: &dyn EventSink,
    connect_timeout: Duration,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) -> Option<CloseReason> {
    if !lifecycle.begin_connect() {
        return None;
    }

    info!("Connecting to {}", endpoint.url);
    let connected = tokio::select! {
        res = tokio::time::timeout(connect_timeout, connect_async(endpoint.url.as_str())) => res,
        () = wait_for_close(&mut outgoing_rx) => return None,
    };

    let ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return Some(connect_failed(endpoint, lifecycle, sink, e.to_string())),
        Err(_elapsed) => {
            return Some(connect_failed(
                endpoint,
                lifecycle,
                sink,
                format!("timed out after {connect_timeout:?}"),
            ))
        }
    };

    if !lifecycle.mark_open() {
        return None;
    }
    info!("Connected to {}", endpoint.url);
    sink.on_open();

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            incoming = read.next() => {
                if lifecycle.is_closing() {
                    return None;
                }
                match incoming {
                    Some(Ok(Message::Text(text))) => sink.on_message(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => sink.on_message(&text),
                        Err(e) => {
                            warn!("Dropping non UTF-8 frame from {}", endpoint);
                            sink.on_error(&TransportError::Decode(format!(
                                "invalid UTF-8 in binary frame: {}",
                                e.utf8_error()
                            )));
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(CloseReason::remote, |f| {
                            CloseReason::new(u16::from(f.code), f.reason.into_owned())
                        });
                        finish_close_handshake(endpoint, &mut read).await;
                        return Some(reason);
                    }
                    // Ping/pong are answered by the library.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", endpoint, e);
                        sink.on_error(&TransportError::WebSocket(e));
                        return Some(CloseReason::error());
                    }
                    None => return Some(CloseReason::remote()),
                }
            }
            command = outgoing_rx.recv() => match command {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        if lifecycle.is_closing() {
                            return None;
                        }
                        error!("Send to {} failed: {}", endpoint, e);
                        sink.on_error(&TransportError::WebSocket(e));
                        return Some(CloseReason::error());
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Close frame to {} not sent: {}", endpoint, e);
                    }
                    return None;
                }
            },
        }
    }
}

fn connect_failed(
    endpoint: &Endpoint,
    lifecycle: &Lifecycle,
    sink: &dyn EventSink,
    reason: String,
) -> CloseReason {
    if lifecycle.is_closing() {
        return CloseReason::local();
    }
    error!("Connect to {} failed: {}", endpoint.url, reason);
    sink.on_error(&TransportError::Connect {
        endpoint: endpoint.url.clone(),
        reason,
    });
    CloseReason::new(CloseReason::ABNORMAL, "Connection failed")
}

/// Keep reading after the peer's close frame so the queued reply is flushed,
/// until the peer drops the connection or the grace period runs out.
async fn finish_close_handshake<S>(endpoint: &Endpoint, read: &mut S)
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = read.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!("{} did not drop the connection after closing", endpoint);
    }
}

/// Resolves once a close is requested or the handle is dropped.
async fn wait_for_close(outgoing_rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(command) = outgoing_rx.recv().await {
        if matches!(command, Outgoing::Close) {
            return;
        }
    }
}
