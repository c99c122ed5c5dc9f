//! Raw TCP transport with NUL-terminated framing.
//!
//! Construction returns immediately; a dedicated thread dials the server and
//! then owns the read loop for the lifetime of the connection.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;
use crate::transport::framing::{self, NulFramer};
use crate::transport::{
    join_reader, CloseReason, ConnectionState, EventSink, Lifecycle, Transport, TransportError,
};

/// Size of a single socket read.
const READ_CHUNK: usize = 4096;

/// State shared between the caller's handle and the reader thread.
struct StreamShared {
    lifecycle: Lifecycle,
    /// Handle used for writes.
    writer: Mutex<Option<TcpStream>>,
    /// Separate handle used only to shut the socket down, so `close()` never
    /// waits behind a blocked write.
    control: Mutex<Option<TcpStream>>,
}

impl StreamShared {
    fn shutdown(&self) {
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = control {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("Socket shutdown: {}", e);
            }
        }
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// TCP connection speaking NUL-delimited text messages.
pub struct StreamTransport {
    endpoint: Endpoint,
    shared: Arc<StreamShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Start connecting to `endpoint` on a background thread.
    ///
    /// Events are reported into `sink` from that thread. Fails only if the
    /// thread cannot be spawned.
    pub fn connect(
        endpoint: Endpoint,
        connect_timeout: Duration,
        max_message_size: usize,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, TransportError> {
        let shared = Arc::new(StreamShared {
            lifecycle: Lifecycle::new(),
            writer: Mutex::new(None),
            control: Mutex::new(None),
        });

        let thread_endpoint = endpoint.clone();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("stream-{}", endpoint.authority()))
            .spawn(move || {
                run_reader(
                    &thread_endpoint,
                    &thread_shared,
                    sink.as_ref(),
                    connect_timeout,
                    max_message_size,
                );
            })
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            endpoint,
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Block until the connection thread exits.
    ///
    /// Compatibility shim for embedding code that wants to park on the
    /// connection's lifetime.
    pub fn run_forever(&self) {
        self.join();
    }
}

impl Transport for StreamTransport {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        match self.shared.lifecycle.state() {
            ConnectionState::Open => {}
            state if state.is_closing() => return Err(TransportError::Closed),
            state => return Err(TransportError::NotOpen(state)),
        }

        let bytes = framing::encode(text)?;
        let mut writer = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let socket = writer.as_mut().ok_or(TransportError::Closed)?;
        socket.write_all(&bytes).map_err(TransportError::Write)?;
        debug!("Sent {} bytes to {}", bytes.len(), self.endpoint);
        Ok(())
    }

    fn close(&self) {
        // Flag first, so the reader treats the socket error as ours.
        if !self.shared.lifecycle.begin_close() {
            return;
        }
        info!("Closing connection to {}", self.endpoint);
        self.shared.shutdown();
    }

    fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    fn join(&self) {
        join_reader(&self.reader);
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// READER THREAD
// =============================================================================

fn run_reader(
    endpoint: &Endpoint,
    shared: &StreamShared,
    sink: &dyn EventSink,
    connect_timeout: Duration,
    max_message_size: usize,
) {
    let reason = match open_socket(endpoint, shared, sink, connect_timeout) {
        Some(socket) => read_loop(endpoint, shared, sink, socket, max_message_size),
        None => None,
    };

    shared.shutdown();
    let reason = reason.unwrap_or_else(CloseReason::local);
    if shared.lifecycle.finish() {
        info!("Connection to {} closed: {} {}", endpoint, reason.code, reason.reason);
        sink.on_close(&reason);
    }
}

/// Dial and install the socket. `None` means the connection never opened;
/// every event that failure needs except `on_close` has been reported.
fn open_socket(
    endpoint: &Endpoint,
    shared: &StreamShared,
    sink: &dyn EventSink,
    connect_timeout: Duration,
) -> Option<TcpStream> {
    if !shared.lifecycle.begin_connect() {
        return None;
    }

    info!("Connecting to {}", endpoint);
    let socket = match dial(endpoint, connect_timeout).and_then(|s| {
        let writer = s.try_clone()?;
        let control = s.try_clone()?;
        Ok((s, writer, control))
    }) {
        Ok(parts) => parts,
        Err(e) => {
            if shared.lifecycle.is_closing() {
                return None;
            }
            error!("Connect to {} failed: {}", endpoint, e);
            sink.on_error(&TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            });
            if shared.lifecycle.finish() {
                sink.on_close(&CloseReason::new(CloseReason::ABNORMAL, "Connection failed"));
            }
            return None;
        }
    };
    let (socket, writer, control) = socket;

    {
        // Install under the control lock so a concurrent close() either sees
        // the socket or we see its flag.
        let mut slot = shared.control.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.lifecycle.is_closing() {
            let _ = control.shutdown(Shutdown::Both);
            return None;
        }
        *slot = Some(control);
        *shared.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
    }

    if !shared.lifecycle.mark_open() {
        return None;
    }
    info!("Connected to {}", endpoint);
    sink.on_open();
    Some(socket)
}

fn read_loop(
    endpoint: &Endpoint,
    shared: &StreamShared,
    sink: &dyn EventSink,
    mut socket: TcpStream,
    max_message_size: usize,
) -> Option<CloseReason> {
    let mut framer = NulFramer::new(max_message_size);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if shared.lifecycle.is_closing() {
            return None;
        }

        let n = match socket.read(&mut chunk) {
            Ok(0) => {
                if shared.lifecycle.is_closing() {
                    return None;
                }
                if framer.has_partial() {
                    warn!(
                        "{} closed with {} unterminated bytes buffered",
                        endpoint,
                        framer.pending().len()
                    );
                }
                return Some(CloseReason::remote());
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if shared.lifecycle.is_closing() {
                    return None;
                }
                error!("Read from {} failed: {}", endpoint, e);
                sink.on_error(&TransportError::Read(e));
                return Some(CloseReason::error());
            }
        };

        for raw in framer.feed(&chunk[..n]) {
            if shared.lifecycle.is_closing() {
                return None;
            }
            match framing::into_text(raw) {
                Ok(text) => sink.on_message(&text),
                Err(e) => sink.on_error(&e),
            }
        }

        if let Err(e) = framer.check_limit() {
            if shared.lifecycle.is_closing() {
                return None;
            }
            error!("{}: {}", endpoint, e);
            sink.on_error(&e);
            return Some(CloseReason::new(CloseReason::TOO_BIG, "Message too big"));
        }
    }
}

fn dial(endpoint: &Endpoint, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in endpoint.authority().to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => {
                socket.set_nodelay(true)?;
                return Ok(socket);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            ErrorKind::NotFound,
            format!("{} resolved to no addresses", endpoint.host),
        )
    }))
}
