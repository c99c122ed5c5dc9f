//! Synchronous command API.
//!
//! [`Client`] pairs one transport with one [`Dispatcher`]. Its methods are
//! called from the caller's thread; the only blocking calls are the waits.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ClientConfig;
use crate::protocol::callbacks::Callbacks;
use crate::protocol::dispatch::{Dispatcher, PendingResponse};
use crate::protocol::message::{Command, Response};
use crate::protocol::{raise_for_status, ProtocolError};
use crate::transport::{self, ConnectionState, Transport, TransportError};

/// A connection to a game server.
pub struct Client {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    transport: Box<dyn Transport>,
}

impl Client {
    /// Start connecting with the transport `config` selects.
    ///
    /// Returns before the connection is open; use [`Client::wait_until_open`]
    /// or the `on_open` callback before sending.
    pub fn connect(config: ClientConfig, callbacks: Callbacks) -> Result<Self, ProtocolError> {
        let dispatcher = Arc::new(Dispatcher::new(callbacks));
        let sink: Arc<dyn transport::EventSink> = dispatcher.clone();
        let transport = transport::connect(&config, sink)?;
        Ok(Self::from_parts(config, dispatcher, transport))
    }

    /// Assemble a client around an already started transport.
    ///
    /// `transport` must report its events into `dispatcher`.
    pub fn from_parts(
        config: ClientConfig,
        dispatcher: Arc<Dispatcher>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            transport,
        }
    }

    /// Send a command whose parameter is `payload` as JSON.
    pub fn send_json_command(&self, code: &str, payload: &Value) -> Result<(), ProtocolError> {
        let command = Command::json(&self.config.zone, code, payload)?;
        self.send_command(&command)
    }

    /// Send a command with pre-encoded parameters.
    pub fn send_raw_command<S: AsRef<str>>(
        &self,
        code: &str,
        params: &[S],
    ) -> Result<(), ProtocolError> {
        let command = Command::raw(&self.config.zone, code, params)?;
        self.send_command(&command)
    }

    /// Block until the next response with `code` dispatched after this call.
    ///
    /// `None` uses the configured response timeout.
    pub fn wait_for_json_response(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<Response, ProtocolError> {
        self.expect_response(code)?.wait(self.timeout(timeout))
    }

    /// Register a wait now and collect it later.
    ///
    /// Register before sending to avoid missing a fast reply.
    pub fn expect_response(&self, code: &str) -> Result<PendingResponse, ProtocolError> {
        self.dispatcher.register(code)
    }

    /// Send a JSON command and wait for its response.
    ///
    /// The wait is registered before the send, so a reply cannot slip past.
    pub fn request(
        &self,
        code: &str,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<Response, ProtocolError> {
        let pending = self.expect_response(code)?;
        self.send_json_command(code, payload)?;
        pending.wait(self.timeout(timeout))
    }

    /// Fail if the server reported an error in `response`.
    pub fn raise_for_status(&self, response: &Response) -> Result<(), ProtocolError> {
        raise_for_status(response)
    }

    /// Block until the connection opens, fails, or `timeout` elapses.
    pub fn wait_until_open(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.dispatcher.wait_until_open(timeout)
    }

    /// Close the connection and fail all outstanding waits. Idempotent.
    pub fn close(&self) {
        self.transport.close();
        self.dispatcher.close_all();
    }

    /// Block until the connection thread exits.
    pub fn run_forever(&self) {
        self.transport.join();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared protocol state.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// `on_send` only sees commands handed to an open transport.
    fn send_command(&self, command: &Command) -> Result<(), ProtocolError> {
        match self.transport.state() {
            ConnectionState::Open => {}
            state if state.is_closing() => return Err(TransportError::Closed.into()),
            state => return Err(TransportError::NotOpen(state).into()),
        }
        let text = command.encode();
        self.dispatcher.notify_send(&text);
        self.transport.send(&text)?;
        debug!("Sent {} to {}", command.code, self.transport.endpoint());
        Ok(())
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.response_timeout)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.transport.endpoint().to_string())
            .field("zone", &self.config.zone)
            .field("state", &self.transport.state())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::transport::{CloseReason, EventSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::thread;

    /// In-memory transport: records sends and lets the test play the server.
    struct LoopbackTransport {
        endpoint: Endpoint,
        sink: Arc<Dispatcher>,
        sent: Mutex<Vec<String>>,
        state: Mutex<ConnectionState>,
    }

    impl LoopbackTransport {
        fn server_says(&self, text: &str) {
            self.sink.on_message(text);
        }
    }

    impl Transport for LoopbackTransport {
        fn send(&self, text: &str) -> Result<(), TransportError> {
            match self.state() {
                ConnectionState::Open => {}
                ConnectionState::Closed => return Err(TransportError::Closed),
                state => return Err(TransportError::NotOpen(state)),
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn close(&self) {
            let previous = std::mem::replace(
                &mut *self.state.lock().unwrap(),
                ConnectionState::Closed,
            );
            if previous != ConnectionState::Closed {
                self.sink.on_close(&CloseReason::local());
            }
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn join(&self) {}

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
    }

    fn client_with(callbacks: Callbacks) -> (Client, Arc<LoopbackTransport>) {
        let dispatcher = Arc::new(Dispatcher::new(callbacks));
        let transport = Arc::new(LoopbackTransport {
            endpoint: Endpoint::parse("tcp://127.0.0.1:1").unwrap(),
            sink: Arc::clone(&dispatcher),
            sent: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Open),
        });
        let config = ClientConfig::new("tcp://127.0.0.1:1", "EmpireEx_2");
        let shared = Box::new(SharedTransport(Arc::clone(&transport)));
        let client = Client::from_parts(config, dispatcher, shared);
        (client, transport)
    }

    /// Lets the test keep a handle on the transport the client owns.
    struct SharedTransport(Arc<LoopbackTransport>);

    impl Transport for SharedTransport {
        fn send(&self, text: &str) -> Result<(), TransportError> {
            self.0.send(text)
        }
        fn close(&self) {
            self.0.close();
        }
        fn state(&self) -> ConnectionState {
            self.0.state()
        }
        fn join(&self) {}
        fn endpoint(&self) -> &Endpoint {
            self.0.endpoint()
        }
    }

    #[test]
    fn test_send_json_command_wire_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_send = Arc::clone(&seen);
        let (client, transport) = client_with(
            Callbacks::new().on_send(move |t| on_send.lock().unwrap().push(t.to_string())),
        );

        client.send_json_command("gbd", &json!({"KID": 1})).unwrap();

        let expected = r#"%xt%EmpireEx_2%gbd%1%{"KID":1}%"#;
        assert_eq!(transport.sent.lock().unwrap().as_slice(), [expected]);
        assert_eq!(seen.lock().unwrap().as_slice(), [expected]);
    }

    #[test]
    fn test_send_after_close_fails_fast() {
        let sent = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sent);
        let (client, transport) =
            client_with(Callbacks::new().on_send(move |_| flag.store(true, Ordering::SeqCst)));
        client.close();
        let err = client.send_json_command("cra", &json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(TransportError::Closed)));
        assert!(!sent.load(Ordering::SeqCst));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_before_open_is_not_reported() {
        let sent = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sent);
        let (client, transport) =
            client_with(Callbacks::new().on_send(move |_| flag.store(true, Ordering::SeqCst)));
        *transport.state.lock().unwrap() = ConnectionState::Connecting;

        let err = client.send_json_command("gbd", &json!({})).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Transport(TransportError::NotOpen(ConnectionState::Connecting))
        ));
        assert!(!sent.load(Ordering::SeqCst));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_raw_command_with_nul_never_reaches_wire() {
        let (client, transport) = client_with(Callbacks::new());
        let err = client
            .send_raw_command("abc", &["x\0%xt%EmpireEx_2%evil%1%{}%"])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Message(_)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wait_for_json_response() {
        let (client, transport) = client_with(Callbacks::new());
        let server = Arc::clone(&transport);
        let handle = thread::spawn(move || {
            // Give the caller time to register.
            thread::sleep(Duration::from_millis(50));
            server.server_says(r#"%xt%cra%1%0%{"AAM":{"M":{"MID":9}}}%"#);
        });
        let resp = client
            .wait_for_json_response("cra", Some(Duration::from_secs(5)))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(resp.data["AAM"]["M"]["MID"], 9);
        assert!(client.raise_for_status(&resp).is_ok());
    }

    #[test]
    fn test_wait_times_out_with_default() {
        let (mut client, _transport) = client_with(Callbacks::new());
        client.config.response_timeout = Duration::from_millis(20);
        let err = client.wait_for_json_response("cra", None).unwrap_err();
        assert!(
            matches!(err, ProtocolError::Timeout { ref waiting_for, .. } if waiting_for == "cra")
        );
        assert_eq!(client.dispatcher().pending_count("cra"), 0);
    }

    #[test]
    fn test_request_registers_before_send() {
        let (client, transport) = client_with(Callbacks::new());
        let pending = client.expect_response("cra").unwrap();
        client.send_json_command("cra", &json!({"SX": 1})).unwrap();
        // Reply arrives before anyone is blocked in wait.
        transport.server_says("%xt%cra%1%0%{}%");
        assert!(pending.wait(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_remote_error_surfaces() {
        let (client, transport) = client_with(Callbacks::new());
        let pending = client.expect_response("cra").unwrap();
        transport.server_says("%xt%cra%1%95%%");
        let resp = pending.wait(Duration::from_secs(1)).unwrap();
        let err = client.raise_for_status(&resp).unwrap_err();
        assert_eq!(err.remote_status(), Some(95));
    }

    #[test]
    fn test_close_unblocks_wait() {
        let (client, _transport) = client_with(Callbacks::new());
        let client = Arc::new(client);
        let closer = Arc::clone(&client);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        let err = client
            .wait_for_json_response("cra", Some(Duration::from_secs(10)))
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, ProtocolError::ConnectionClosed { .. }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let closes = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&closes);
        let (client, _transport) =
            client_with(Callbacks::new().on_close(move |_| *counter.lock().unwrap() += 1));
        client.close();
        client.close();
        assert_eq!(*closes.lock().unwrap(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
