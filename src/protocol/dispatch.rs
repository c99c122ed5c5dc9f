//! Inbound dispatch and response correlation.
//!
//! The [`Dispatcher`] is the connection's [`EventSink`]: the transport thread
//! feeds it every event, and it either hands a decoded response to the
//! oldest waiter registered for that code or just forwards to the user's
//! callbacks. Every message reaches `on_message`, matched or not.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::protocol::callbacks::Callbacks;
use crate::protocol::message::{Inbound, Response};
use crate::protocol::ProtocolError;
use crate::transport::{CloseReason, EventSink, TransportError};

/// What a waiter receives.
#[derive(Debug)]
enum Reply {
    Response(Response),
    Closed,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: SyncSender<Reply>,
}

/// Outstanding waits, keyed by command code, oldest first.
#[derive(Debug, Default)]
struct PendingTable {
    next_id: u64,
    closed: bool,
    waiters: BTreeMap<String, VecDeque<Waiter>>,
}

/// Whether the connection has opened yet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenState {
    Pending,
    Open,
    /// Closed without ever opening.
    Failed(CloseReason),
    /// Opened, then closed.
    Closed,
}

/// Connection-scoped protocol state shared with the transport thread.
#[derive(Debug)]
pub struct Dispatcher {
    callbacks: Callbacks,
    pending: Mutex<PendingTable>,
    open: Mutex<OpenState>,
    open_changed: Condvar,
}

impl Dispatcher {
    /// Create a dispatcher that forwards to `callbacks`.
    pub fn new(callbacks: Callbacks) -> Self {
        Self {
            callbacks,
            pending: Mutex::new(PendingTable::default()),
            open: Mutex::new(OpenState::Pending),
            open_changed: Condvar::new(),
        }
    }

    /// Register interest in the next response with `code`.
    ///
    /// Only responses dispatched after this call can fulfil it.
    pub fn register(self: &Arc<Self>, code: &str) -> Result<PendingResponse, ProtocolError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut table = self.lock_pending();
        if table.closed {
            return Err(ProtocolError::ConnectionClosed {
                waiting_for: code.to_string(),
            });
        }
        let id = table.next_id;
        table.next_id += 1;
        table
            .waiters
            .entry(code.to_string())
            .or_default()
            .push_back(Waiter { id, tx });
        trace!("Registered waiter {} for {}", id, code);

        Ok(PendingResponse {
            dispatcher: Arc::clone(self),
            code: code.to_string(),
            id,
            rx,
        })
    }

    /// Decode one inbound message and route it.
    ///
    /// Decode failures go to `on_error`; nothing here can fail the caller.
    pub fn dispatch(&self, text: &str) {
        match Inbound::decode(text) {
            Ok(Inbound::Response(response)) => {
                debug!("Received {} (status {})", response.code, response.status);
                self.fulfill(response);
            }
            Ok(Inbound::Raw(_)) => {
                debug!("Received raw message ({} bytes)", text.len());
            }
            Err(e) => {
                warn!("Undecodable message: {}", e);
                self.callbacks
                    .error(&TransportError::Decode(format!("{e}: {}", preview(text))));
                return;
            }
        }
        self.callbacks.message(text);
    }

    /// Fail every outstanding wait and refuse new ones.
    pub fn close_all(&self) {
        let mut table = self.lock_pending();
        table.closed = true;
        let waiters = std::mem::take(&mut table.waiters);
        for waiter in waiters.into_values().flatten() {
            // Receiver gone means the caller already gave up.
            let _ = waiter.tx.try_send(Reply::Closed);
        }
    }

    /// Number of outstanding waits for `code`.
    pub fn pending_count(&self, code: &str) -> usize {
        self.lock_pending()
            .waiters
            .get(code)
            .map_or(0, VecDeque::len)
    }

    /// Block until the connection opens, fails, or `timeout` elapses.
    pub fn wait_until_open(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let guard = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .open_changed
            .wait_timeout_while(guard, timeout, |s| *s == OpenState::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            OpenState::Open => Ok(()),
            OpenState::Failed(reason) => Err(ProtocolError::OpenFailed(reason.clone())),
            OpenState::Closed => Err(ProtocolError::ConnectionClosed {
                waiting_for: "connection open".to_string(),
            }),
            OpenState::Pending => Err(ProtocolError::Timeout {
                waiting_for: "connection open".to_string(),
                timeout,
            }),
        }
    }

    pub(crate) fn notify_send(&self, text: &str) {
        self.callbacks.sent(text);
    }

    fn fulfill(&self, response: Response) {
        let code = response.code.clone();
        let mut table = self.lock_pending();
        let Some(queue) = table.waiters.get_mut(&code) else {
            return;
        };

        let mut reply = Reply::Response(response);
        while let Some(waiter) = queue.pop_front() {
            match waiter.tx.try_send(reply) {
                Ok(()) => {
                    trace!("Fulfilled waiter {} for {}", waiter.id, code);
                    break;
                }
                // Abandoned waiter; offer the response to the next one.
                Err(TrySendError::Disconnected(r) | TrySendError::Full(r)) => reply = r,
            }
        }

        if queue.is_empty() {
            table.waiters.remove(&code);
        }
    }

    fn remove(&self, code: &str, id: u64) -> bool {
        let mut table = self.lock_pending();
        let Some(queue) = table.waiters.get_mut(code) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            table.waiters.remove(code);
        }
        removed
    }

    fn mark_open(&self) {
        let mut state = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == OpenState::Pending {
            *state = OpenState::Open;
        }
        self.open_changed.notify_all();
    }

    fn mark_closed(&self, reason: &CloseReason) {
        let mut state = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match &*state {
            OpenState::Pending => OpenState::Failed(reason.clone()),
            OpenState::Open => OpenState::Closed,
            finished => finished.clone(),
        };
        *state = next;
        self.open_changed.notify_all();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for Dispatcher {
    fn on_open(&self) {
        self.mark_open();
        self.callbacks.opened();
    }

    fn on_message(&self, text: &str) {
        self.dispatch(text);
    }

    fn on_error(&self, error: &TransportError) {
        self.callbacks.error(error);
    }

    fn on_close(&self, reason: &CloseReason) {
        self.close_all();
        self.mark_closed(reason);
        self.callbacks.closed(reason);
    }
}

/// A registered wait for one response.
///
/// Dropping it without waiting withdraws the registration.
#[derive(Debug)]
pub struct PendingResponse {
    dispatcher: Arc<Dispatcher>,
    code: String,
    id: u64,
    rx: mpsc::Receiver<Reply>,
}

impl PendingResponse {
    /// Command code being awaited.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Block until the response arrives, the connection closes, or `timeout`.
    pub fn wait(self, timeout: Duration) -> Result<Response, ProtocolError> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => self.into_result(reply),
            Err(RecvTimeoutError::Disconnected) => self.into_result(Reply::Closed),
            Err(RecvTimeoutError::Timeout) => {
                if !self.dispatcher.remove(&self.code, self.id) {
                    // Fulfilled between the timeout and the removal.
                    if let Ok(reply) = self.rx.try_recv() {
                        return self.into_result(reply);
                    }
                }
                debug!("Timed out waiting for {}", self.code);
                Err(ProtocolError::Timeout {
                    waiting_for: self.code.clone(),
                    timeout,
                })
            }
        }
    }

    fn into_result(&self, reply: Reply) -> Result<Response, ProtocolError> {
        match reply {
            Reply::Response(response) => Ok(response),
            Reply::Closed => Err(ProtocolError::ConnectionClosed {
                waiting_for: self.code.clone(),
            }),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.dispatcher.remove(&self.code, self.id);
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(80)
        .map_or(text.len(), |(i, _)| i);
    &text[..end]
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Callbacks::new()))
    }

    #[test]
    fn test_registered_wait_receives_response() {
        let d = dispatcher();
        let pending = d.register("gbd").unwrap();
        d.dispatch(r#"%xt%gbd%1%0%{"gpi":{"UID":7}}%"#);
        let resp = pending.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(resp.code, "gbd");
        assert_eq!(resp.data, json!({"gpi": {"UID": 7}}));
        assert_eq!(d.pending_count("gbd"), 0);
    }

    #[test]
    fn test_other_codes_do_not_fulfil() {
        let d = dispatcher();
        let pending = d.register("cra").unwrap();
        d.dispatch("%xt%gbd%1%0%{}%");
        assert!(matches!(
            pending.wait(Duration::from_millis(20)),
            Err(ProtocolError::Timeout { .. })
        ));
    }

    #[test]
    fn test_no_replay_of_earlier_traffic() {
        let d = dispatcher();
        d.dispatch("%xt%cra%1%0%{}%");
        let pending = d.register("cra").unwrap();
        assert!(pending.wait(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_timeout_leaves_no_registration() {
        let d = dispatcher();
        let pending = d.register("cra").unwrap();
        assert!(matches!(
            pending.wait(Duration::from_millis(10)),
            Err(ProtocolError::Timeout { .. })
        ));
        assert_eq!(d.pending_count("cra"), 0);

        // A later response must reach a fresh wait, not the stale one.
        let fresh = d.register("cra").unwrap();
        d.dispatch(r#"%xt%cra%1%0%{"n":2}%"#);
        assert_eq!(fresh.wait(Duration::from_secs(1)).unwrap().data, json!({"n": 2}));
    }

    #[test]
    fn test_same_code_fulfilled_in_arrival_order() {
        let d = dispatcher();
        let first = d.register("cra").unwrap();
        let second = d.register("cra").unwrap();
        d.dispatch(r#"%xt%cra%1%0%{"n":1}%"#);
        d.dispatch(r#"%xt%cra%1%0%{"n":2}%"#);
        assert_eq!(first.wait(Duration::from_secs(1)).unwrap().data, json!({"n": 1}));
        assert_eq!(second.wait(Duration::from_secs(1)).unwrap().data, json!({"n": 2}));
    }

    #[test]
    fn test_one_response_fulfils_one_waiter() {
        let d = dispatcher();
        let first = d.register("cra").unwrap();
        let second = d.register("cra").unwrap();
        d.dispatch("%xt%cra%1%0%{}%");
        assert!(first.wait(Duration::from_secs(1)).is_ok());
        assert!(second.wait(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_dropped_wait_is_skipped() {
        let d = dispatcher();
        let abandoned = d.register("cra").unwrap();
        let live = d.register("cra").unwrap();
        drop(abandoned);
        d.dispatch("%xt%cra%1%0%{}%");
        assert!(live.wait(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_close_unblocks_waiter() {
        let d = dispatcher();
        let pending = d.register("cra").unwrap();
        let closer = Arc::clone(&d);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.on_close(&CloseReason::remote());
        });
        let result = pending.wait(Duration::from_secs(5));
        handle.join().unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed { .. })));
    }

    #[test]
    fn test_register_after_close_fails() {
        let d = dispatcher();
        d.close_all();
        assert!(matches!(
            d.register("cra"),
            Err(ProtocolError::ConnectionClosed { .. })
        ));
    }

    #[test]
    fn test_every_message_reaches_on_message() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let d = Arc::new(Dispatcher::new(
            Callbacks::new().on_message(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        let pending = d.register("cra").unwrap();
        d.dispatch("%xt%cra%1%0%{}%");
        d.dispatch("%xt%cra%1%0%{}%");
        d.dispatch("<policy/>");
        assert!(pending.wait(Duration::from_secs(1)).is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_decode_failure_goes_to_on_error() {
        let errors = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(AtomicUsize::new(0));
        let (e, m) = (Arc::clone(&errors), Arc::clone(&messages));
        let d = Dispatcher::new(
            Callbacks::new()
                .on_error(move |err| {
                    assert!(matches!(err, TransportError::Decode(_)));
                    e.fetch_add(1, Ordering::SeqCst);
                })
                .on_message(move |_| {
                    m.fetch_add(1, Ordering::SeqCst);
                }),
        );
        d.dispatch("%xt%cra%1%zero%{}%");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_until_open() {
        let d = dispatcher();
        assert!(matches!(
            d.wait_until_open(Duration::from_millis(10)),
            Err(ProtocolError::Timeout { .. })
        ));
        d.on_open();
        assert!(d.wait_until_open(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_wait_until_open_reports_failure() {
        let d = dispatcher();
        d.on_close(&CloseReason::new(CloseReason::ABNORMAL, "Connection failed"));
        match d.wait_until_open(Duration::from_secs(1)) {
            Err(ProtocolError::OpenFailed(reason)) => assert_eq!(reason.code, 1006),
            other => panic!("expected OpenFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_wait_until_open_after_normal_close() {
        let d = dispatcher();
        d.on_open();
        d.on_close(&CloseReason::local());
        match d.wait_until_open(Duration::from_secs(1)) {
            Err(ProtocolError::ConnectionClosed { waiting_for }) => {
                assert_eq!(waiting_for, "connection open");
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
}
