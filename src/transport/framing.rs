//! NUL-delimited stream framing.
//!
//! The game server speaks UTF-8 text messages each terminated by a single
//! `\x00` byte. There is no length prefix and no escaping, so a payload can
//! never contain NUL.
//!
//! ```text
//! [message bytes ...] 0x00 [message bytes ...] 0x00 [partial ...]
//! ```

use crate::transport::TransportError;

/// Message terminator on the stream transport.
pub const DELIMITER: u8 = 0x00;

/// Append the terminator to an outgoing message.
///
/// A message containing NUL cannot be framed and is rejected.
pub fn encode(text: &str) -> Result<Vec<u8>, TransportError> {
    if let Some(at) = text.bytes().position(|b| b == DELIMITER) {
        return Err(TransportError::Unframeable(format!(
            "NUL byte at offset {at} of {} byte message",
            text.len()
        )));
    }
    let mut buf = Vec::with_capacity(text.len() + 1);
    buf.extend_from_slice(text.as_bytes());
    buf.push(DELIMITER);
    Ok(buf)
}

/// Decode one complete message as UTF-8.
pub fn into_text(bytes: Vec<u8>) -> Result<String, TransportError> {
    String::from_utf8(bytes).map_err(|e| {
        tracing::warn!(
            "Dropping non UTF-8 message: {}",
            hex::encode(&e.as_bytes()[..e.as_bytes().len().min(64)])
        );
        TransportError::Decode(format!("invalid UTF-8 in message: {}", e.utf8_error()))
    })
}

/// Incremental decoder that reassembles messages from arbitrary reads.
///
/// Bytes are buffered raw; UTF-8 is only checked once a message is complete,
/// so multi-byte characters split across reads survive.
#[derive(Debug)]
pub struct NulFramer {
    buf: Vec<u8>,
    max_message_size: usize,
}

impl NulFramer {
    /// Create a framer that refuses to buffer more than `max_message_size`
    /// bytes of an unterminated message.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_message_size,
        }
    }

    /// Feed received bytes and extract every complete message.
    ///
    /// Incomplete trailing data stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        // Everything already buffered is known to be NUL-free.
        let mut search_from = self.buf.len();
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buf[search_from..].iter().position(|&b| b == DELIMITER) {
            let end = search_from + offset;
            messages.push(self.buf[consumed..end].to_vec());
            consumed = end + 1;
            search_from = consumed;
        }
        self.buf.drain(..consumed);
        messages
    }

    /// Fails once the unterminated remainder exceeds the size limit.
    ///
    /// The buffer is discarded on failure; the stream cannot be resynced.
    pub fn check_limit(&mut self) -> Result<(), TransportError> {
        if self.buf.len() > self.max_message_size {
            let len = self.buf.len();
            self.buf.clear();
            return Err(TransportError::Decode(format!(
                "message exceeds {} bytes without terminator ({} buffered)",
                self.max_message_size, len
            )));
        }
        Ok(())
    }

    /// Bytes of the current unterminated message.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Returns true if a partial message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for NulFramer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_MESSAGE_SIZE)
    }
}
