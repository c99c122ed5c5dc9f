//! # Empire Client
//!
//! Command/response client for Goodgame Empire style game servers, over a
//! raw TCP stream or a WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EMPIRE CLIENT                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Endpoint parsing, timeouts, env config    │
//! │                                                              │
//! │  transport/      - Connection threads (one per client)       │
//! │  ├── framing.rs  - NUL-delimited message framing             │
//! │  ├── stream.rs   - TCP stream transport                      │
//! │  └── frame.rs    - WebSocket frame transport                 │
//! │                                                              │
//! │  protocol/       - Transport-independent core                │
//! │  ├── message.rs  - %xt% command / response encoding          │
//! │  ├── dispatch.rs - Inbound routing, response correlation     │
//! │  ├── callbacks.rs- User event handlers                       │
//! │  └── client.rs   - Blocking send / wait API                  │
//! │                                                              │
//! │  commands/       - Payload builders for game commands        │
//! │  └── attack.rs   - Attack (cra)                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Each connection owns one background thread that reads from the socket
//! and invokes callbacks. Callers send from their own thread and block in
//! [`Client::wait_for_json_response`] until the connection thread hands
//! them a matching response, the connection closes, or the timeout expires.
//!
//! ## Example
//!
//! ```no_run
//! use empire_client::{Callbacks, Client, ClientConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), empire_client::ProtocolError> {
//! let config = ClientConfig::new("wss://ep-live-de1-game.goodgamestudios.com", "EmpireEx_2");
//! let client = Client::connect(config, Callbacks::new())?;
//! client.wait_until_open(Duration::from_secs(10))?;
//!
//! let response = client.request("gbd", &json!({}), None)?;
//! client.raise_for_status(&response)?;
//! client.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod commands;
pub mod config;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use config::{ClientConfig, ConfigError, Endpoint, TransportKind};
pub use protocol::{
    raise_for_status, Callbacks, Client, Command, PendingResponse, ProtocolError, Response,
};
pub use transport::{CloseReason, ConnectionState, Transport, TransportError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
