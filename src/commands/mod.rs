//! Command Builders
//!
//! Thin wrappers that assemble a command payload and run it through the
//! client's send / wait / raise-for-status sequence. Game rules are the
//! server's business; nothing here validates them.

pub mod attack;

use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::protocol::{raise_for_status, Client, ProtocolError, Response};

pub use attack::{send_attack, Attack, ATTACK_CODE};

/// How a command is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Wait for the response and check its status.
    pub sync: bool,
    /// Turn every failure into [`Outcome::Failed`] instead of an error.
    pub quiet: bool,
    /// Response timeout; `None` uses the client default.
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            sync: true,
            quiet: false,
            timeout: None,
        }
    }
}

impl SendOptions {
    /// Fire and forget.
    pub fn fire_and_forget() -> Self {
        Self {
            sync: false,
            ..Self::default()
        }
    }

    /// Same options, but failures are swallowed.
    pub fn quiet(self) -> Self {
        Self {
            quiet: true,
            ..self
        }
    }
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Synchronous run: the successful response.
    Response(Response),
    /// Asynchronous run: the command was written.
    Sent,
    /// Quiet run that failed.
    Failed,
}

impl Outcome {
    /// Anything but [`Outcome::Failed`].
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// The response of a synchronous run.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// Send `code` with `payload` according to `options`.
pub fn execute(
    client: &Client,
    code: &str,
    payload: &Value,
    options: SendOptions,
) -> Result<Outcome, ProtocolError> {
    match run(client, code, payload, options) {
        Err(e) if options.quiet => {
            warn!("{} failed quietly: {}", code, e);
            Ok(Outcome::Failed)
        }
        other => other,
    }
}

fn run(
    client: &Client,
    code: &str,
    payload: &Value,
    options: SendOptions,
) -> Result<Outcome, ProtocolError> {
    if !options.sync {
        client.send_json_command(code, payload)?;
        return Ok(Outcome::Sent);
    }
    let response = client.request(code, payload, options.timeout)?;
    raise_for_status(&response)?;
    Ok(Outcome::Response(response))
}
