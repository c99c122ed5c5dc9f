//! Command Messages
//!
//! Text encoding of the `%xt%` protocol. Requests and responses carry the
//! same fields in a different order:
//!
//! ```text
//! client -> server   %xt%{zone}%{code}%1%{params}%
//! server -> client   %xt%{code}%1%{status}%{json}%
//! ```
//!
//! `params` is one JSON document for JSON commands, or several raw values
//! joined by `%`. The JSON document may itself contain `%`, so the last field
//! always runs to the trailing separator. Anything that does not start with
//! `%xt%` is a raw server line and is never correlated.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Prefix of every extension message.
pub const XT_PREFIX: &str = "%xt%";

/// Field separator.
pub const SEPARATOR: char = '%';

/// Request id field. The server does not use it for correlation.
const REQUEST_ID: &str = "1";

/// Errors from decoding a message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Not an `%xt%` message.
    #[error("not an xt message")]
    NotExtension,

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// Status is not an integer.
    #[error("invalid status `{0}`")]
    InvalidStatus(String),

    /// Payload is not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A field contains a character the wire format cannot carry.
    #[error("{field} may not contain {found:?}: {value:?}")]
    Unrepresentable {
        /// Which field.
        field: &'static str,
        /// The offending character.
        found: char,
        /// The rejected value.
        value: String,
    },
}

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// An outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Server header, e.g. `EmpireEx_2`.
    pub zone: String,
    /// Command code, e.g. `cra`.
    pub code: String,
    /// Encoded parameters (a JSON document, or raw values joined by `%`).
    pub params: String,
}

impl Command {
    /// A command whose single parameter is `payload` as JSON.
    ///
    /// JSON escapes control characters, so only `zone` and `code` are checked.
    pub fn json(zone: &str, code: &str, payload: &Value) -> Result<Self, MessageError> {
        check_header(zone, code)?;
        Ok(Self {
            zone: zone.to_string(),
            code: code.to_string(),
            params: serde_json::to_string(payload)?,
        })
    }

    /// A command with pre-encoded parameters.
    ///
    /// Parameters may contain `%` (it is the parameter separator anyway) but
    /// never NUL, which terminates a message on the stream transport.
    pub fn raw<S: AsRef<str>>(zone: &str, code: &str, params: &[S]) -> Result<Self, MessageError> {
        check_header(zone, code)?;
        let params = params
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("%");
        reject("params", &params, &['\0'])?;
        Ok(Self {
            zone: zone.to_string(),
            code: code.to_string(),
            params,
        })
    }

    /// Wire text, without transport framing.
    pub fn encode(&self) -> String {
        format!(
            "{XT_PREFIX}{}{SEPARATOR}{}{SEPARATOR}{REQUEST_ID}{SEPARATOR}{}{SEPARATOR}",
            self.zone, self.code, self.params
        )
    }

    /// Parse wire text produced by [`Command::encode`].
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let body = strip_envelope(text)?;
        let mut fields = body.splitn(4, SEPARATOR);
        let zone = required(fields.next(), "zone")?;
        let code = required(fields.next(), "code")?;
        fields.next().ok_or(MessageError::MissingField("request id"))?;
        let params = fields.next().unwrap_or_default();
        Ok(Self {
            zone: zone.to_string(),
            code: code.to_string(),
            params: params.to_string(),
        })
    }

    /// Parameters parsed as one JSON document.
    pub fn json_params(&self) -> Result<Value, MessageError> {
        Ok(serde_json::from_str(&self.params)?)
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// A decoded command response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Command code this answers.
    pub code: String,
    /// Server status, `0` on success.
    pub status: i64,
    /// JSON payload; `Null` when the server sent none.
    pub data: Value,
}

impl Response {
    /// Build a response.
    pub fn new(code: impl Into<String>, status: i64, data: Value) -> Self {
        Self {
            code: code.into(),
            status,
            data,
        }
    }

    /// Server reported a failure.
    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// Wire text, without transport framing.
    pub fn encode(&self) -> String {
        let data = if self.data.is_null() {
            String::new()
        } else {
            self.data.to_string()
        };
        format!(
            "{XT_PREFIX}{}{SEPARATOR}{REQUEST_ID}{SEPARATOR}{}{SEPARATOR}{data}{SEPARATOR}",
            self.code, self.status
        )
    }

    /// Parse wire text produced by [`Response::encode`].
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let body = strip_envelope(text)?;
        let mut fields = body.splitn(4, SEPARATOR);
        let code = required(fields.next(), "code")?;
        fields.next().ok_or(MessageError::MissingField("request id"))?;
        let status = required(fields.next(), "status")?;
        let status = status
            .parse::<i64>()
            .map_err(|_| MessageError::InvalidStatus(status.to_string()))?;
        let data = match fields.next() {
            None | Some("") => Value::Null,
            Some(json) => serde_json::from_str(json)?,
        };
        Ok(Self {
            code: code.to_string(),
            status,
            data,
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {}): {}", self.code, self.status, self.data)
    }
}

/// Any inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An `%xt%` response.
    Response(Response),
    /// A non-extension line (policy files, XML handshakes, ...).
    Raw(String),
}

impl Inbound {
    /// Decode one inbound message.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        if text.starts_with(XT_PREFIX) {
            Response::decode(text).map(Self::Response)
        } else {
            Ok(Self::Raw(text.to_string()))
        }
    }
}

fn check_header(zone: &str, code: &str) -> Result<(), MessageError> {
    reject("zone", zone, &[SEPARATOR, '\0'])?;
    reject("code", code, &[SEPARATOR, '\0'])
}

fn reject(field: &'static str, value: &str, forbidden: &[char]) -> Result<(), MessageError> {
    match value.chars().find(|c| forbidden.contains(c)) {
        Some(found) => Err(MessageError::Unrepresentable {
            field,
            found,
            value: value.to_string(),
        }),
        None => Ok(()),
    }
}

fn strip_envelope(text: &str) -> Result<&str, MessageError> {
    let body = text
        .strip_prefix(XT_PREFIX)
        .ok_or(MessageError::NotExtension)?;
    Ok(body.strip_suffix(SEPARATOR).unwrap_or(body))
}

fn required<'a>(field: Option<&'a str>, name: &'static str) -> Result<&'a str, MessageError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(MessageError::MissingField(name)),
    }
}
