//! Client Configuration
//!
//! Connection target, transport selection and timeouts. Defaults mirror what
//! the live game servers expect; everything can be overridden from the
//! environment for the bundled binary.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Port used when the URL does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// Upper bound for a single buffered inbound message (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// URL is not of the form `scheme://host[:port]`.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Port component is not a valid u16.
    #[error("Invalid port in URL {url}: {port}")]
    InvalidPort {
        /// The URL being parsed.
        url: String,
        /// The offending port text.
        port: String,
    },

    /// Unknown transport name.
    #[error("Unknown transport: {0} (expected auto, stream or frame)")]
    UnknownTransport(String),
}

/// Which wire transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Pick from the URL scheme: `ws`/`wss` use frames, anything else streams.
    #[default]
    Auto,
    /// Raw TCP with NUL-terminated framing.
    Stream,
    /// WebSocket, one text frame per message.
    Frame,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "stream" | "tcp" => Ok(Self::Stream),
            "frame" | "ws" | "websocket" => Ok(Self::Frame),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// A parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The URL exactly as configured.
    pub url: String,
    /// Lowercased scheme (`tcp`, `ws`, `wss`, ...).
    pub scheme: String,
    /// Host name or address, without IPv6 brackets.
    pub host: String,
    /// Port, [`DEFAULT_PORT`] when omitted.
    pub port: u16,
}

impl Endpoint {
    /// Parse `scheme://host[:port][/path]`.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidUrl(url.to_string()))?;
        if scheme.is_empty() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal: [::1]:port
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidUrl(url.to_string()))?;
            (host, after.strip_prefix(':'))
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                url: url.to_string(),
                port: p.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            url: url.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        })
    }

    /// Whether the scheme names a WebSocket endpoint.
    pub fn is_websocket(&self) -> bool {
        matches!(self.scheme.as_str(), "ws" | "wss")
    }

    /// `host:port` suitable for socket address resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, `scheme://host[:port]`.
    pub url: String,
    /// Server header (zone) placed in every outgoing command, e.g. `EmpireEx_2`.
    pub zone: String,
    /// Transport selection.
    pub transport: TransportKind,
    /// Bound on the initial connect.
    pub connect_timeout: Duration,
    /// Default wait for `wait_for_json_response` when the caller passes `None`.
    pub response_timeout: Duration,
    /// Largest inbound message the stream framing will buffer.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "wss://ep-live-de1-game.goodgamestudios.com".to_string(),
            zone: "EmpireEx_2".to_string(),
            transport: TransportKind::Auto,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a config for `url` and `zone`, defaults elsewhere.
    pub fn new(url: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            zone: zone.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// Unset variables fall back to the defaults. Set but unparsable ones
    /// also fall back, with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("EMPIRE_URL").unwrap_or(defaults.url),
            zone: std::env::var("EMPIRE_ZONE").unwrap_or(defaults.zone),
            transport: env_parsed("EMPIRE_TRANSPORT").unwrap_or(defaults.transport),
            connect_timeout: env_millis("EMPIRE_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            response_timeout: env_millis("EMPIRE_RESPONSE_TIMEOUT_MS")
                .unwrap_or(defaults.response_timeout),
            max_message_size: defaults.max_message_size,
        }
    }

    /// Parse the configured URL.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.url)
    }

    /// Resolve [`TransportKind::Auto`] against the endpoint scheme.
    pub fn resolved_transport(&self, endpoint: &Endpoint) -> TransportKind {
        match self.transport {
            TransportKind::Auto if endpoint.is_websocket() => TransportKind::Frame,
            TransportKind::Auto => TransportKind::Stream,
            explicit => explicit,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parsed::<u64>(name).map(Duration::from_millis)
}

fn env_parsed<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
