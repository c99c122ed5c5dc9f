//! Empire Client CLI
//!
//! Sends one JSON command and prints the response.
//!
//! ```text
//! empire-client <code> [json-payload]
//! ```
//!
//! Connection settings come from the environment (see `ClientConfig::from_env`).

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use empire_client::{Callbacks, Client, ClientConfig, VERSION};

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut args = std::env::args().skip(1);
    let Some(code) = args.next() else {
        bail!("usage: empire-client <code> [json-payload]");
    };
    let payload: Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let config = ClientConfig::from_env();
    info!("Empire Client v{}", VERSION);
    info!("Server: {} (zone {})", config.url, config.zone);

    let callbacks = Callbacks::new()
        .on_error(|e| warn!("Connection error: {}", e))
        .on_close(|reason| info!("Connection closed: {}", reason));
    let client = Client::connect(config.clone(), callbacks)?;
    client
        .wait_until_open(config.connect_timeout)
        .context("connection did not open")?;

    let result = client.request(&code, &payload, None);
    client.close();

    let response = result.with_context(|| format!("no response to {code}"))?;
    println!("{}", serde_json::to_string_pretty(&response.data)?);
    client
        .raise_for_status(&response)
        .with_context(|| format!("{code} failed"))?;
    Ok(())
}
