//! Example: PING/PONG client
//!
//! Sends one fire-and-forget `PING`, then one `PING` that waits for its
//! `PONG`, while a `PONG` handler logs every reply that arrives.
//!
//! Run with: `cargo run --example client` (start the server example first)

use fastsocket::utils::logging::init_logging;
use fastsocket::{Client, Message, NetworkConfig, Reply};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging)?;

    let client = Client::from_config(&config);
    client.on_message("PONG", |msg, _peer| async move {
        info!(id = msg.id(), data = ?msg.get("data"), "Received PONG");
        Ok(())
    })?;
    client.connect().await?;

    client
        .send(&Message::from_value(Some(1), "PING", json!({ "data": "Hello" }))?)
        .await?;

    let request = Message::from_value(Some(2), "PING", json!({ "data": "Hello" }))?;
    match client
        .send_and_wait(request, Some(Duration::from_secs(5)))
        .await?
    {
        Reply::Received(response) => info!(data = ?response.data(), "Received response"),
        Reply::TimedOut => warn!("No response received within the timeout period"),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    client.disconnect().await;
    Ok(())
}
