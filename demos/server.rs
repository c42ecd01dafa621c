//! Example: PING/PONG server
//!
//! Answers every `PING` with a `PONG` carrying the same id and logs every
//! message through an `"ALL"` handler. Settings come from `FASTSOCKET_*`
//! environment variables.
//!
//! Run with: `cargo run --example server`

use fastsocket::utils::logging::init_logging;
use fastsocket::{Message, NetworkConfig, Server};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging)?;
    config.validate_strict()?;

    let server = Server::from_config(&config);
    server.on_message("PING", |msg, peer| async move {
        let pong = Message::from_value(
            Some(msg.id()),
            "PONG",
            json!({ "data": "Hello from server!" }),
        )?;
        peer.send(&pong).await
    })?;
    server.on_message("ALL", |msg, peer| async move {
        info!(key = peer.key(), id = msg.id(), code = msg.code(), "Message received");
        Ok(())
    })?;

    let addr = server.start().await?;
    info!(%addr, "Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
