//! Connects to a public echo server, sends a subscription-style payload on
//! every (re)connect and prints what comes back.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example echo -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use resilient_ws::ws::config::Config;
use resilient_ws::ws::{CallbackError, WebSocketClient};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let mut config = Config::with_reconnect_delay(Duration::from_secs(2));
    config.reconnect.after_manual_close = false;
    let client = WebSocketClient::new(&endpoint, config)?;

    let sender = client.downgrade();
    client.on_open(move || {
        info!("connected, subscribing");
        if let Some(sender) = sender.upgrade() {
            sender.send(&json!({ "type": "subscribe", "channel": "echo" }));
        }
    });
    client.on_message(|text| {
        info!(%text, "received");
        Ok::<_, CallbackError>(())
    });
    client.on_close(|code, reason| warn!(code, reason, "closed"));
    client.on_error(|error| warn!(%error, "transport error"));

    client.connect();

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => client.send("ping"),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close(Some(1000), Some("shutting down"));
    Ok(())
}
