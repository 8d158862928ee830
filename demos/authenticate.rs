//! Example: authenticate a connection before using it
//!
//! The secret is read from `IPCON_SECRET`. After every automatic reconnect
//! the daemon forgets the authentication, so the demo authenticates again
//! from a task spawned by the connected handler.
//!
//! Run with: `IPCON_SECRET=... cargo run --example authenticate`

use ipcon_protocol::config::NetworkConfig;
use ipcon_protocol::utils::logging::init_logging;
use ipcon_protocol::{ConnectReason, Connection, ConnectionEvent, ConnectionEventKind};
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging)?;

    let secret = std::env::var("IPCON_SECRET").unwrap_or_default();
    let connection = Connection::from_config(&config)?;

    let reauth = connection.clone();
    let reauth_secret = secret.clone();
    connection.register_connection_event(ConnectionEventKind::Connected, move |event| {
        if *event != ConnectionEvent::Connected(ConnectReason::AutoReconnect) {
            return;
        }
        let connection = reauth.clone();
        let secret = reauth_secret.clone();
        tokio::spawn(async move {
            match connection.authenticate(&secret).await {
                Ok(()) => info!("Re-authenticated after reconnect"),
                Err(e) => error!(error = %e, "Re-authentication failed"),
            }
        });
    })?;

    connection.connect_configured().await?;
    connection.authenticate(&secret).await?;
    info!("Authenticated, enumerating");

    connection.register_enumerate_callback(|event| {
        info!(uid = %event.identity.uid, device = event.identity.device_identifier, "Found device");
    })?;
    connection.enumerate().await?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    connection.disconnect().await?;
    Ok(())
}
