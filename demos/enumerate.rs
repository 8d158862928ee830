//! Example: list every device attached to a daemon
//!
//! Connects, broadcasts an enumerate request and prints the announcements
//! that arrive within a few seconds.
//!
//! Run with: `cargo run --example enumerate -- [host] [port]`

#![allow(clippy::uninlined_format_args)]

use ipcon_protocol::config::NetworkConfig;
use ipcon_protocol::utils::logging::init_logging;
use ipcon_protocol::{Connection, ConnectionEventKind, EnumerationType};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NetworkConfig::from_env()?;
    let mut args = std::env::args().skip(1);
    if let Some(host) = args.next() {
        config.client.host = host;
    }
    if let Some(port) = args.next() {
        config.client.port = port.parse()?;
    }
    init_logging(&config.logging)?;

    let connection = Connection::from_config(&config)?;

    connection.register_connection_event(ConnectionEventKind::Connected, |event| {
        println!("-> {:?}", event);
    })?;
    connection.register_connection_event(ConnectionEventKind::Disconnected, |event| {
        println!("<- {:?}", event);
    })?;
    connection.register_enumerate_callback(|event| {
        let id = &event.identity;
        match event.enumeration_type {
            EnumerationType::Disconnected => println!("{:>8} gone", id.uid),
            _ => println!(
                "{:>8} on {:>8}[{}] device {:>5} hw {:?} fw {:?}",
                id.uid,
                id.connected_uid,
                id.position,
                id.device_identifier,
                id.hardware_version,
                id.firmware_version
            ),
        }
    })?;

    connection.connect_configured().await?;
    connection.enumerate().await?;

    tokio::time::sleep(Duration::from_secs(3)).await;

    connection.disconnect().await?;
    connection.metrics().log_metrics();
    Ok(())
}
