//! TCP transport to the daemon.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Open a TCP stream to `host:port` with Nagle disabled.
///
/// Requests are small and latency bound, so packets go out immediately.
#[instrument(skip(connect_timeout))]
pub async fn open_stream(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = with_timeout_error(
        async { Ok(TcpStream::connect((host, port)).await?) },
        connect_timeout,
        || {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {host}:{port} timed out"),
            ))
        },
    )
    .await?;

    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "TCP stream open");
    Ok(stream)
}
