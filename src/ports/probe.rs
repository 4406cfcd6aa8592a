//! Connect-probe liveness heuristic for local TCP ports.
//!
//! An accepting connect means something is listening. A refused or
//! timed-out connect means the port is treated as free. Nothing is bound or
//! reserved, so two callers can observe the same port as free.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Whether a listener on `127.0.0.1:port` accepts a connection.
pub async fn port_accepts(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(err)) => {
            debug!(port, %err, "port probe refused");
            false
        }
        Err(_) => {
            debug!(port, "port probe timed out");
            false
        }
    }
}
