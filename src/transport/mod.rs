//! Transport layer: outbound TCP dialing
//!
//! A thin dialer with a bounded timeout. Endpoint selection and the
//! upstream session handshake live in [`upstream`].

pub mod upstream;

pub use upstream::Upstream;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Bounded-timeout TCP dialer.
#[derive(Debug, Clone)]
pub struct Dialer {
    timeout: Duration,
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Dial `addr`, failing after the configured timeout.
    pub async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;

        // Frames are small and latency-sensitive.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Dial a named host, for the domain-fronting leg.
    pub async fn dial_host(&self, host: &str, port: u16) -> Result<TcpStream> {
        debug!(host = host, port = port, "dialing fronting host");
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
