//! Per-connection lifetime
//!
//! One `StreamContext` exists per accepted connection. It carries the
//! correlation id that threads through every log line and event, the client
//! address, and the cancellation token both relay pumps watch. `close` is
//! idempotent: the first call cancels the token, which releases both legs;
//! later calls are no-ops.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use crate::crypto::random_bytes;

/// Bytes of entropy in a correlation id.
const STREAM_ID_BYTES: usize = 16;

pub struct StreamContext {
    id: String,
    client_ip: IpAddr,
    token: CancellationToken,
    closed: AtomicBool,
    started: Instant,
}

impl StreamContext {
    pub fn new(parent: &CancellationToken, peer: SocketAddr) -> Self {
        let mut raw = [0u8; STREAM_ID_BYTES];
        random_bytes(&mut raw);

        Self {
            id: URL_SAFE_NO_PAD.encode(raw),
            client_ip: peer.ip(),
            token: parent.child_token(),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cancel the context, releasing both legs. Returns whether this call
    /// was the one that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
