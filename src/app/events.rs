//! Typed observability events
//!
//! The data path reports what happens through a single `send` call; zero or
//! more observers registered at startup receive the events on their own
//! tasks. Delivery is best-effort: each observer gets a bounded channel and
//! a stalled observer loses events instead of stalling a relay pump.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::handshake::RejectReason;
use crate::protocol::DcId;

/// Queue depth per observer before events are dropped.
const OBSERVER_QUEUE: usize = 1024;

/// Everything the core announces about its connections.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionStart {
        id: String,
        ip: IpAddr,
    },
    ConnectionEnd {
        id: String,
        duration: Duration,
        tx: u64,
        rx: u64,
    },
    HandshakeOk {
        id: String,
        dc: DcId,
    },
    HandshakeFallback {
        id: String,
        reason: RejectReason,
    },
    ReplayDetected {
        id: String,
    },
    DomainFronting {
        id: String,
        host: String,
    },
    UpstreamUnreachable {
        id: String,
        dc: DcId,
    },
    ConcurrencyLimited,
    IpListSize {
        n: usize,
        is_blocklist: bool,
    },
}

/// Sink for events, implemented by each stats backend.
pub trait EventObserver: Send + Sync + 'static {
    fn observe(&self, event: &Event);
}

/// Fan-out handle shared by every connection.
#[derive(Clone, Default)]
pub struct EventStream {
    senders: Arc<Vec<mpsc::Sender<Event>>>,
}

impl EventStream {
    /// Wire up observers; each gets its own queue and drain task.
    pub fn new(observers: Vec<Box<dyn EventObserver>>) -> Self {
        let senders = observers
            .into_iter()
            .map(|observer| {
                let (tx, mut rx) = mpsc::channel::<Event>(OBSERVER_QUEUE);
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        observer.observe(&event);
                    }
                });
                tx
            })
            .collect();

        Self {
            senders: Arc::new(senders),
        }
    }

    /// No observers; every send is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Non-blocking fan-out. A full observer queue drops the event.
    pub fn send(&self, event: Event) {
        for sender in self.senders.iter() {
            if sender.try_send(event.clone()).is_err() {
                debug!("observer queue full, dropping event");
            }
        }
    }
}
