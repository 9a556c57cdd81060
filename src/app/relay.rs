//! Bidirectional relay
//!
//! Two pumps per connection, one per direction, sharing nothing but the
//! stream context's cancellation token and the idle clock. Frame relaying
//! re-encodes between the client's negotiated framing and the intermediate
//! framing spoken upstream; the fronting splice moves raw bytes untouched.
//!
//! Backpressure is the read/write coupling itself: a pump reads its next
//! frame only after the previous one is written out. Whichever pump
//! finishes first closes the context; the other observes the cancellation
//! and exits, and both sockets drop with the pumps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::codec::{FrameReader, FrameWriter};

use super::stream_context::StreamContext;

/// Scratch buffer size for the raw fronting splice.
const RAW_BUFFER_SIZE: usize = 32 * 1024;

// ============================================================================
// Idle tracking
// ============================================================================

/// Last-traffic clock shared by both pumps.
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.base.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Watchdog future: resolves once no traffic moved for `idle`.
async fn idle_watch(activity: &Activity, idle: Duration) {
    let tick = (idle / 4).max(Duration::from_millis(100));
    loop {
        tokio::time::sleep(tick).await;
        if activity.idle_for() >= idle {
            return;
        }
    }
}

// ============================================================================
// Frame relay
// ============================================================================

/// Relay framed traffic between an accepted client and its upstream leg.
///
/// Returns `(tx, rx)`: payload bytes moved client->upstream and
/// upstream->client.
pub async fn splice_frames<CR, CW, UR, UW>(
    ctx: &StreamContext,
    mut client_rd: FrameReader<CR>,
    mut client_wr: FrameWriter<CW>,
    mut upstream_rd: FrameReader<UR>,
    mut upstream_wr: FrameWriter<UW>,
    idle: Duration,
) -> (u64, u64)
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let tx = AtomicU64::new(0);
    let rx = AtomicU64::new(0);
    let activity = Activity::new();

    let client_to_upstream = async {
        loop {
            let frame = match client_rd.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(stream_id = ctx.id(), error = %e, "client read ended");
                    break;
                }
            };
            activity.touch();
            if let Err(e) = upstream_wr.write_frame(&frame).await {
                debug!(stream_id = ctx.id(), error = %e, "upstream write ended");
                break;
            }
            tx.fetch_add(frame.len() as u64, Ordering::Relaxed);
            activity.touch();
        }
        let _ = upstream_wr.shutdown().await;
    };

    let upstream_to_client = async {
        loop {
            let frame = match upstream_rd.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(stream_id = ctx.id(), error = %e, "upstream read ended");
                    break;
                }
            };
            activity.touch();
            if let Err(e) = client_wr.write_frame(&frame).await {
                debug!(stream_id = ctx.id(), error = %e, "client write ended");
                break;
            }
            rx.fetch_add(frame.len() as u64, Ordering::Relaxed);
            activity.touch();
        }
        let _ = client_wr.shutdown().await;
    };

    tokio::join!(
        async {
            tokio::select! {
                _ = client_to_upstream => {}
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
        async {
            tokio::select! {
                _ = upstream_to_client => {}
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
        async {
            tokio::select! {
                _ = idle_watch(&activity, idle) => {
                    debug!(stream_id = ctx.id(), "idle timeout");
                }
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
    );

    (tx.load(Ordering::Relaxed), rx.load(Ordering::Relaxed))
}

// ============================================================================
// Raw splice (domain fronting)
// ============================================================================

/// Splice raw bytes between an unrecognized client and the fronting host.
///
/// `prefix` is whatever was already consumed from the client before the
/// decision fell; the fronting host receives it first, then the two streams
/// flow untouched under the same cancellation and idle rules as the frame
/// relay.
pub async fn splice_raw<C, F>(
    ctx: &StreamContext,
    client: C,
    front: F,
    prefix: &[u8],
    idle: Duration,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    F: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut front_rd, mut front_wr) = tokio::io::split(front);

    if !prefix.is_empty() {
        if let Err(e) = front_wr.write_all(prefix).await {
            debug!(stream_id = ctx.id(), error = %e, "fronting prefix write failed");
            ctx.close();
            return (0, 0);
        }
        if front_wr.flush().await.is_err() {
            ctx.close();
            return (0, 0);
        }
    }

    let tx = AtomicU64::new(prefix.len() as u64);
    let rx = AtomicU64::new(0);
    let activity = Activity::new();

    let client_to_front = async {
        let mut buf = vec![0u8; RAW_BUFFER_SIZE];
        loop {
            let n = match client_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            activity.touch();
            if front_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if front_wr.flush().await.is_err() {
                break;
            }
            tx.fetch_add(n as u64, Ordering::Relaxed);
        }
        let _ = front_wr.shutdown().await;
    };

    let front_to_client = async {
        let mut buf = vec![0u8; RAW_BUFFER_SIZE];
        loop {
            let n = match front_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            activity.touch();
            if client_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if client_wr.flush().await.is_err() {
                break;
            }
            rx.fetch_add(n as u64, Ordering::Relaxed);
        }
        let _ = client_wr.shutdown().await;
    };

    tokio::join!(
        async {
            tokio::select! {
                _ = client_to_front => {}
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
        async {
            tokio::select! {
                _ = front_to_client => {}
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
        async {
            tokio::select! {
                _ = idle_watch(&activity, idle) => {
                    debug!(stream_id = ctx.id(), "idle timeout");
                }
                _ = ctx.token().cancelled() => {}
            }
            ctx.close();
        },
    );

    (tx.load(Ordering::Relaxed), rx.load(Ordering::Relaxed))
}
