//! Proxy orchestrator
//!
//! Owns the accept loop and the per-connection flow:
//!
//! ```text
//! accept -> IP gate -> read 64-byte hello -> classify
//!                                             |-- recognized --> anti-replay
//!                                             |                    |-> upstream dial -> frame relay
//!                                             |                    `-> (replayed) fronting splice
//!                                             `-- anything else -> fronting splice
//! ```
//!
//! Every reject after the hello is read takes the same immediate path to
//! the fronting host; nothing about the branch is observable to the peer.
//! Per-connection failures end that connection and are announced on the
//! event stream; the accept loop never stops for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::defense::{AntiReplayCache, IpGate};
use crate::error::{Error, Result};
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::handshake::{classify, RejectReason};
use crate::protocol::{DcId, NONCE_LEN};
use crate::transport::{Dialer, Upstream};

use super::events::{Event, EventStream};
use super::relay;
use super::stream_context::StreamContext;

pub struct Proxy {
    secret: crate::secret::Secret,
    fronting_port: u16,
    allow_fallback_on_unknown_dc: bool,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    dialer: Dialer,
    upstream: Upstream,
    antireplay: Arc<dyn AntiReplayCache>,
    gate: IpGate,
    events: EventStream,
    token: CancellationToken,
    permits: Arc<Semaphore>,
}

impl Proxy {
    pub fn new(
        config: &Config,
        antireplay: Arc<dyn AntiReplayCache>,
        gate: IpGate,
        events: EventStream,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let secret = config.parsed_secret()?;
        let dialer = Dialer::new(config.network.tcp_timeout());
        let upstream = Upstream::new(
            dialer.clone(),
            config.prefer_ip,
            config.use_test_dcs,
            config.network.tcp_timeout(),
            Duration::from_secs(config.tolerate_time_skewness),
        );

        Ok(Arc::new(Self {
            secret,
            fronting_port: config.domain_fronting_port,
            allow_fallback_on_unknown_dc: config.allow_fallback_on_unknown_dc,
            handshake_timeout: config.network.handshake_timeout(),
            idle_timeout: config.network.idle_timeout(),
            dialer,
            upstream,
            antireplay,
            gate,
            events,
            token,
            permits: Arc::new(Semaphore::new(config.concurrency)),
        }))
    }

    /// Accept loop. Returns when the root token is cancelled.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.events.send(Event::ConcurrencyLimited);
                            debug!(peer = %peer, "admission cap reached, dropping connection");
                            continue;
                        }
                    };

                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        proxy.handle_connection(stream, peer).await;
                        drop(permit);
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = StreamContext::new(&self.token, peer);

        if !self.gate.admits(peer.ip()) {
            debug!(stream_id = ctx.id(), ip = %peer.ip(), reason = "blocked", "connection refused");
            self.events.send(Event::ConnectionStart {
                id: ctx.id().to_string(),
                ip: peer.ip(),
            });
            ctx.close();
            self.events.send(Event::ConnectionEnd {
                id: ctx.id().to_string(),
                duration: ctx.elapsed(),
                tx: 0,
                rx: 0,
            });
            return;
        }

        self.events.send(Event::ConnectionStart {
            id: ctx.id().to_string(),
            ip: peer.ip(),
        });
        debug!(stream_id = ctx.id(), ip = %peer.ip(), "connection accepted");

        let (tx, rx) = self.run_session(&ctx, stream).await;

        ctx.close();
        self.events.send(Event::ConnectionEnd {
            id: ctx.id().to_string(),
            duration: ctx.elapsed(),
            tx,
            rx,
        });
        debug!(stream_id = ctx.id(), tx = tx, rx = rx, "connection finished");
    }

    async fn run_session(&self, ctx: &StreamContext, mut stream: TcpStream) -> (u64, u64) {
        let mut nonce = [0u8; NONCE_LEN];
        let filled = self.read_hello(&mut stream, &mut nonce).await;
        if filled < NONCE_LEN {
            self.events.send(Event::HandshakeFallback {
                id: ctx.id().to_string(),
                reason: RejectReason::ShortRead,
            });
            return self.fallback(ctx, stream, &nonce[..filled]).await;
        }

        let handshake = match classify(&nonce, &self.secret) {
            Ok(handshake) => handshake,
            Err(reason) => {
                self.events.send(Event::HandshakeFallback {
                    id: ctx.id().to_string(),
                    reason,
                });
                return self.fallback(ctx, stream, &nonce).await;
            }
        };

        let mut dc = handshake.dc;
        if !self.upstream.is_known_dc(dc) {
            if self.allow_fallback_on_unknown_dc {
                debug!(stream_id = ctx.id(), requested = %dc, "unknown DC, rerouting to default pool");
                dc = DcId::DEFAULT;
            } else {
                self.events.send(Event::HandshakeFallback {
                    id: ctx.id().to_string(),
                    reason: RejectReason::UnknownDc,
                });
                return self.fallback(ctx, stream, &nonce).await;
            }
        }

        // Record before anything is forwarded: a copy of this hello arriving
        // later, even concurrently, must classify as replayed.
        if self.antireplay.seen_before(&handshake.key_seed) {
            self.events.send(Event::ReplayDetected {
                id: ctx.id().to_string(),
            });
            return self.fallback(ctx, stream, &nonce).await;
        }

        let session = match self.upstream.connect(dc).await {
            Ok(session) => session,
            Err(e) => {
                match e {
                    Error::TimeSkew(skew) => {
                        warn!(stream_id = ctx.id(), dc = %dc, skew = skew, "upstream clock skew, closing");
                    }
                    e => {
                        warn!(stream_id = ctx.id(), dc = %dc, error = %e, "upstream unreachable");
                        self.events.send(Event::UpstreamUnreachable {
                            id: ctx.id().to_string(),
                            dc,
                        });
                    }
                }
                return (0, 0);
            }
        };

        self.events.send(Event::HandshakeOk {
            id: ctx.id().to_string(),
            dc,
        });
        info!(stream_id = ctx.id(), dc = %dc, addr = %session.addr, mode = %handshake.mode, "relaying");

        let (client_rd, client_wr) = stream.into_split();
        relay::splice_frames(
            ctx,
            FrameReader::new(client_rd, handshake.decryptor, handshake.mode),
            FrameWriter::new(client_wr, handshake.encryptor, handshake.mode),
            session.reader,
            session.writer,
            self.idle_timeout,
        )
        .await
    }

    /// Read up to 64 hello bytes under the handshake deadline. Returns how
    /// many arrived; anything short of the full hello is a reject.
    async fn read_hello(&self, stream: &mut TcpStream, nonce: &mut [u8; NONCE_LEN]) -> usize {
        let deadline = Instant::now() + self.handshake_timeout;
        let mut filled = 0;
        while filled < NONCE_LEN {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.read(&mut nonce[filled..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        filled
    }

    /// Splice the connection to the fronting host, replaying `prefix` first.
    /// The dial target is the hostname baked into the secret.
    async fn fallback(&self, ctx: &StreamContext, client: TcpStream, prefix: &[u8]) -> (u64, u64) {
        let front = match self
            .dialer
            .dial_host(&self.secret.host, self.fronting_port)
            .await
        {
            Ok(front) => front,
            Err(e) => {
                debug!(stream_id = ctx.id(), error = %e, "fronting host unreachable, closing");
                return (0, 0);
            }
        };

        self.events.send(Event::DomainFronting {
            id: ctx.id().to_string(),
            host: self.secret.host.clone(),
        });
        relay::splice_raw(ctx, client, front, prefix, self.idle_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::defense::{FileIpList, IpList, NoopAntiReplay, StableBloomAntiReplay};
    use crate::protocol::handshake::client_nonce;
    use crate::protocol::TAG_ABRIDGED;
    use crate::secret::Secret;

    /// Proxy under test, fronting to a local listener standing in for the
    /// real fronting host.
    struct Harness {
        proxy_addr: SocketAddr,
        front: TcpListener,
        secret: Secret,
        token: CancellationToken,
    }

    async fn start(configure: impl FnOnce(&mut Config), gate: IpGate, replay_guard: bool) -> Harness {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let secret = Secret::generate("127.0.0.1").unwrap();

        let mut config = Config::default_with_secret(&secret);
        config.domain_fronting_port = front.local_addr().unwrap().port();
        config.network.tcp_timeout = 1;
        config.network.handshake_timeout = 1;
        config.network.idle_timeout = 30;
        configure(&mut config);

        let antireplay: Arc<dyn AntiReplayCache> = if replay_guard {
            Arc::new(StableBloomAntiReplay::new(64 * 1024, 0.001))
        } else {
            Arc::new(NoopAntiReplay)
        };

        let token = CancellationToken::new();
        let proxy = Proxy::new(
            &config,
            antireplay,
            gate,
            EventStream::disabled(),
            token.clone(),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(proxy.serve(listener));

        Harness {
            proxy_addr,
            front,
            secret,
            token,
        }
    }

    #[tokio::test]
    async fn test_unrecognized_hello_goes_to_fronting() {
        let harness = start(|_| {}, IpGate::default(), false).await;

        let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
        let mut garbage = [0u8; NONCE_LEN];
        crate::crypto::random_bytes(&mut garbage);
        client.write_all(&garbage).await.unwrap();
        client.write_all(b"trailing probe bytes").await.unwrap();

        let (mut fronted, _) = harness.front.accept().await.unwrap();
        let mut seen = vec![0u8; NONCE_LEN + 20];
        fronted.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..NONCE_LEN], &garbage[..]);
        assert_eq!(&seen[NONCE_LEN..], b"trailing probe bytes");

        // And the fronting host's answer reaches the probe untouched.
        fronted.write_all(b"front says hi").await.unwrap();
        let mut reply = [0u8; 13];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], b"front says hi");

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_short_hello_goes_to_fronting() {
        let harness = start(
            |config| config.network.handshake_timeout = 1,
            IpGate::default(),
            false,
        )
        .await;

        let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
        client.write_all(&[0xabu8; 10]).await.unwrap();
        // Close early: ten bytes will never become a hello.
        client.shutdown().await.unwrap();

        let (mut fronted, _) = harness.front.accept().await.unwrap();
        let mut seen = [0u8; 10];
        fronted.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, &[0xabu8; 10]);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_replayed_hello_goes_to_fronting() {
        let harness = start(|_| {}, IpGate::default(), true).await;

        let nonce = client_nonce(&harness.secret, TAG_ABRIDGED, DcId(2));

        // First use: recognized, recorded, and the proxy tries the real DC
        // pool. Whatever happens upstream, the client leg just closes; the
        // fronting listener must stay silent.
        let mut first = TcpStream::connect(harness.proxy_addr).await.unwrap();
        first.write_all(&nonce).await.unwrap();
        let mut buf = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(5), first.read(&mut buf)).await;

        // Replay of the same hello: spliced to fronting.
        let mut second = TcpStream::connect(harness.proxy_addr).await.unwrap();
        second.write_all(&nonce).await.unwrap();

        let (mut fronted, _) = harness.front.accept().await.unwrap();
        let mut seen = [0u8; NONCE_LEN];
        fronted.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..], &nonce[..]);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_blocked_ip_is_closed_without_reading() {
        let block = {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(b"127.0.0.0/8\n").unwrap();
            file
        };
        let blocklist: Arc<dyn IpList> = Arc::new(
            FileIpList::new("blocklist", vec![block.path().to_string_lossy().into_owned()])
                .unwrap(),
        );
        let harness = start(|_| {}, IpGate::new(None, Some(blocklist)), false).await;

        let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
        // No fronting, no handshake read: just EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("closed promptly")
            .unwrap();
        assert_eq!(n, 0);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_admission_cap_drops_excess_connections() {
        let harness = start(|config| config.concurrency = 1, IpGate::default(), false).await;

        // First connection sits inside its handshake window holding the
        // only permit.
        let first = TcpStream::connect(harness.proxy_addr).await.unwrap();

        // Give the accept loop a moment to take the permit.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = TcpStream::connect(harness.proxy_addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("dropped promptly")
            .unwrap();
        assert_eq!(n, 0);

        drop(first);
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_unknown_dc_without_rerouting_goes_to_fronting() {
        let harness = start(|_| {}, IpGate::default(), false).await;

        let nonce = client_nonce(&harness.secret, TAG_ABRIDGED, DcId(99));
        let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
        client.write_all(&nonce).await.unwrap();

        let (mut fronted, _) = harness.front.accept().await.unwrap();
        let mut seen = [0u8; NONCE_LEN];
        fronted.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..], &nonce[..]);

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_dc_closes_client_without_fronting() {
        // Test DC pool, v4 only: a single endpoint that cannot answer from
        // inside the test environment. The recognized client must be closed
        // outright; the fronting listener stays silent.
        let harness = start(
            |config| {
                config.use_test_dcs = true;
                config.prefer_ip = crate::config::PreferIp::Ipv4;
            },
            IpGate::default(),
            false,
        )
        .await;

        let nonce = client_nonce(&harness.secret, TAG_ABRIDGED, DcId(3));
        let mut client = TcpStream::connect(harness.proxy_addr).await.unwrap();
        client.write_all(&nonce).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), client.read(&mut buf))
            .await
            .expect("client closed after the DC pool is exhausted")
            .unwrap_or(0);
        assert_eq!(n, 0, "client must not receive any byte");

        let fronted = tokio::time::timeout(Duration::from_millis(200), harness.front.accept()).await;
        assert!(fronted.is_err(), "no fallback for an accepted handshake");

        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let harness = start(|_| {}, IpGate::default(), false).await;
        harness.token.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The listener socket is gone once serve() returns.
        let outcome = TcpStream::connect(harness.proxy_addr).await;
        if let Ok(mut stream) = outcome {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("closed promptly")
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }
}
