//! Upstream datacenter dialing and session opening
//!
//! Endpoint pools are baked in, per datacenter and address family, with a
//! staging set switched by configuration. A dial rotates through the pool
//! from a random start so a dead endpoint does not stall every connection.
//! Once TCP is up, the obfuscated session is opened: forge a nonce pinned
//! to intermediate framing, send it, then read and validate the upstream's
//! first reply frame. Failures here are fatal for the connection; the
//! client-side handshake has already been answered, so there is nothing to
//! fall back to.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::config::PreferIp;
use crate::error::{Error, Result};
use crate::protocol::codec::{FrameMode, FrameReader, FrameWriter};
use crate::protocol::handshake::forge_upstream_nonce;
use crate::protocol::DcId;

use super::Dialer;

// ============================================================================
// Endpoint tables
// ============================================================================

const PRODUCTION_V4: [&[&str]; 5] = [
    &["149.154.175.53:443"],
    &["149.154.167.51:443", "95.161.76.100:443"],
    &["149.154.175.100:443"],
    &["149.154.167.91:443", "149.154.165.120:443"],
    &["91.108.56.130:443", "91.105.192.100:443"],
];

const PRODUCTION_V6: [&[&str]; 5] = [
    &["[2001:b28:f23d:f001::a]:443"],
    &["[2001:67c:4e8:f002::a]:443"],
    &["[2001:b28:f23d:f003::a]:443"],
    &["[2001:67c:4e8:f004::a]:443"],
    &["[2001:b28:f23f:f005::a]:443"],
];

// Media traffic rides a parallel pool. The published addresses currently
// coincide with the main pool but are rolled out independently.
const PRODUCTION_MEDIA_V4: [&[&str]; 5] = PRODUCTION_V4;
const PRODUCTION_MEDIA_V6: [&[&str]; 5] = PRODUCTION_V6;

const TEST_V4: [&[&str]; 3] = [
    &["149.154.175.10:443"],
    &["149.154.167.40:443"],
    &["149.154.175.117:443"],
];

const TEST_V6: [&[&str]; 3] = [
    &["[2001:b28:f23d:f001::e]:443"],
    &["[2001:67c:4e8:f002::e]:443"],
    &["[2001:b28:f23d:f003::e]:443"],
];

/// Minimum size of the upstream's first reply frame. Anything shorter
/// cannot carry the session header, timestamp included.
const MIN_REPLY_FRAME: usize = 16;

/// Offset of the little-endian unix timestamp inside the reply frame.
const REPLY_TS_OFFSET: usize = 12;

// ============================================================================
// Upstream
// ============================================================================

/// An opened upstream leg: intermediate-framed codecs over the DC socket.
pub struct UpstreamSession {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: FrameWriter<OwnedWriteHalf>,
    pub addr: SocketAddr,
}

/// Datacenter dialer and session opener.
pub struct Upstream {
    dialer: Dialer,
    prefer: PreferIp,
    use_test_dcs: bool,
    reply_timeout: Duration,
    tolerate_time_skewness: Duration,
}

impl Upstream {
    pub fn new(
        dialer: Dialer,
        prefer: PreferIp,
        use_test_dcs: bool,
        reply_timeout: Duration,
        tolerate_time_skewness: Duration,
    ) -> Self {
        Self {
            dialer,
            prefer,
            use_test_dcs,
            reply_timeout,
            tolerate_time_skewness,
        }
    }

    /// Whether `dc` names a pool this build knows how to reach.
    pub fn is_known_dc(&self, dc: DcId) -> bool {
        let pools = if self.use_test_dcs {
            TEST_V4.len()
        } else {
            PRODUCTION_V4.len()
        };
        let pool = dc.pool() as usize;
        pool >= 1 && pool <= pools
    }

    /// Dial the pool for `dc` and open an obfuscated session on it.
    pub async fn connect(&self, dc: DcId) -> Result<UpstreamSession> {
        let endpoints = self.endpoints(dc);
        if endpoints.is_empty() {
            return Err(Error::UpstreamUnreachable(dc.0));
        }

        let start = rand::thread_rng().gen_range(0..endpoints.len());
        let mut stream = None;
        for i in 0..endpoints.len() {
            let addr = endpoints[(start + i) % endpoints.len()];
            match self.dialer.dial(addr).await {
                Ok(s) => {
                    stream = Some((s, addr));
                    break;
                }
                Err(e) => {
                    debug!(dc = %dc, addr = %addr, error = %e, "endpoint dial failed");
                }
            }
        }
        let (mut stream, addr) = stream.ok_or(Error::UpstreamUnreachable(dc.0))?;

        let handshake = forge_upstream_nonce(dc);
        stream.write_all(&handshake.frame).await?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, handshake.decryptor, FrameMode::Intermediate);
        let writer = FrameWriter::new(write_half, handshake.encryptor, FrameMode::Intermediate);

        let reply = tokio::time::timeout(self.reply_timeout, reader.read_frame())
            .await
            .map_err(|_| Error::Timeout)??
            .ok_or_else(|| Error::Handshake("upstream closed during session open".into()))?;
        self.validate_reply(&reply)?;

        debug!(dc = %dc, addr = %addr, "upstream session open");

        Ok(UpstreamSession {
            reader,
            writer,
            addr,
        })
    }

    fn validate_reply(&self, reply: &[u8]) -> Result<()> {
        if reply.len() < MIN_REPLY_FRAME {
            return Err(Error::Handshake(format!(
                "upstream reply of {} bytes is too short",
                reply.len()
            )));
        }

        if self.tolerate_time_skewness.is_zero() {
            return Ok(());
        }

        let ts = u32::from_le_bytes(
            reply[REPLY_TS_OFFSET..REPLY_TS_OFFSET + 4]
                .try_into()
                .expect("slice length"),
        ) as u64;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let skew = now.abs_diff(ts);
        if skew > self.tolerate_time_skewness.as_secs() {
            return Err(Error::TimeSkew(skew));
        }
        Ok(())
    }

    /// Endpoint list for `dc`, preferred family first, each family block
    /// in table order.
    fn endpoints(&self, dc: DcId) -> Vec<SocketAddr> {
        let pool = dc.pool() as usize;
        let (v4, v6): (&[&str], &[&str]) = if self.use_test_dcs {
            match pool.checked_sub(1).and_then(|i| TEST_V4.get(i).zip(TEST_V6.get(i))) {
                Some((v4, v6)) => (*v4, *v6),
                None => return Vec::new(),
            }
        } else {
            let (table_v4, table_v6) = if dc.is_media() {
                (&PRODUCTION_MEDIA_V4, &PRODUCTION_MEDIA_V6)
            } else {
                (&PRODUCTION_V4, &PRODUCTION_V6)
            };
            match pool
                .checked_sub(1)
                .and_then(|i| table_v4.get(i).zip(table_v6.get(i)))
            {
                Some((v4, v6)) => (*v4, *v6),
                None => return Vec::new(),
            }
        };

        let parse = |addrs: &[&str]| -> Vec<SocketAddr> {
            addrs
                .iter()
                .map(|a| a.parse().expect("static endpoint table"))
                .collect()
        };

        match self.prefer {
            PreferIp::Ipv4 => parse(v4),
            PreferIp::Ipv6 => parse(v6),
            PreferIp::PreferIpv4 => {
                let mut out = parse(v4);
                out.extend(parse(v6));
                out
            }
            PreferIp::PreferIpv6 => {
                let mut out = parse(v6);
                out.extend(parse(v4));
                out
            }
        }
    }
}
