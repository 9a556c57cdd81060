//! Source-IP gating
//!
//! Allow/block lists in firehol netset format: one bare IP or CIDR network
//! per line, `#` comments. Lists are parsed into immutable snapshots; a
//! background task re-reads the files on an interval and swaps the
//! snapshot, so the accept path always observes a consistent view without
//! taking a write lock.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::events::{Event, EventStream};
use crate::error::{Error, Result};

// ============================================================================
// CIDR matching
// ============================================================================

/// One network entry; a bare IP is a /32 or /128.
#[derive(Debug, Clone, Copy)]
struct CidrEntry {
    ip: IpAddr,
    prefix: u8,
}

impl CidrEntry {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (s, None),
        };
        let ip: IpAddr = addr.parse().ok()?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return None;
        }
        Some(Self { ip, prefix })
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let net_bits = u32::from(net);
                let ip_bits = u32::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix)
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net_bits = u128::from(net);
                let ip_bits = u128::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix)
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            _ => false,
        }
    }
}

// ============================================================================
// Lists
// ============================================================================

/// Read side of an IP list.
pub trait IpList: Send + Sync {
    fn contains(&self, ip: IpAddr) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed list with periodic snapshot refresh.
pub struct FileIpList {
    name: &'static str,
    files: Vec<PathBuf>,
    snapshot: RwLock<Arc<Vec<CidrEntry>>>,
}

impl FileIpList {
    /// Build the list and load the initial snapshot. Unreadable files are a
    /// configuration error at startup; on refresh they only log.
    pub fn new(name: &'static str, files: Vec<String>) -> Result<Self> {
        let files: Vec<PathBuf> = files.into_iter().map(PathBuf::from).collect();
        let list = Self {
            name,
            files,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        };
        let entries = list.load()?;
        *list.snapshot.write() = Arc::new(entries);
        Ok(list)
    }

    fn load(&self) -> Result<Vec<CidrEntry>> {
        let mut entries = Vec::new();
        for file in &self.files {
            let content = std::fs::read_to_string(file).map_err(|e| {
                Error::Config(format!("cannot read {} file {}: {}", self.name, file.display(), e))
            })?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match CidrEntry::parse(line) {
                    Some(entry) => entries.push(entry),
                    None => debug!(list = self.name, line = line, "skipping unparsable entry"),
                }
            }
        }
        Ok(entries)
    }

    /// Periodically re-read the files and swap the snapshot. Runs until the
    /// token fires; announces sizes through the event stream.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        update_each: Duration,
        events: EventStream,
        is_blocklist: bool,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let list = Arc::clone(self);
        events.send(Event::IpListSize {
            n: list.len(),
            is_blocklist,
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(update_each) => {}
                }
                match list.load() {
                    Ok(entries) => {
                        let n = entries.len();
                        *list.snapshot.write() = Arc::new(entries);
                        debug!(list = list.name, entries = n, "list refreshed");
                        events.send(Event::IpListSize { n, is_blocklist });
                    }
                    Err(e) => {
                        warn!(list = list.name, error = %e, "list refresh failed, keeping previous snapshot");
                    }
                }
            }
        })
    }
}

impl IpList for FileIpList {
    fn contains(&self, ip: IpAddr) -> bool {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot.iter().any(|entry| entry.contains(ip))
    }

    fn len(&self) -> usize {
        self.snapshot.read().len()
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Combined admission decision over both lists.
///
/// A source passes iff the allowlist (when configured) contains it and the
/// blocklist (when configured) does not. An absent allowlist admits
/// everyone.
#[derive(Default)]
pub struct IpGate {
    allowlist: Option<Arc<dyn IpList>>,
    blocklist: Option<Arc<dyn IpList>>,
}

impl IpGate {
    pub fn new(allowlist: Option<Arc<dyn IpList>>, blocklist: Option<Arc<dyn IpList>>) -> Self {
        Self {
            allowlist,
            blocklist,
        }
    }

    pub fn admits(&self, ip: IpAddr) -> bool {
        if let Some(allow) = &self.allowlist {
            if !allow.contains(ip) {
                return false;
            }
        }
        if let Some(block) = &self.blocklist {
            if block.contains(ip) {
                return false;
            }
        }
        true
    }
}
