//! Defense layer: anti-replay and source-IP gating
//!
//! Both gates sit in front of the handshake path and are consulted once per
//! connection. They are the only mutable state shared across connections,
//! so each is built for many concurrent callers.

pub mod antireplay;
pub mod iplist;

pub use antireplay::{AntiReplayCache, NoopAntiReplay, StableBloomAntiReplay};
pub use iplist::{FileIpList, IpGate, IpList};
