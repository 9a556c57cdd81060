//! Protocol layer: the obfuscated MTProto outer transport
//!
//! Everything above the TCP socket and below the relay lives here: the
//! 64-byte obfuscated nonce exchanged at connection start, and the three
//! inner framings (abridged, intermediate, padded intermediate) selected by
//! the protocol tag hidden inside it. Inner MTProto payloads are opaque to
//! this crate; only the outer framing is interpreted.

pub mod codec;
pub mod handshake;

pub use codec::{FrameMode, FrameReader, FrameWriter};
pub use handshake::{classify, forge_upstream_nonce, ClientHandshake, RejectReason, UpstreamHandshake};

/// Length of the obfuscated nonce both sides exchange first.
pub const NONCE_LEN: usize = 64;

/// Hard ceiling on a single framed packet.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Protocol tag byte for abridged framing (repeated four times on the wire).
pub const TAG_ABRIDGED: u8 = 0xef;

/// Protocol tag byte for intermediate framing.
pub const TAG_INTERMEDIATE: u8 = 0xee;

/// Protocol tag byte for padded intermediate framing.
pub const TAG_PADDED_INTERMEDIATE: u8 = 0xdd;

/// Datacenter selector embedded in the nonce.
///
/// The absolute value picks an endpoint pool; a negative value requests the
/// media pool of the same datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DcId(pub i16);

impl DcId {
    /// The pool this proxy routes to when a client names an unknown DC and
    /// the configuration permits rerouting it.
    pub const DEFAULT: DcId = DcId(1);

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(i16::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    /// Pool index, 1-based.
    pub fn pool(self) -> u16 {
        self.0.unsigned_abs()
    }

    pub fn is_media(self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for DcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
