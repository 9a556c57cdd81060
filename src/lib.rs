//! mtrelay - a transparent MTProto relay
//!
//! Clients speak an obfuscated, TLS-shaped transport keyed to a shared
//! secret; the relay authenticates them implicitly, opens an obfuscated
//! session to the right datacenter, and splices frames between the two
//! legs. Anything that fails the handshake is forwarded byte-for-byte to a
//! real fronting host, so a probe sees an ordinary TLS endpoint.
//!
//! # Architecture (Layered)
//!
//! ```text
//! Transport (TCP dial, DC endpoint pools)
//! → Protocol (64-byte nonce handshake, AES-CTR framing codec)
//! → Defense (anti-replay gate, source-IP gate)
//! → App (accept loop, stream context, relay pumps, events)
//! ```
//!
//! ## Core Principles
//!
//! - Each connection owns its cipher states; nothing mutable is shared on
//!   the data path beyond the anti-replay filter and IP snapshots
//! - Rejections are indistinguishable on the wire: same path, same timing,
//!   ending at the fronting host
//! - Collaborators (anti-replay, IP lists, event observers) are traits;
//!   the core depends on capabilities, not implementations
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── crypto/          # AES-256-CTR stream cipher, key derivation
//! ├── protocol/        # nonce handshake, framing codec (3 modes)
//! ├── transport/       # dialer, DC endpoint tables, session opener
//! ├── defense/         # anti-replay filter, allow/block IP lists
//! └── app/             # proxy loop, relay pumps, events, metrics
//! ```

// Core types
pub mod config;
pub mod error;
pub mod secret;

// Layered architecture
pub mod app;
pub mod crypto;
pub mod defense;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use app::{Event, EventObserver, EventStream, Proxy};
pub use config::Config;
pub use error::{Error, Result};
pub use secret::Secret;
