//! Shared proxy secret
//!
//! A secret is a 16-byte key plus the fronting hostname, tagged with the
//! version byte `0xee` (faketls-with-domain). Two encodings circulate in
//! the wild and both are accepted: `ee` + 32 hex digits + hex(hostname),
//! and base64url of the same raw bytes. Anything else is rejected at
//! configuration time.

use base64::engine::general_purpose::{URL_SAFE_NO_PAD, URL_SAFE};
use base64::Engine as _;
use rand::RngCore;

use crate::error::{Error, Result};

/// Version tag of the faketls-with-domain secret format.
const SECRET_TAG: u8 = 0xee;

/// Key bytes inside a secret.
pub const SECRET_KEY_LEN: usize = 16;

/// Shared authenticator and fronting target.
///
/// The hostname serves double duty: it is the SNI a conforming client bakes
/// into its hello, and the host unrecognized traffic is spliced to.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub key: [u8; SECRET_KEY_LEN],
    pub host: String,
}

impl Secret {
    /// Generate a fresh secret for `host`.
    pub fn generate(host: &str) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::Secret("hostname must not be empty".into()));
        }
        let mut key = [0u8; SECRET_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(Self {
            key,
            host: host.to_string(),
        })
    }

    /// Parse either accepted encoding.
    pub fn parse(s: &str) -> Result<Self> {
        let raw = if s.len() >= 2 && s[..2].eq_ignore_ascii_case("ee") && s.len() % 2 == 0 {
            hex_decode(s)?
        } else {
            URL_SAFE_NO_PAD
                .decode(s)
                .or_else(|_| URL_SAFE.decode(s))
                .map_err(|_| Error::Secret("neither hex nor base64".into()))?
        };

        if raw.len() <= 1 + SECRET_KEY_LEN {
            return Err(Error::Secret("too short".into()));
        }
        if raw[0] != SECRET_TAG {
            return Err(Error::Secret(format!(
                "unsupported secret type 0x{:02x}",
                raw[0]
            )));
        }

        let mut key = [0u8; SECRET_KEY_LEN];
        key.copy_from_slice(&raw[1..1 + SECRET_KEY_LEN]);
        let host = String::from_utf8(raw[1 + SECRET_KEY_LEN..].to_vec())
            .map_err(|_| Error::Secret("hostname is not valid utf-8".into()))?;
        if host.is_empty() {
            return Err(Error::Secret("hostname must not be empty".into()));
        }

        Ok(Self { key, host })
    }

    fn raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(1 + SECRET_KEY_LEN + self.host.len());
        raw.push(SECRET_TAG);
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(self.host.as_bytes());
        raw
    }

    /// Canonical hex form: `ee` + key + hostname bytes, all lowercase hex.
    pub fn to_hex(&self) -> String {
        let raw = self.raw();
        let mut out = String::with_capacity(raw.len() * 2);
        for b in raw {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// base64url form of the same bytes, no padding.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.raw())
    }
}

impl std::str::FromStr for Secret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Key material stays out of Debug output and logs.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("key", &"[redacted]")
            .field("host", &self.host)
            .finish()
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_val(pair[0])?;
        let lo = hex_val(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Secret("invalid hex digit".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_form() {
        let s = Secret::parse("ee000102030405060708090a0b0c0d0e0f6578616d706c652e636f6d").unwrap();
        assert_eq!(
            s.key,
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
        assert_eq!(s.host, "example.com");
    }

    #[test]
    fn test_parse_base64_form() {
        let original = Secret::generate("front.example.org").unwrap();
        let parsed = Secret::parse(&original.to_base64()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_hex_roundtrip() {
        let original = Secret::generate("front.example.org").unwrap();
        let parsed = Secret::parse(&original.to_hex()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_rejects_wrong_tag() {
        // "dd" secrets (no embedded domain) are a different, unsupported kind.
        let err = Secret::parse("dd000102030405060708090a0b0c0d0e0f6578616d706c652e636f6d");
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_short_and_garbage() {
        assert!(Secret::parse("").is_err());
        assert!(Secret::parse("ee0001").is_err());
        assert!(Secret::parse("not a secret at all!").is_err());
        // Key only, no hostname.
        assert!(Secret::parse("ee000102030405060708090a0b0c0d0e0f").is_err());
    }

    #[test]
    fn test_generate_distinct_keys() {
        let a = Secret::generate("example.com").unwrap();
        let b = Secret::generate("example.com").unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_debug_redacts_key() {
        let s = Secret::generate("example.com").unwrap();
        let dbg = format!("{:?}", s);
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains(&s.to_hex()[2..34]));
    }
}
