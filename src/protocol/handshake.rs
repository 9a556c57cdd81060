//! Obfuscated nonce handshake
//!
//! Both legs of a relayed connection open with a 64-byte nonce. On the
//! client leg we are the recognizing side: the nonce carries the key
//! material for both directions, and its hidden suffix only decrypts to a
//! valid protocol tag when the client holds the shared secret. On the
//! upstream leg we are the producing side: we forge a fresh nonce of the
//! same shape (sans secret) and speak intermediate framing regardless of
//! what the client negotiated.
//!
//! There is no equality check against the secret anywhere; a wrong secret
//! simply decrypts to an unrecognized tag and the caller falls back to
//! domain fronting. Classification is pure byte inspection, so every reject
//! reason takes the same code path and the same time.

use crate::crypto::{derive_stream_key, random_bytes, CtrCipher, IV_SIZE, KEY_SIZE};
use crate::secret::Secret;

use super::{DcId, FrameMode, NONCE_LEN, TAG_INTERMEDIATE};

/// First-int values a forged nonce must avoid so the upstream never
/// mistakes it for a plain transport or an HTTP request.
const FORBIDDEN_PREFIXES: [[u8; 4]; 7] = [
    [b'H', b'E', b'A', b'D'],
    [b'P', b'O', b'S', b'T'],
    [b'G', b'E', b'T', b' '],
    [b'O', b'P', b'T', b'I'],
    [0x16, 0x03, 0x01, 0x02],
    [0xdd, 0xdd, 0xdd, 0xdd],
    [0xee, 0xee, 0xee, 0xee],
];

// ============================================================================
// Client leg: recognition
// ============================================================================

/// Why a client hello was not recognized. Coarse by design: these reach the
/// event stream and the logs, never the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ShortRead,
    UnknownTag,
    UnknownDc,
    Replayed,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortRead => "short-read",
            Self::UnknownTag => "unknown-tag",
            Self::UnknownDc => "unknown-dc",
            Self::Replayed => "replayed",
        }
    }
}

/// Outcome of recognizing a client nonce.
#[derive(Debug)]
pub struct ClientHandshake {
    /// Framing the client negotiated; the reverse leg answers in kind.
    pub mode: FrameMode,
    /// Datacenter the client asked for, sign intact.
    pub dc: DcId,
    /// client -> proxy cipher, already advanced past the 64 nonce bytes.
    pub decryptor: CtrCipher,
    /// proxy -> client cipher, at stream position zero.
    pub encryptor: CtrCipher,
    /// Forward key seed, the anti-replay fingerprint of this handshake.
    pub key_seed: [u8; KEY_SIZE],
}

/// Classify a client nonce against the shared secret.
///
/// Derives the trial forward key, decrypts the nonce in one CTR pass and
/// inspects the hidden suffix: four identical tag bytes, then the DC id.
/// The forward cipher leaves this function positioned exactly past the
/// nonce, so the first inner frame deframes directly off the stream.
pub fn classify(nonce: &[u8; NONCE_LEN], secret: &Secret) -> Result<ClientHandshake, RejectReason> {
    let mut key_seed = [0u8; KEY_SIZE];
    key_seed.copy_from_slice(&nonce[8..40]);
    let fwd_key = derive_stream_key(&key_seed, &secret.key);
    let fwd_iv: [u8; IV_SIZE] = nonce[40..56].try_into().expect("slice length");

    let mut decryptor = CtrCipher::new(&fwd_key, &fwd_iv);
    let mut plain = *nonce;
    decryptor.apply(&mut plain);

    let mode = FrameMode::from_tag(&plain[56..60]).ok_or(RejectReason::UnknownTag)?;
    let dc = DcId::from_le_bytes([plain[60], plain[61]]);

    let (rev_key, rev_iv) = reverse_key_material(nonce);
    let rev_key = derive_stream_key(&rev_key, &secret.key);
    let encryptor = CtrCipher::new(&rev_key, &rev_iv);

    Ok(ClientHandshake {
        mode,
        dc,
        decryptor,
        encryptor,
        key_seed,
    })
}

/// The reverse direction keys off the byte-reversed middle of the nonce.
fn reverse_key_material(nonce: &[u8; NONCE_LEN]) -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
    let mut rev = [0u8; 48];
    for (dst, src) in rev.iter_mut().zip(nonce[8..56].iter().rev()) {
        *dst = *src;
    }
    let seed: [u8; KEY_SIZE] = rev[..32].try_into().expect("slice length");
    let iv: [u8; IV_SIZE] = rev[32..48].try_into().expect("slice length");
    (seed, iv)
}

// ============================================================================
// Upstream leg: production
// ============================================================================

/// A forged upstream nonce with the cipher pair it establishes.
pub struct UpstreamHandshake {
    /// The 64 bytes to put on the wire, suffix already encrypted in place.
    pub frame: [u8; NONCE_LEN],
    /// proxy -> upstream cipher, already advanced past the nonce.
    pub encryptor: CtrCipher,
    /// upstream -> proxy cipher, at stream position zero.
    pub decryptor: CtrCipher,
}

/// Forge a fresh upstream nonce for `dc`.
///
/// The first 56 bytes are random, re-rolled until they cannot be mistaken
/// for a plain transport prefix; the hidden suffix pins intermediate
/// framing and names the DC. Unlike the client leg, the upstream keys are
/// the raw nonce bytes with no secret in the derivation.
pub fn forge_upstream_nonce(dc: DcId) -> UpstreamHandshake {
    let mut plain = [0u8; NONCE_LEN];
    loop {
        random_bytes(&mut plain);
        if plain[0] != super::TAG_ABRIDGED
            && plain[4..8] != [0u8; 4]
            && !FORBIDDEN_PREFIXES.iter().any(|p| p == &plain[..4])
        {
            break;
        }
    }

    plain[56..60].fill(TAG_INTERMEDIATE);
    plain[60..62].copy_from_slice(&dc.to_le_bytes());

    let fwd_key: [u8; KEY_SIZE] = plain[8..40].try_into().expect("slice length");
    let fwd_iv: [u8; IV_SIZE] = plain[40..56].try_into().expect("slice length");
    let mut encryptor = CtrCipher::new(&fwd_key, &fwd_iv);

    let (rev_key, rev_iv) = reverse_key_material(&plain);
    let decryptor = CtrCipher::new(&rev_key, &rev_iv);

    // Only the suffix travels encrypted; the prefix stays as generated so
    // the whole frame still looks like 64 random bytes.
    let mut encrypted = plain;
    encryptor.apply(&mut encrypted);
    let mut frame = plain;
    frame[56..64].copy_from_slice(&encrypted[56..64]);

    UpstreamHandshake {
        frame,
        encryptor,
        decryptor,
    }
}

// ============================================================================
// Tests
// ============================================================================

/// Build a client nonce the way a real client does: pick random key
/// material, then encrypt the tag/DC suffix under the forward cipher.
#[cfg(test)]
pub(crate) fn client_nonce(secret: &Secret, tag: u8, dc: DcId) -> [u8; NONCE_LEN] {
    let mut plain = [0u8; NONCE_LEN];
    random_bytes(&mut plain);
    plain[56..60].fill(tag);
    plain[60..62].copy_from_slice(&dc.to_le_bytes());

    let seed: [u8; KEY_SIZE] = plain[8..40].try_into().unwrap();
    let iv: [u8; IV_SIZE] = plain[40..56].try_into().unwrap();
    let key = derive_stream_key(&seed, &secret.key);
    let mut cipher = CtrCipher::new(&key, &iv);

    let mut encrypted = plain;
    cipher.apply(&mut encrypted);
    let mut nonce = plain;
    nonce[56..64].copy_from_slice(&encrypted[56..64]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TAG_ABRIDGED, TAG_PADDED_INTERMEDIATE};

    fn test_secret() -> Secret {
        Secret {
            key: *b"0123456789abcdef",
            host: "example.com".to_string(),
        }
    }

    #[test]
    fn test_classify_valid_abridged() {
        let secret = test_secret();
        let nonce = client_nonce(&secret, TAG_ABRIDGED, DcId(2));
        let hs = classify(&nonce, &secret).unwrap();
        assert_eq!(hs.mode, FrameMode::Abridged);
        assert_eq!(hs.dc, DcId(2));
        assert_eq!(&hs.key_seed[..], &nonce[8..40]);
    }

    #[test]
    fn test_classify_valid_padded_media_dc() {
        let secret = test_secret();
        let nonce = client_nonce(&secret, TAG_PADDED_INTERMEDIATE, DcId(-4));
        let hs = classify(&nonce, &secret).unwrap();
        assert_eq!(hs.mode, FrameMode::PaddedIntermediate);
        assert_eq!(hs.dc, DcId(-4));
        assert!(hs.dc.is_media());
    }

    #[test]
    fn test_classify_rejects_wrong_secret() {
        let secret = test_secret();
        let other = Secret {
            key: *b"fedcba9876543210",
            host: "example.com".to_string(),
        };
        let nonce = client_nonce(&secret, TAG_ABRIDGED, DcId(2));
        assert_eq!(classify(&nonce, &other).unwrap_err(), RejectReason::UnknownTag);
    }

    #[test]
    fn test_classify_rejects_garbage() {
        let secret = test_secret();
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce);
        // A random nonce decrypting to a valid tag is a 2^-30 accident.
        assert!(classify(&nonce, &secret).is_err());
    }

    #[test]
    fn test_cipher_continuation_past_nonce() {
        // After classification, the forward cipher must sit exactly past the
        // 64 nonce bytes: encrypt a follow-up chunk client-side and check the
        // recognizer's decryptor opens it.
        let secret = test_secret();
        let plain_payload = *b"deadbeefcafe";

        let mut plain = [0u8; NONCE_LEN];
        random_bytes(&mut plain);
        plain[56..60].fill(TAG_ABRIDGED);
        plain[60..62].copy_from_slice(&DcId(1).to_le_bytes());
        let seed: [u8; KEY_SIZE] = plain[8..40].try_into().unwrap();
        let iv: [u8; IV_SIZE] = plain[40..56].try_into().unwrap();
        let key = derive_stream_key(&seed, &secret.key);
        let mut client_cipher = CtrCipher::new(&key, &iv);

        let mut encrypted = plain;
        client_cipher.apply(&mut encrypted);
        let mut nonce = plain;
        nonce[56..64].copy_from_slice(&encrypted[56..64]);

        let mut tail = plain_payload;
        client_cipher.apply(&mut tail);

        let mut hs = classify(&nonce, &secret).unwrap();
        hs.decryptor.apply(&mut tail);
        assert_eq!(tail, plain_payload);
    }

    #[test]
    fn test_forward_and_reverse_are_independent() {
        let secret = test_secret();
        let nonce = client_nonce(&secret, TAG_ABRIDGED, DcId(1));
        let mut hs = classify(&nonce, &secret).unwrap();

        let sample = *b"0000111122223333";
        let mut fwd = sample;
        let mut rev = sample;
        hs.decryptor.apply(&mut fwd);
        hs.encryptor.apply(&mut rev);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_forged_nonce_avoids_plain_prefixes() {
        for _ in 0..64 {
            let hs = forge_upstream_nonce(DcId(2));
            assert_ne!(hs.frame[0], TAG_ABRIDGED);
            assert_ne!(&hs.frame[4..8], &[0u8; 4]);
            assert!(!FORBIDDEN_PREFIXES.iter().any(|p| p == &hs.frame[..4]));
        }
    }

    #[test]
    fn test_forged_nonce_decrypts_on_the_far_side() {
        // Play the upstream role: derive keys from the received frame and
        // check the hidden suffix names intermediate framing and the DC.
        let hs = forge_upstream_nonce(DcId(-3));

        let seed: [u8; KEY_SIZE] = hs.frame[8..40].try_into().unwrap();
        let iv: [u8; IV_SIZE] = hs.frame[40..56].try_into().unwrap();
        let mut upstream_view = CtrCipher::new(&seed, &iv);

        let mut plain = hs.frame;
        upstream_view.apply(&mut plain);
        assert_eq!(FrameMode::from_tag(&plain[56..60]), Some(FrameMode::Intermediate));
        assert_eq!(DcId::from_le_bytes([plain[60], plain[61]]), DcId(-3));
    }

    #[test]
    fn test_forged_nonces_are_unique() {
        let a = forge_upstream_nonce(DcId(1));
        let b = forge_upstream_nonce(DcId(1));
        assert_ne!(a.frame[8..40], b.frame[8..40]);
    }
}
