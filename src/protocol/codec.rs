//! Obfuscated framing codec
//!
//! One `FrameReader`/`FrameWriter` pair exists per direction. Each owns its
//! half of the socket and its AES-CTR state; the cipher advances by exactly
//! the bytes moved on the wire, length prefixes and padding included, so the
//! keystream never desynchronizes from the peer.
//!
//! Three framings, selected by the client's protocol tag:
//!
//! - **Abridged**: 1-byte length (payload/4) when payload/4 < 0x7f, else the
//!   marker `0x7f` followed by a 3-byte little-endian payload/4.
//! - **Intermediate**: 4-byte little-endian byte length.
//! - **Padded intermediate**: as intermediate, with 0-3 random tail bytes
//!   counted in the length and dropped by the receiver.

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::CtrCipher;
use crate::error::{Error, Result};

use super::{MAX_FRAME_LEN, TAG_ABRIDGED, TAG_INTERMEDIATE, TAG_PADDED_INTERMEDIATE};

/// Marker byte introducing the 3-byte abridged length form.
const ABRIDGED_LONG_MARKER: u8 = 0x7f;

// ============================================================================
// Frame mode
// ============================================================================

/// Inner framing negotiated by the client's protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Abridged,
    Intermediate,
    PaddedIntermediate,
}

impl FrameMode {
    /// Recognize a decrypted 4-byte protocol tag. All four bytes must be
    /// identical and from the known set.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        if tag.len() != 4 || tag[1..].iter().any(|b| *b != tag[0]) {
            return None;
        }
        match tag[0] {
            TAG_ABRIDGED => Some(Self::Abridged),
            TAG_INTERMEDIATE => Some(Self::Intermediate),
            TAG_PADDED_INTERMEDIATE => Some(Self::PaddedIntermediate),
            _ => None,
        }
    }

    pub fn tag_byte(self) -> u8 {
        match self {
            Self::Abridged => TAG_ABRIDGED,
            Self::Intermediate => TAG_INTERMEDIATE,
            Self::PaddedIntermediate => TAG_PADDED_INTERMEDIATE,
        }
    }
}

impl std::fmt::Display for FrameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Abridged => "abridged",
            Self::Intermediate => "intermediate",
            Self::PaddedIntermediate => "padded-intermediate",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Decrypting, deframing half of one direction.
pub struct FrameReader<R> {
    io: R,
    cipher: CtrCipher,
    mode: FrameMode,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, cipher: CtrCipher, mode: FrameMode) -> Self {
        Self {
            io,
            cipher,
            mode,
            buf: BytesMut::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Read one frame. `Ok(None)` is a clean EOF at a frame boundary; EOF
    /// inside a frame is an error. The returned payload has padding already
    /// stripped.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let (len, pad) = match self.mode {
            FrameMode::Abridged => match self.read_abridged_len().await? {
                Some(len) => (len, 0),
                None => return Ok(None),
            },
            FrameMode::Intermediate | FrameMode::PaddedIntermediate => {
                let mut header = [0u8; 4];
                if !self.fill(&mut header, true).await? {
                    return Ok(None);
                }
                self.cipher.apply(&mut header);
                let len = u32::from_le_bytes(header) as usize;
                let pad = if self.mode == FrameMode::PaddedIntermediate {
                    len % 4
                } else {
                    0
                };
                (len, pad)
            }
        };

        if len > MAX_FRAME_LEN {
            return Err(Error::Framing(format!("frame of {} bytes exceeds limit", len)));
        }

        self.buf.clear();
        self.buf.resize(len, 0);
        if len > 0 && !self.fill_buf_exact(len).await? {
            return Err(Error::Framing("connection closed mid-frame".into()));
        }
        self.cipher.apply(&mut self.buf[..]);
        self.buf.truncate(len - pad);

        Ok(Some(self.buf.split().freeze()))
    }

    /// Abridged length prefix: one decrypted byte, or `0x7f` plus three more.
    /// Returns the payload length in bytes.
    async fn read_abridged_len(&mut self) -> Result<Option<usize>> {
        let mut first = [0u8; 1];
        if !self.fill(&mut first, true).await? {
            return Ok(None);
        }
        self.cipher.apply(&mut first);

        let words = if first[0] < ABRIDGED_LONG_MARKER {
            first[0] as usize
        } else if first[0] == ABRIDGED_LONG_MARKER {
            let mut ext = [0u8; 3];
            if !self.fill(&mut ext, false).await? {
                return Err(Error::Framing("connection closed mid-frame".into()));
            }
            self.cipher.apply(&mut ext);
            u32::from_le_bytes([ext[0], ext[1], ext[2], 0]) as usize
        } else {
            return Err(Error::Framing(format!(
                "bad abridged length byte 0x{:02x}",
                first[0]
            )));
        };

        if words == 0 {
            return Err(Error::Framing("zero-length abridged frame".into()));
        }

        Ok(Some(words * 4))
    }

    /// Read exactly `buf.len()` bytes. When `eof_ok` and the peer closed
    /// before the first byte, returns `Ok(false)`.
    async fn fill(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<bool> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.io.read(&mut buf[pos..]).await?;
            if n == 0 {
                if pos == 0 && eof_ok {
                    return Ok(false);
                }
                return Err(Error::Framing("connection closed mid-frame".into()));
            }
            pos += n;
        }
        Ok(true)
    }

    async fn fill_buf_exact(&mut self, len: usize) -> Result<bool> {
        let mut pos = 0;
        while pos < len {
            let n = self.io.read(&mut self.buf[pos..len]).await?;
            if n == 0 {
                return Ok(false);
            }
            pos += n;
        }
        Ok(true)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Framing, encrypting half of one direction.
pub struct FrameWriter<W> {
    io: W,
    cipher: CtrCipher,
    mode: FrameMode,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, cipher: CtrCipher, mode: FrameMode) -> Self {
        Self {
            io,
            cipher,
            mode,
            scratch: BytesMut::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Frame, encrypt and write one payload. The scratch buffer is reused
    /// across calls; nothing is retained after the write completes.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::Framing(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }

        self.scratch.clear();
        match self.mode {
            FrameMode::Abridged => {
                if payload.is_empty() || payload.len() % 4 != 0 {
                    return Err(Error::Framing(format!(
                        "abridged payload of {} bytes is not a positive multiple of 4",
                        payload.len()
                    )));
                }
                let words = payload.len() / 4;
                if words < ABRIDGED_LONG_MARKER as usize {
                    self.scratch.extend_from_slice(&[words as u8]);
                } else {
                    let le = (words as u32).to_le_bytes();
                    self.scratch.extend_from_slice(&[ABRIDGED_LONG_MARKER, le[0], le[1], le[2]]);
                }
                self.scratch.extend_from_slice(payload);
            }
            FrameMode::Intermediate => {
                self.scratch
                    .extend_from_slice(&(payload.len() as u32).to_le_bytes());
                self.scratch.extend_from_slice(payload);
            }
            FrameMode::PaddedIntermediate => {
                let pad = rand::thread_rng().gen_range(0..4usize);
                self.scratch
                    .extend_from_slice(&((payload.len() + pad) as u32).to_le_bytes());
                self.scratch.extend_from_slice(payload);
                let mut tail = [0u8; 3];
                crate::crypto::random_bytes(&mut tail[..pad]);
                self.scratch.extend_from_slice(&tail[..pad]);
            }
        }

        self.cipher.apply(&mut self.scratch[..]);
        self.io.write_all(&self.scratch).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the underlying socket.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CtrCipher, IV_SIZE, KEY_SIZE};

    fn cipher_pair() -> (CtrCipher, CtrCipher) {
        let key = [0x42u8; KEY_SIZE];
        let iv = [0x24u8; IV_SIZE];
        (CtrCipher::new(&key, &iv), CtrCipher::new(&key, &iv))
    }

    async fn roundtrip(mode: FrameMode, payloads: &[Vec<u8>]) -> Vec<Bytes> {
        let (client, server) = tokio::io::duplex(MAX_FRAME_LEN * 2);
        let (enc, dec) = cipher_pair();
        let mut writer = FrameWriter::new(client, enc, mode);
        let mut reader = FrameReader::new(server, dec, mode);

        for p in payloads {
            writer.write_frame(p).await.unwrap();
        }
        drop(writer);

        let mut out = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn test_abridged_roundtrip() {
        let payloads = vec![vec![1u8; 4], vec![2u8; 0x7e * 4], vec![3u8; 0x7f * 4]];
        let frames = roundtrip(FrameMode::Abridged, &payloads).await;
        assert_eq!(frames.len(), 3);
        for (frame, payload) in frames.iter().zip(&payloads) {
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_abridged_long_form_boundary() {
        // 0x7f words is the first length that needs the extended form.
        let payload = vec![9u8; 0x7f * 4];
        let frames = roundtrip(FrameMode::Abridged, &[payload.clone()]).await;
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[tokio::test]
    async fn test_intermediate_roundtrip() {
        let payloads = vec![vec![7u8; 17], vec![8u8; 20], vec![9u8; 4097]];
        let frames = roundtrip(FrameMode::Intermediate, &payloads).await;
        assert_eq!(frames.len(), 3);
        for (frame, payload) in frames.iter().zip(&payloads) {
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_intermediate_keepalive() {
        let frames = roundtrip(FrameMode::Intermediate, &[vec![]]).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[tokio::test]
    async fn test_padded_intermediate_strips_padding() {
        let payloads = vec![vec![1u8; 17], vec![2u8; 20], vec![3u8; 4097]];
        // Padding is random per frame; run a few times to cover 0..=3.
        for _ in 0..8 {
            let frames = roundtrip(FrameMode::PaddedIntermediate, &payloads).await;
            assert_eq!(frames.len(), 3);
            for (frame, payload) in frames.iter().zip(&payloads) {
                assert_eq!(&frame[..], &payload[..]);
            }
        }
    }

    #[tokio::test]
    async fn test_abridged_rejects_unaligned_payload() {
        let (client, _server) = tokio::io::duplex(64);
        let (enc, _) = cipher_pair();
        let mut writer = FrameWriter::new(client, enc, FrameMode::Abridged);
        assert!(writer.write_frame(&[0u8; 5]).await.is_err());
        assert!(writer.write_frame(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (enc, dec) = cipher_pair();

        // Hand-craft an intermediate header claiming 2 MiB.
        let mut header = ((2 * MAX_FRAME_LEN) as u32).to_le_bytes();
        let mut enc = enc;
        enc.apply(&mut header);
        let mut client = client;
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let mut reader = FrameReader::new(server, dec, FrameMode::Intermediate);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_clean() {
        let (client, server) = tokio::io::duplex(64);
        let (enc, dec) = cipher_pair();
        let mut writer = FrameWriter::new(client, enc, FrameMode::Intermediate);
        writer.write_frame(b"ping").await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server, dec, FrameMode::Intermediate);
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"ping");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (client, server) = tokio::io::duplex(64);
        let (mut enc, dec) = cipher_pair();

        let mut partial = Vec::from(100u32.to_le_bytes());
        partial.extend_from_slice(&[0u8; 10]);
        enc.apply(&mut partial);
        let mut client = client;
        tokio::io::AsyncWriteExt::write_all(&mut client, &partial)
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, dec, FrameMode::Intermediate);
        assert!(reader.read_frame().await.is_err());
    }

    #[test]
    fn test_tag_recognition() {
        assert_eq!(FrameMode::from_tag(&[0xef; 4]), Some(FrameMode::Abridged));
        assert_eq!(FrameMode::from_tag(&[0xee; 4]), Some(FrameMode::Intermediate));
        assert_eq!(
            FrameMode::from_tag(&[0xdd; 4]),
            Some(FrameMode::PaddedIntermediate)
        );
        assert_eq!(FrameMode::from_tag(&[0x11, 0x22, 0x33, 0x44]), None);
        assert_eq!(FrameMode::from_tag(&[0xef, 0xef, 0xef, 0xee]), None);
        assert_eq!(FrameMode::from_tag(&[0xaa; 4]), None);
    }
}
