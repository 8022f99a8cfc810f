//! L2 frame codec — length-prefixed encrypted frames.
//!
//! Wire layout: `LENGTH(le4) | SEQNUM(le4) | CIPHERTEXT`. LENGTH counts
//! the seqnum and ciphertext but not itself. The 32-bit seqnum doubles as
//! the AEAD nonce: its four little-endian bytes followed by 20 zero bytes.
//! Each direction of a session encrypts under its own key.
//!
//! A frame that fails authentication is dropped by the caller, never
//! fatal: noise on the wire must not kill the session.

use bytes::{Buf, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LE, U32};
use zerocopy::AsBytes;

use crate::keys::SessionKeys;
use crate::record::{EncodingError, Record};

/// AEAD nonce length (XChaCha20-Poly1305, the secretbox shape).
pub const NONCE_SIZE: usize = 24;
/// AEAD authentication tag, appended to every ciphertext.
pub const TAG_SIZE: usize = 16;
/// Bytes preceding the ciphertext on the wire.
pub const HEADER_SIZE: usize = 8;

/// Largest body the codec will seal. Leaves slack under the u32 LENGTH
/// field for the seqnum and the authentication tag.
pub const MAX_BODY_SIZE: usize = (u32::MAX as usize) - 100;

/// Seqnum of negotiation handshake frames. Never carries a record.
pub const HANDSHAKE_SEQNUM: u32 = u32::MAX;
/// Seqnum of the leader's selection marker. Never carries a record.
pub const SELECT_SEQNUM: u32 = u32::MAX - 1;

/// On-wire frame header.
#[derive(Debug, Clone, Copy, AsBytes)]
#[repr(C)]
pub struct FrameHeader {
    /// Length of everything after this field: 4 (seqnum) + ciphertext.
    pub length: U32<LE>,
    /// Record seqnum, or one of the reserved negotiation values.
    pub seqnum: U32<LE>,
}

assert_eq_size!(FrameHeader, [u8; HEADER_SIZE]);

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame authentication failed (seqnum {seqnum})")]
    Auth { seqnum: u32 },
    #[error("seqnum {0} is reserved for negotiation frames")]
    ReservedSeqnum(u32),
    #[error("body of {0} bytes exceeds the frame size limit")]
    Oversize(usize),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

fn nonce_for(seqnum: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&seqnum.to_le_bytes());
    nonce
}

/// Both directional AEAD instances for one session.
///
/// Sealing uses the outbound key, opening the inbound key. Clones share
/// no mutable state: the nonce is always supplied by the caller.
#[derive(Clone)]
pub struct FrameCipher {
    seal: XChaCha20Poly1305,
    open: XChaCha20Poly1305,
}

impl FrameCipher {
    pub fn new(keys: &SessionKeys) -> FrameCipher {
        FrameCipher {
            seal: XChaCha20Poly1305::new(keys.outbound.as_bytes().into()),
            open: XChaCha20Poly1305::new(keys.inbound.as_bytes().into()),
        }
    }

    /// Seal an arbitrary body into a complete wire frame under `seqnum`.
    ///
    /// Used directly only for the negotiation frames that live on the
    /// reserved seqnums; records go through [`FrameCipher::seal_record`].
    pub fn seal_raw(&self, seqnum: u32, body: &[u8]) -> Result<Bytes, FrameError> {
        if body.len() > MAX_BODY_SIZE {
            return Err(FrameError::Oversize(body.len()));
        }
        let nonce = nonce_for(seqnum);
        let ciphertext = self
            .seal
            .encrypt(XNonce::from_slice(&nonce), body)
            .expect("frame encryption failed");
        let header = FrameHeader {
            length: U32::new((4 + ciphertext.len()) as u32),
            seqnum: U32::new(seqnum),
        };
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame.freeze())
    }

    /// Seal a record under a real (non-reserved) seqnum.
    pub fn seal_record(&self, seqnum: u32, record: &Record) -> Result<Bytes, FrameError> {
        if seqnum >= SELECT_SEQNUM {
            return Err(FrameError::ReservedSeqnum(seqnum));
        }
        self.seal_raw(seqnum, &record.encode_body())
    }

    /// Authenticate and decrypt a frame body.
    pub fn open_raw(&self, seqnum: u32, ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        let nonce = nonce_for(seqnum);
        self.open
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| FrameError::Auth { seqnum })
    }

    /// Authenticate, decrypt, and parse a record frame.
    pub fn open_record(&self, seqnum: u32, ciphertext: &[u8]) -> Result<Record, FrameError> {
        let body = self.open_raw(seqnum, ciphertext)?;
        Ok(Record::decode_body(&body)?)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher(..)")
    }
}

/// A complete frame extracted from the inbound stream, not yet decrypted.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub seqnum: u32,
    pub ciphertext: Bytes,
}

/// Greedy parser for the inbound byte stream.
///
/// Buffers raw bytes and yields complete frames as they arrive; a partial
/// frame waits for more input.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// A frame whose LENGTH is below 4 cannot hold a seqnum; it is
    /// consumed and skipped so one malformed frame cannot wedge the
    /// stream.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            if self.buf.len() < 4 {
                return None;
            }
            let length =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + length {
                return None;
            }
            self.buf.advance(4);
            let mut frame = self.buf.split_to(length);
            if length < 4 {
                continue;
            }
            let seqnum = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            frame.advance(4);
            return Some(RawFrame {
                seqnum,
                ciphertext: frame.freeze(),
            });
        }
    }

    /// Buffered bytes not yet consumed as frames.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
