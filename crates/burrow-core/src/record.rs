//! Record bodies — the plaintext payloads carried inside L2 frames.
//!
//! Body byte 0 is the tag; all multi-byte integers are little-endian.
//! DATA carries no explicit payload length: the enclosing frame already
//! has one.

use bytes::Bytes;

/// Subchannel identifier. Id 0 is reserved for the control channel; the
/// leader allocates odd ids, the follower even ids.
pub type SubchannelId = u32;

pub const CONTROL_CHANNEL_ID: SubchannelId = 0;

pub const TAG_PING: u8 = 0x00;
pub const TAG_ACK: u8 = 0x01;
pub const TAG_OPEN: u8 = 0x02;
pub const TAG_DATA: u8 = 0x03;
pub const TAG_CLOSE: u8 = 0x04;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unknown record tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("record body truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("record tag 0x{tag:02x} followed by {extra} unexpected trailing bytes")]
    TrailingBytes { tag: u8, extra: usize },
}

/// One logical payload of the durable session.
///
/// PING exercises liveness and is acknowledged like any other record.
/// ACK is the only record that is itself never acknowledged or queued
/// for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ping,
    Ack { acked_seqnum: u32 },
    Open { subchannel_id: SubchannelId },
    Data { subchannel_id: SubchannelId, payload: Bytes },
    Close { subchannel_id: SubchannelId },
}

impl Record {
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Record::Ping => vec![TAG_PING],
            Record::Ack { acked_seqnum } => {
                let mut body = Vec::with_capacity(5);
                body.push(TAG_ACK);
                body.extend_from_slice(&acked_seqnum.to_le_bytes());
                body
            }
            Record::Open { subchannel_id } => {
                let mut body = Vec::with_capacity(5);
                body.push(TAG_OPEN);
                body.extend_from_slice(&subchannel_id.to_le_bytes());
                body
            }
            Record::Data {
                subchannel_id,
                payload,
            } => {
                let mut body = Vec::with_capacity(5 + payload.len());
                body.push(TAG_DATA);
                body.extend_from_slice(&subchannel_id.to_le_bytes());
                body.extend_from_slice(payload);
                body
            }
            Record::Close { subchannel_id } => {
                let mut body = Vec::with_capacity(5);
                body.push(TAG_CLOSE);
                body.extend_from_slice(&subchannel_id.to_le_bytes());
                body
            }
        }
    }

    /// Parse a decrypted body. Never panics on hostile input.
    pub fn decode_body(body: &[u8]) -> Result<Record, EncodingError> {
        let (&tag, rest) = body.split_first().ok_or(EncodingError::Truncated {
            need: 1,
            have: 0,
        })?;
        match tag {
            TAG_PING => {
                expect_empty(tag, rest)?;
                Ok(Record::Ping)
            }
            TAG_ACK => {
                let (value, rest) = take_le4(rest)?;
                expect_empty(tag, rest)?;
                Ok(Record::Ack {
                    acked_seqnum: value,
                })
            }
            TAG_OPEN => {
                let (value, rest) = take_le4(rest)?;
                expect_empty(tag, rest)?;
                Ok(Record::Open {
                    subchannel_id: value,
                })
            }
            TAG_DATA => {
                let (value, rest) = take_le4(rest)?;
                Ok(Record::Data {
                    subchannel_id: value,
                    payload: Bytes::copy_from_slice(rest),
                })
            }
            TAG_CLOSE => {
                let (value, rest) = take_le4(rest)?;
                expect_empty(tag, rest)?;
                Ok(Record::Close {
                    subchannel_id: value,
                })
            }
            other => Err(EncodingError::UnknownTag(other)),
        }
    }
}

fn take_le4(body: &[u8]) -> Result<(u32, &[u8]), EncodingError> {
    if body.len() < 4 {
        return Err(EncodingError::Truncated {
            need: 4,
            have: body.len(),
        });
    }
    let (head, rest) = body.split_at(4);
    Ok((u32::from_le_bytes([head[0], head[1], head[2], head[3]]), rest))
}

fn expect_empty(tag: u8, rest: &[u8]) -> Result<(), EncodingError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(EncodingError::TrailingBytes {
            tag,
            extra: rest.len(),
        })
    }
}
