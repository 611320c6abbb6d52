//! Framing: length-prefix (4 bytes LE) + body.
//! Message body is a 1-byte tag followed by big-endian fields; handshake body
//! is bincode with varint lengths.

use bincode::Options;

use crate::protocol::{
    Handshake, Message, TAG_BITFIELD, TAG_CANCEL, TAG_KEEPALIVE, TAG_PIECE_DATA,
    TAG_PIECE_REQUEST,
};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Upper bound on an encoded handshake body.
pub const MAX_HANDSHAKE_LEN: u32 = 1024 * 1024;

fn handshake_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
        .with_limit(u64::from(MAX_HANDSHAKE_LEN))
        .reject_trailing_bytes()
}

fn frame(body: Vec<u8>) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Split one frame off the front of `bytes`. Returns the body and bytes consumed.
fn unframe(bytes: &[u8], max_len: u32) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > max_len {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Encode a handshake into a single frame.
pub fn encode_handshake(hs: &Handshake) -> Result<Vec<u8>, FrameEncodeError> {
    let body = handshake_options()
        .serialize(hs)
        .map_err(FrameEncodeError::Encode)?;
    frame(body)
}

/// Decode one handshake frame from the front of `bytes`.
pub fn decode_handshake(bytes: &[u8]) -> Result<(Handshake, usize), FrameDecodeError> {
    let (body, n) = unframe(bytes, MAX_HANDSHAKE_LEN)?;
    let hs = handshake_options()
        .deserialize(body)
        .map_err(FrameDecodeError::Decode)?;
    Ok((hs, n))
}

/// Encode a message into a single frame: 4 bytes LE length + tag + fields.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut body = Vec::with_capacity(5);
    body.push(msg.tag());
    match msg {
        Message::BitfieldUpdate { bitfield } => body.extend_from_slice(bitfield),
        Message::PieceRequest { index } | Message::Cancel { index } => {
            body.extend_from_slice(&index.to_be_bytes())
        }
        Message::PieceData { index, payload } => {
            body.reserve(4 + payload.len());
            body.extend_from_slice(&index.to_be_bytes());
            body.extend_from_slice(payload);
        }
        Message::Keepalive => {}
    }
    frame(body)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8], max_len: u32) -> Result<(Message, usize), FrameDecodeError> {
    let (body, n) = unframe(bytes, max_len)?;
    let (&tag, rest) = body.split_first().ok_or(FrameDecodeError::Empty)?;
    let msg = match tag {
        TAG_BITFIELD => Message::BitfieldUpdate {
            bitfield: rest.to_vec(),
        },
        TAG_PIECE_REQUEST => Message::PieceRequest {
            index: exact_index(tag, rest)?,
        },
        TAG_CANCEL => Message::Cancel {
            index: exact_index(tag, rest)?,
        },
        TAG_PIECE_DATA => {
            if rest.len() < 4 {
                return Err(FrameDecodeError::Truncated(tag));
            }
            let (idx, payload) = rest.split_at(4);
            Message::PieceData {
                index: u32::from_be_bytes([idx[0], idx[1], idx[2], idx[3]]),
                payload: payload.to_vec(),
            }
        }
        TAG_KEEPALIVE => {
            if !rest.is_empty() {
                return Err(FrameDecodeError::Trailing(tag));
            }
            Message::Keepalive
        }
        other => return Err(FrameDecodeError::UnknownTag(other)),
    };
    Ok((msg, n))
}

fn exact_index(tag: u8, rest: &[u8]) -> Result<u32, FrameDecodeError> {
    let arr: [u8; 4] = rest
        .try_into()
        .map_err(|_| FrameDecodeError::Truncated(tag))?;
    Ok(u32::from_be_bytes(arr))
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("message with tag {0} has a malformed body")]
    Truncated(u8),
    #[error("unexpected trailing bytes after tag {0}")]
    Trailing(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
