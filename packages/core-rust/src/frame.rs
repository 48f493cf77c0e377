//! Socket framing codec for the upgraded (bidirectional) carrier.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! byte0: FIN(1) RSV(3) OPCODE(4)
//! byte1: MASK(1) LEN7(7)
//!   LEN7 < 126  -> payload length = LEN7
//!   LEN7 == 126 -> next 2 bytes hold the length
//!   LEN7 == 127 -> next 8 bytes hold the length (top 4 bytes zero)
//! [4-byte masking key if MASK]
//! payload
//! ```
//!
//! Text frames carry string-based protocols, binary frames byte-oriented ones.
//! Control frames never reach the dispatcher. Ping payloads are reported so
//! the connection can answer with a pong; other control frames are dropped.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN7_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Default upper bound for one reassembled message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parses the low nibble of byte 0.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::UnknownOpcode` for reserved opcodes.
    pub fn from_u8(raw: u8) -> Result<Self, FrameError> {
        match raw {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Control frames carry no application payload.
    #[must_use]
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// Framing failures. Everything except `Incomplete` is fatal for the socket.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("control frame must not be fragmented")]
    FragmentedControl,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    ExpectedContinuation,
    #[error("payload of {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: u64, limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One unit of the socket framing protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// A final text or binary frame carrying a whole message.
    #[must_use]
    pub fn message(payload: impl Into<Bytes>, binary: bool) -> Self {
        Self {
            fin: true,
            opcode: if binary { Opcode::Binary } else { Opcode::Text },
            mask: None,
            payload: payload.into(),
        }
    }

    /// A pong echoing a ping's payload.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            mask: None,
            payload: payload.into(),
        }
    }

    /// An empty close frame.
    #[must_use]
    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            mask: None,
            payload: Bytes::new(),
        }
    }

    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        header_len(self.payload.len(), self.mask.is_some()) + self.payload.len()
    }

    /// Appends the encoded frame to `dst`, masking the payload if a key is set.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= FIN_BIT;
        }
        dst.extend_from_slice(&[b0]);

        let mask_flag = if self.mask.is_some() { MASK_BIT } else { 0 };
        let len = self.payload.len();
        if len < usize::from(LEN_16) {
            // Fits in 7 bits by the branch condition.
            #[allow(clippy::cast_possible_truncation)]
            let len7 = len as u8;
            dst.extend_from_slice(&[mask_flag | len7]);
        } else if let Ok(len16) = u16::try_from(len) {
            dst.extend_from_slice(&[mask_flag | LEN_16]);
            dst.extend_from_slice(&len16.to_be_bytes());
        } else {
            dst.extend_from_slice(&[mask_flag | LEN_64]);
            dst.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                dst.extend_from_slice(&key);
                let start = dst.len();
                dst.extend_from_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.extend_from_slice(&self.payload),
        }
    }
}

/// XORs `data` in place against `key`, cycling every 4 bytes.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let base = if payload_len < usize::from(LEN_16) {
        2
    } else if payload_len <= usize::from(u16::MAX) {
        4
    } else {
        10
    };
    if masked {
        base + 4
    } else {
        base
    }
}

/// Encodes `payload` as one final, non-control frame.
#[must_use]
pub fn encode(payload: &[u8], mask: Option<[u8; 4]>, binary: bool) -> BytesMut {
    let frame = Frame {
        mask,
        ..Frame::message(Bytes::copy_from_slice(payload), binary)
    };
    let mut out = BytesMut::with_capacity(frame.encoded_len());
    frame.encode_into(&mut out);
    out
}

/// A logical message reassembled from one or more frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Concatenated, unmasked payload of the data frames.
    pub payload: Vec<u8>,
    /// Whether the message was opened by a binary frame.
    pub binary: bool,
    /// Whether a close frame was consumed.
    pub close: bool,
    /// Unmasked payloads of the ping frames consumed, in arrival order.
    pub pings: Vec<Bytes>,
}

struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    payload_offset: usize,
}

fn parse_header(buf: &[u8], limit: usize) -> Result<Header, FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::Incomplete);
    }
    if buf[0] & RSV_BITS != 0 {
        return Err(FrameError::ReservedBits);
    }
    let fin = buf[0] & FIN_BIT != 0;
    let opcode = Opcode::from_u8(buf[0] & OPCODE_BITS)?;
    let masked = buf[1] & MASK_BIT != 0;

    let (declared, mut offset) = match buf[1] & LEN7_BITS {
        LEN_16 => {
            let ext = buf.get(2..4).ok_or(FrameError::Incomplete)?;
            (u64::from(u16::from_be_bytes([ext[0], ext[1]])), 4)
        }
        LEN_64 => {
            let ext = buf.get(2..10).ok_or(FrameError::Incomplete)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            (u64::from_be_bytes(raw), 10)
        }
        len7 => (u64::from(len7), 2),
    };

    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= limit && declared <= u64::from(u32::MAX))
        .ok_or(FrameError::PayloadTooLarge {
            size: declared,
            limit,
        })?;

    let mask = if masked {
        let key = buf.get(offset..offset + 4).ok_or(FrameError::Incomplete)?;
        offset += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    Ok(Header {
        fin,
        opcode,
        mask,
        payload_len,
        payload_offset: offset,
    })
}

/// Decodes one logical message from the front of `buf`.
///
/// Returns the message and the unconsumed remainder, which may hold further
/// messages and can be passed back in.
///
/// # Errors
///
/// Returns `FrameError::Incomplete` if `buf` ends before the message does,
/// or another `FrameError` for malformed frames.
pub fn decode(buf: &[u8]) -> Result<(DecodedMessage, &[u8]), FrameError> {
    decode_with_limit(buf, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Same as [`decode`] with an explicit bound on the reassembled payload.
///
/// # Errors
///
/// See [`decode`]; also `FrameError::PayloadTooLarge` past `limit`.
pub fn decode_with_limit(
    buf: &[u8],
    limit: usize,
) -> Result<(DecodedMessage, &[u8]), FrameError> {
    let mut message = DecodedMessage::default();
    let mut started = false;
    let mut rest = buf;

    loop {
        let header = parse_header(rest, limit)?;
        let end = header.payload_offset + header.payload_len;
        if rest.len() < end {
            return Err(FrameError::Incomplete);
        }
        let raw = &rest[header.payload_offset..end];
        rest = &rest[end..];

        if header.opcode.is_control() {
            if !header.fin {
                return Err(FrameError::FragmentedControl);
            }
            match header.opcode {
                Opcode::Close => message.close = true,
                Opcode::Ping => {
                    let mut payload = raw.to_vec();
                    if let Some(key) = header.mask {
                        apply_mask(&mut payload, key);
                    }
                    message.pings.push(Bytes::from(payload));
                }
                _ => {}
            }
            if started {
                continue;
            }
            return Ok((message, rest));
        }

        match (header.opcode, started) {
            (Opcode::Continuation, false) => return Err(FrameError::UnexpectedContinuation),
            (Opcode::Text | Opcode::Binary, true) => return Err(FrameError::ExpectedContinuation),
            (opcode, false) => {
                message.binary = opcode == Opcode::Binary;
                started = true;
            }
            _ => {}
        }

        let total = message.payload.len() + raw.len();
        if total > limit {
            return Err(FrameError::PayloadTooLarge {
                size: total as u64,
                limit,
            });
        }
        let start = message.payload.len();
        message.payload.extend_from_slice(raw);
        if let Some(key) = header.mask {
            apply_mask(&mut message.payload[start..], key);
        }

        if header.fin {
            return Ok((message, rest));
        }
    }
}

/// `tokio-util` codec over the framing: decodes whole messages, encodes frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match decode_with_limit(src, self.max_message_size) {
            Ok((message, rest)) => {
                let consumed = src.len() - rest.len();
                src.advance(consumed);
                Ok(Some(message))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode_into(dst);
        Ok(())
    }
}
