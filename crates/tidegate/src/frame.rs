//! WebSocket frames as defined in RFC 6455 Section 5.2.
//!
//! A [`Frame`] is the atomic protocol unit: a header (FIN flag, opcode,
//! optional masking key, payload length) followed by the payload bytes.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames (`Text`, `Binary`, `Continuation`) carry application payload
//! and may be fragmented. Control frames (`Close`, `Ping`, `Pong`) manage the
//! connection, are never fragmented, and carry at most 125 payload bytes.
//!
//! This server never masks outbound frames; the mask slot exists because
//! inbound client frames carry one and because tests play the client role.

use bytes::Bytes;

use crate::{Error, close::CloseCode};

/// Frame type identifier, RFC 6455 Section 11.8.
///
/// Values 0x3-0x7 and 0xB-0xF are reserved; a header carrying one of them is
/// rejected during decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    /// 0x0, continues a fragmented message.
    Continuation,
    /// 0x1, UTF-8 text payload.
    Text,
    /// 0x2, arbitrary binary payload.
    Binary,
    /// 0x8, initiates or confirms connection closure.
    Close,
    /// 0x9, liveness probe requiring a `Pong` response.
    Ping,
    /// 0xA, answer to a `Ping`.
    Pong,
}

impl OpCode {
    /// Whether this opcode names a control frame (`Close`, `Ping`, `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(Error::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Upper bound on an encoded header: 2 fixed bytes, 8 length-extension
/// bytes, 4 masking-key bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment of its message.
    pub(crate) fin: bool,
    /// Frame type.
    pub(crate) opcode: OpCode,
    /// Masking key. Present on frames received from clients; never set on
    /// frames this server sends.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes, already unmasked on received frames.
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame. The payload must not exceed 125 bytes.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame. The payload must not exceed 125 bytes.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Pong, None, payload)
    }

    /// Creates a final continuation frame.
    ///
    /// Fragmented messages are a non-final `Text`/`Binary` frame followed by
    /// zero or more non-final continuations and one final continuation.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Continuation, None, payload)
    }

    /// Creates a close frame whose payload is the 2-byte network-order code
    /// followed by the UTF-8 reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let code16 = u16::from(code);
        let reason: &[u8] = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code16.to_be_bytes());
        payload.extend_from_slice(reason);
        Self::from_parts(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with an already-assembled payload, used to echo
    /// a peer's close payload byte-exact.
    pub(crate) fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Close, None, payload)
    }

    /// Low-level constructor with full control over the header flags.
    pub(crate) fn from_parts(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Sets the FIN flag, builder style.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key, builder style. Only a client masks; this exists
    /// for tests and tooling that speak the client side of the protocol.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// The frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Whether this frame ends its message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// The masking key carried by the frame header, if any.
    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Borrows the payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning the payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Extracts the status code from a Close frame payload, if one is
    /// present. Empty close payloads are legal and carry no code.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the UTF-8 reason from a Close frame payload.
    ///
    /// Returns `Ok(None)` when the payload is empty, `Err` when the reason
    /// bytes are not valid UTF-8.
    pub fn close_reason(&self) -> Result<Option<&str>, Error> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        let reason = self.payload.get(2..).ok_or(Error::InvalidUtf8)?;
        std::str::from_utf8(reason)
            .map(Some)
            .map_err(|_| Error::InvalidUtf8)
    }

    /// Serializes the frame header into `dst`.
    #[inline]
    pub(crate) fn write_head(&self, dst: &mut bytes::BytesMut) {
        use bytes::BufMut;

        let first_byte = (self.fin as u8) << 7 | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        if len < 126 {
            dst.put_u8(first_byte);
            dst.put_u8(len as u8 | mask_bit);
        } else if len < 65536 {
            dst.put_u8(first_byte);
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(first_byte);
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

/// The encoded header size for a frame carrying `payload_len` bytes.
///
/// 2 fixed bytes, plus 2 or 8 extended-length bytes depending on the payload
/// size class, plus 4 masking-key bytes when `masked` is set. Useful for
/// choosing a `max_frame_size` to hand to
/// [`Senders::send_data`](crate::ws::Senders::send_data).
pub fn encoded_head_size(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len < 126 {
        0
    } else if payload_len < 65536 {
        2
    } else {
        8
    };
    2 + extended + if masked { 4 } else { 0 }
}
