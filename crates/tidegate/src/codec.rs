//! Streaming frame codec: the byte-level layer of the WebSocket stack.
//!
//! The [`Decoder`] accepts arbitrarily segmented input — a TCP read may end
//! mid-header or mid-payload — and retains the parsed-but-incomplete state
//! across calls. Each call to [`Decoder::decode`] consumes at most one
//! complete frame from the front of the buffer; callers loop until it
//! reports that more bytes are needed.
//!
//! The codec knows nothing about fragmentation, masking policy, or control
//! frame semantics beyond the structural rules RFC 6455 attaches to the
//! header itself (reserved bits zero, valid opcode, control frames final and
//! ≤125 bytes). Message reassembly and protocol policing live in the session
//! layer.

use bytes::{Buf, BytesMut};

use crate::{
    Error, Result,
    frame::{Frame, MAX_HEAD_SIZE, OpCode},
    mask,
};

/// The default cap on a single frame's payload, 1 MiB.
///
/// Oversize frames are rejected during decode and the session closes the
/// connection with close code 1009.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Header fields held between calls while a frame's payload is still in
/// flight.
struct PartialFrame {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Streaming WebSocket frame decoder.
///
/// Feed it a [`BytesMut`] that accumulates socket reads; it splits complete
/// frames off the front and leaves the unparsed tail in place.
pub struct Decoder {
    /// Header of the frame whose payload has not fully arrived yet.
    state: Option<PartialFrame>,
    /// Maximum accepted payload size per frame.
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

impl Decoder {
    /// Creates a decoder rejecting frames with payloads of `max_payload`
    /// bytes or more.
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: None,
            max_payload,
        }
    }

    /// Decodes one frame off the front of `src`.
    ///
    /// Returns `Ok(Some(frame))` when a full frame was consumed,
    /// `Ok(None)` when more bytes are needed, and `Err` on a structural
    /// protocol violation. Masked payloads are unmasked in place; the
    /// masking key stays recorded on the returned [`Frame`] so callers can
    /// enforce the masking rules of their role.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Resume a frame whose header was already parsed.
        if let Some(partial) = self.state.take() {
            if src.len() < partial.payload_len {
                self.state = Some(partial);
                return Ok(None);
            }
            return Ok(Some(Self::take_payload(
                src,
                partial.fin,
                partial.opcode,
                partial.mask,
                partial.payload_len,
            )));
        }

        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        // No extensions are negotiated, so all three reserved bits must be
        // zero (RFC 6455 Section 5.2).
        if src[0] & 0b0111_0000 != 0 {
            return Err(Error::ReservedBitsNotZero);
        }
        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let head_size = 2 + extra + (masked as usize * 4);
        if src.len() < head_size {
            return Ok(None);
        }

        src.advance(2);
        let payload_len = match extra {
            0 => usize::from(length_code),
            2 => src.get_u16() as usize,
            _ => match usize::try_from(src.get_u64()) {
                Ok(len) => len,
                Err(_) => return Err(Error::FrameTooLarge),
            },
        };
        let mask = if masked {
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        // Structural control frame rules, RFC 6455 Section 5.5.
        if opcode.is_control() {
            if !fin {
                return Err(Error::ControlFrameFragmented);
            }
            if payload_len > 125 {
                return Err(Error::ControlFrameTooLarge);
            }
        }
        if payload_len >= self.max_payload {
            return Err(Error::FrameTooLarge);
        }

        if src.len() < payload_len {
            self.state = Some(PartialFrame {
                fin,
                opcode,
                mask,
                payload_len,
            });
            return Ok(None);
        }

        Ok(Some(Self::take_payload(src, fin, opcode, mask, payload_len)))
    }

    fn take_payload(
        src: &mut BytesMut,
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload_len: usize,
    ) -> Frame {
        if let Some(mask) = mask {
            mask::apply_mask(&mut src[..payload_len], mask);
        }
        let payload = src.split_to(payload_len).freeze();
        Frame::from_parts(fin, opcode, mask, payload)
    }
}

/// WebSocket frame encoder.
///
/// Serializes the header and payload into `dst`. A frame is masked on the
/// wire exactly when it carries a masking key; the server-side session never
/// sets one (RFC 6455 Section 5.1), so only client-role callers such as
/// tests produce masked output.
pub struct Encoder;

impl Encoder {
    /// Appends the encoded frame to `dst`.
    pub fn encode(frame: Frame, dst: &mut BytesMut) {
        dst.reserve(MAX_HEAD_SIZE + frame.payload().len());
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(frame.payload());
        if let Some(mask) = frame.mask() {
            mask::apply_mask(&mut dst[index..], mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn encode_to_vec(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Encoder::encode(frame, &mut buf);
        buf.to_vec()
    }

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Frame> {
        let mut src = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut src).expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn round_trip_across_size_classes() {
        for size in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
            for masked in [false, true] {
                let mut frame = Frame::binary(payload.clone());
                if masked {
                    frame = frame.with_mask(TEST_MASK);
                }
                let encoded = encode_to_vec(frame);

                let mut decoder = Decoder::default();
                let frames = decode_all(&mut decoder, &encoded);
                assert_eq!(frames.len(), 1, "size {size} masked {masked}");
                let frame = &frames[0];
                assert_eq!(frame.opcode(), OpCode::Binary);
                assert!(frame.is_fin());
                assert_eq!(frame.payload().as_ref(), &payload[..]);
                assert_eq!(frame.mask().is_some(), masked);
            }
        }
    }

    #[test]
    fn resumable_at_every_split_point() {
        let mut wire = Vec::new();
        wire.extend(encode_to_vec(Frame::text("hello").with_mask(TEST_MASK)));
        wire.extend(encode_to_vec(Frame::ping("xy").with_mask(TEST_MASK)));
        wire.extend(encode_to_vec(
            Frame::binary((0..200u16).map(|i| i as u8).collect::<Vec<_>>()).with_mask(TEST_MASK),
        ));

        for split in 0..=wire.len() {
            let mut decoder = Decoder::default();
            let mut src = BytesMut::from(&wire[..split]);
            let mut frames = Vec::new();
            while let Some(frame) = decoder.decode(&mut src).expect("first half") {
                frames.push(frame);
            }
            src.extend_from_slice(&wire[split..]);
            while let Some(frame) = decoder.decode(&mut src).expect("second half") {
                frames.push(frame);
            }

            assert_eq!(frames.len(), 3, "split at {split}");
            assert_eq!(frames[0].payload().as_ref(), b"hello");
            assert_eq!(frames[1].opcode(), OpCode::Ping);
            assert_eq!(frames[2].payload().len(), 200);
        }
    }

    #[test]
    fn byte_at_a_time_feed() {
        let wire = encode_to_vec(Frame::text("streaming").with_mask(TEST_MASK));
        let mut decoder = Decoder::default();
        let mut src = BytesMut::new();
        let mut decoded = None;
        for &byte in &wire {
            src.extend_from_slice(&[byte]);
            if let Some(frame) = decoder.decode(&mut src).expect("decode") {
                decoded = Some(frame);
            }
        }
        let frame = decoded.expect("frame completes on last byte");
        assert_eq!(frame.payload().as_ref(), b"streaming");
    }

    #[test]
    fn rejects_reserved_bits() {
        for rsv in [0x40u8, 0x20, 0x10] {
            let mut decoder = Decoder::default();
            let mut src = BytesMut::from(&[0x80 | rsv | 0x1, 0x00][..]);
            assert!(matches!(
                decoder.decode(&mut src),
                Err(Error::ReservedBitsNotZero)
            ));
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut decoder = Decoder::default();
        let mut src = BytesMut::from(&[0x83u8, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(Error::InvalidOpCode(0x3))
        ));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        // Ping with FIN clear.
        let mut decoder = Decoder::default();
        let mut src = BytesMut::from(&[0x09u8, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(Error::ControlFrameFragmented)
        ));
    }

    #[test]
    fn rejects_oversize_control_frame() {
        let mut decoder = Decoder::default();
        let mut src = BytesMut::from(&[0x89u8, 126, 0x00, 126][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(Error::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn rejects_oversize_payload() {
        let mut decoder = Decoder::new(1024);
        let mut src = BytesMut::from(&[0x82u8, 126, 0x04, 0x00][..]);
        assert!(matches!(decoder.decode(&mut src), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn unmasked_frame_passes_through_with_no_key() {
        // Masking policy is the session's concern; the decoder just reports.
        let wire = encode_to_vec(Frame::text("plain"));
        let mut decoder = Decoder::default();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].mask().is_none());
        assert_eq!(frames[0].payload().as_ref(), b"plain");
    }

    #[test]
    fn leaves_trailing_bytes_in_buffer() {
        let mut wire = encode_to_vec(Frame::text("one").with_mask(TEST_MASK));
        wire.extend_from_slice(&[0x81]); // start of a second header
        let mut decoder = Decoder::default();
        let mut src = BytesMut::from(&wire[..]);
        assert!(decoder.decode(&mut src).unwrap().is_some());
        assert!(decoder.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 1);
    }
}
