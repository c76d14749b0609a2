//! The length-prefixed frame codec.
//!
//! Every unit of a grpc-web body is a frame: a one-byte type tag, a
//! four-byte big-endian length, and `length` bytes of body. Payload
//! frames carry a serialized message; trailer frames carry an HTTP-style
//! header block. The codec itself does not reject unknown tags; callers
//! classify frames by the most significant tag bit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the tag + length prefix preceding every frame body.
pub const FRAME_HEADER_SIZE: usize = 1 + 4;

// 8th (MSB) bit of the 1st frame byte denotes an uncompressed trailer
// (as part of the body).
const TRAILERS_BIT: u8 = 0b1000_0000;

/// A single grpc-web frame: a raw type tag plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: u8,
    body: Bytes,
}

impl Frame {
    /// Tag marking a payload frame.
    pub const PAYLOAD: u8 = 0;

    /// Tag marking a trailer frame.
    pub const TRAILER: u8 = TRAILERS_BIT;

    /// A payload frame carrying a serialized message.
    pub fn payload(body: impl Into<Bytes>) -> Self {
        Frame {
            tag: Self::PAYLOAD,
            body: body.into(),
        }
    }

    /// A trailer frame carrying an encoded header block.
    pub fn trailer(body: impl Into<Bytes>) -> Self {
        Frame {
            tag: Self::TRAILER,
            body: body.into(),
        }
    }

    /// The raw type tag, preserved verbatim from the wire.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// The frame body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the frame, returning its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Whether the most significant tag bit marks this as a trailer
    /// frame.
    pub fn is_trailer(&self) -> bool {
        self.tag & TRAILERS_BIT != 0
    }

    /// Emit `tag || length (u32be) || body`.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.body.len());
        buf.put_u8(self.tag);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Read back-to-back frames until the buffer is exhausted.
    ///
    /// Fails if the buffer ends mid-header or mid-body. Splits the body
    /// out of `buf` without copying.
    pub fn unpack(mut buf: Bytes) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < FRAME_HEADER_SIZE {
                return Err(ProtocolError::MalformedFrame("truncated frame header"));
            }

            let tag = buf.get_u8();
            let len = buf.get_u32() as usize;

            if buf.remaining() < len {
                return Err(ProtocolError::MalformedFrame("truncated frame body"));
            }

            frames.push(Frame {
                tag,
                body: buf.split_to(len),
            });
        }

        Ok(frames)
    }
}
