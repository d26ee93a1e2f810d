//! Frame codec for [`tokio_util::codec::Framed`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::fcall::{Fcall, HEADER_LEN, Msg};

/// Splits a byte stream into 9P messages and frames replies.
///
/// Inbound frames larger than the current message size are rejected; the
/// limit is lowered once Tversion has been negotiated. A bad size prefix is
/// a stream error, while a bad body inside a well-sized frame decodes to
/// [`Fcall::Malformed`].
#[derive(Debug, Clone)]
pub struct NinePCodec {
    max_size: u32,
}

impl NinePCodec {
    pub fn new(max_size: u32) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
    }
}

impl Decoder for NinePCodec {
    type Item = Msg;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if (size as usize) < HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(size));
        }
        if size > self.max_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_size,
            });
        }
        if src.len() < size as usize {
            src.reserve(size as usize - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size as usize);
        frame.advance(4);
        let kind = frame.get_u8();
        let tag = frame.get_u16_le();
        let body = Fcall::decode(kind, &frame).unwrap_or_else(|e| Fcall::Malformed {
            kind,
            reason: e.to_string(),
        });
        Ok(Some(Msg { tag, body }))
    }
}

impl Encoder<Msg> for NinePCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = dst.len();
        dst.put_u32_le(0);
        dst.put_u8(msg.body.kind());
        dst.put_u16_le(msg.tag);
        msg.body.encode_body(dst);

        let size = (dst.len() - start) as u32;
        dst[start..start + 4].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }
}
