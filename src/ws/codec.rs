//! WebSocket frame encoding and decoding for the client side of a connection.

use bytes::{BufMut, Bytes, BytesMut};
use n0_error::e;
use tokio::io::AsyncRead;
use tracing::{debug, trace};

use crate::{error::GatewayError, util::Prebuffered};

/// Largest payload accepted by [`encode_frame`].
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum OpCode {
    #[display("continuation")]
    Continuation,
    #[display("text")]
    Text,
    #[display("binary")]
    Binary,
    #[display("close")]
    Close,
    #[display("ping")]
    Ping,
    #[display("pong")]
    Pong,
    #[display("reserved({_0:#x})")]
    Reserved(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(other) => other,
        }
    }
}

impl OpCode {
    pub fn is_control(self) -> bool {
        u8::from(self) >= 0x8
    }
}

/// A decoded frame, or a reassembled message tagged with its initiating opcode.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    #[debug("{} bytes", payload.len())]
    pub payload: Bytes,
}

/// Encodes a masked frame with `fin` set and a random mask.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Result<BytesMut, GatewayError> {
    encode_frame_with_mask(opcode, payload, rand::random())
}

/// Encodes a masked frame with `fin` set and the given mask.
pub fn encode_frame_with_mask(
    opcode: OpCode,
    payload: &[u8],
    mask: [u8; 4],
) -> Result<BytesMut, GatewayError> {
    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(e!(GatewayError::PayloadTooLarge { len }));
    }
    let mut buf = BytesMut::with_capacity(len + 14);
    buf.put_u8(0x80 | u8::from(opcode));
    if len < 126 {
        buf.put_u8(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(0x80 | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0x80 | 127);
        buf.put_u64(len as u64);
    }
    buf.put_slice(&mask);
    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], mask);
    Ok(buf)
}

/// XORs `payload` with `mask` cycled over four bytes.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns the number of bytes the frame occupies and the frame with its
/// payload unmasked, or `None` if `buf` does not hold a complete frame yet.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(usize, Frame)>, GatewayError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = OpCode::from(buf[0] & 0x0F);
    let masked = buf[1] & 0x80 != 0;
    let mut offset = 2;
    let len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            offset = 4;
            u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        127 => {
            return Err(GatewayError::malformed_frame(
                "64-bit extended payload length is not supported",
            ));
        }
        len => len as usize,
    };
    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mask = [
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ];
        offset += 4;
        Some(mask)
    } else {
        None
    };
    if buf.len() < offset + len {
        return Ok(None);
    }
    let mut payload = BytesMut::from(&buf[offset..offset + len]);
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }
    Ok(Some((
        offset + len,
        Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        },
    )))
}

/// Reads frames from a stream and reassembles fragmented messages.
#[derive(Debug)]
pub struct FrameReader<S> {
    reader: Prebuffered<S>,
    pending: Option<(OpCode, BytesMut)>,
}

impl<S: AsyncRead + Unpin> FrameReader<S> {
    pub fn new(reader: Prebuffered<S>) -> Self {
        Self {
            reader,
            pending: None,
        }
    }

    /// Returns the next raw frame, or `None` once the stream ends.
    ///
    /// A partial frame at the end of the stream is dropped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        loop {
            if let Some((len, frame)) = decode_frame(self.reader.buffer())? {
                self.reader.discard(len);
                trace!(opcode = %frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");
                return Ok(Some(frame));
            }
            if self.reader.buffer_more().await? == 0 {
                if self.reader.len() > 0 {
                    debug!(buffered = self.reader.len(), "stream ended inside a frame");
                }
                return Ok(None);
            }
        }
    }

    /// Returns the next complete message or control frame.
    ///
    /// Fragmented messages are returned once their final continuation
    /// arrives, tagged with the opcode of the first fragment. Control frames
    /// are returned immediately and leave a pending reassembly untouched.
    pub async fn next_message(&mut self) -> Result<Option<Frame>, GatewayError> {
        loop {
            let Some(frame) = self.next_frame().await? else {
                return Ok(None);
            };
            match frame.opcode {
                OpCode::Continuation => {
                    let Some((opcode, mut buf)) = self.pending.take() else {
                        return Err(GatewayError::malformed_frame(
                            "continuation frame without a message to continue",
                        ));
                    };
                    buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(Frame {
                            fin: true,
                            opcode,
                            payload: buf.freeze(),
                        }));
                    }
                    self.pending = Some((opcode, buf));
                }
                opcode if opcode.is_control() => return Ok(Some(frame)),
                opcode => {
                    if self.pending.take().is_some() {
                        debug!("discarding unfinished fragmented message");
                    }
                    if frame.fin {
                        return Ok(Some(frame));
                    }
                    self.pending = Some((opcode, BytesMut::from(&frame.payload[..])));
                }
            }
        }
    }
}
