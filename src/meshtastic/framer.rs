//! Length-prefixed protobuf framer for the Meshtastic stream API (serial and TCP).
//!
//! Every binary message on the link is emitted as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything outside a frame is device console output and is skipped. [`decode`] is the
//! stateless primitive; [`FrameBuffer`] accumulates arbitrary read chunks and yields whole
//! frames when available.
use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use prost::Message;
use thiserror::Error;

use crate::logutil::escape_log;
use crate::metrics;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
/// Largest payload the firmware will emit or accept.
pub const MAX_PAYLOAD: usize = 512;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds maximum of {MAX_PAYLOAD} bytes")]
    Oversize(usize),
    #[error("invalid protobuf payload: {0}")]
    Payload(#[from] prost::DecodeError),
}

/// Result of one [`decode`] step.
#[derive(Debug)]
pub enum Decoded<M> {
    /// A complete message; `consumed` covers header and payload.
    Frame { message: M, consumed: usize },
    /// Leading bytes that are not part of any frame.
    Noise { consumed: usize },
    NeedMoreData,
}

/// Encode one message with its stream header.
pub fn encode<M: Message>(message: &M) -> Result<Bytes, FrameError> {
    let len = message.encoded_len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::Oversize(len));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(&[START1, START2, (len >> 8) as u8, (len & 0xFF) as u8]);
    message
        .encode(&mut out)
        .map_err(|_| FrameError::Oversize(len))?;
    Ok(out.freeze())
}

/// Wrap an already-encoded payload with the stream header.
pub fn encode_raw(payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = payload.len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::Oversize(len));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(&[START1, START2, (len >> 8) as u8, (len & 0xFF) as u8]);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Decode at most one frame (or one run of noise) from the start of `buf`.
pub fn decode<M: Message + Default>(buf: &[u8]) -> Result<Decoded<M>, FrameError> {
    if buf.is_empty() {
        return Ok(Decoded::NeedMoreData);
    }
    if buf[0] != START1 {
        let consumed = buf.iter().position(|&b| b == START1).unwrap_or(buf.len());
        return Ok(Decoded::Noise { consumed });
    }
    if buf.len() < 2 {
        return Ok(Decoded::NeedMoreData);
    }
    if buf[1] != START2 {
        return Ok(Decoded::Noise { consumed: 1 });
    }
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMoreData);
    }
    let declared = ((buf[2] as usize) << 8) | (buf[3] as usize);
    if declared > MAX_PAYLOAD {
        return Err(FrameError::Oversize(declared));
    }
    let total = HEADER_LEN + declared;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }
    let message = M::decode(&buf[HEADER_LEN..total])?;
    Ok(Decoded::Frame {
        message,
        consumed: total,
    })
}

/// A decoded message together with its payload bytes (kept for verbatim replay).
#[derive(Debug, Clone)]
pub struct Frame<M> {
    pub message: M,
    pub raw: Bytes,
}

/// Incremental framer fed with arbitrary chunks from the link.
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame, skipping console noise. A decode error leaves the
    /// buffer empty; the caller is expected to drop the connection.
    pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<Frame<M>>, FrameError> {
        loop {
            match decode::<M>(&self.buf) {
                Ok(Decoded::NeedMoreData) => return Ok(None),
                Ok(Decoded::Noise { consumed }) => {
                    let noise = self.buf.split_to(consumed);
                    metrics::add_noise_bytes(consumed);
                    let text = String::from_utf8_lossy(&noise);
                    if !text.trim().is_empty() {
                        trace!("device console: {}", escape_log(text.trim_end()));
                    }
                }
                Ok(Decoded::Frame { message, consumed }) => {
                    let mut frame = self.buf.split_to(consumed);
                    frame.advance(HEADER_LEN);
                    return Ok(Some(Frame {
                        message,
                        raw: frame.freeze(),
                    }));
                }
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
