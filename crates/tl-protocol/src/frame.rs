//! Length prefix for byte-stream transports
//!
//! The framed TCP connector has no message boundaries of its own, so every
//! protobuf envelope goes out as `[u32 big-endian length][body]`. The gRPC
//! connector does not use this module; HTTP/2 frames its messages already.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const HEADER_SIZE: usize = 4;

/// Largest envelope either side will accept (16 MiB).
///
/// A burst of PTY output is a few KiB per chunk; anything near this limit is
/// a corrupt stream rather than a real message.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix of one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Header for an outgoing body of `len` bytes
    pub fn for_payload(len: usize) -> Result<Self, ProtocolError> {
        check_size(len)?;
        Ok(Self::new(len as u32))
    }

    /// Body length announced by an incoming header, if within the limit
    pub fn payload_len(&self) -> Result<usize, ProtocolError> {
        let len = self.payload_length as usize;
        check_size(len)?;
        Ok(len)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.payload_length);
    }

    /// Consume a header from `src`; `None` leaves a short buffer untouched
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        (src.len() >= HEADER_SIZE).then(|| Self::new(src.get_u32()))
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}
