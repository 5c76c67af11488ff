//! Tokio codec for length-prefixed protobuf messages

use std::marker::PhantomData;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::FrameHeader;

/// Codec encoding `E` and decoding `D`
///
/// An agent uses `FrameCodec<AgentMessage, ServerCommand>`; the peer uses the
/// mirror image.
#[derive(Debug)]
pub struct FrameCodec<E, D> {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> FrameCodec<E, D> {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for FrameCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Decoder for FrameCodec<E, D>
where
    D: prost::Message + Default,
{
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src) {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_len()?;

        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let message = D::decode(payload)?;

        Ok(Some(message))
    }
}

impl<E, D> Encoder<E> for FrameCodec<E, D>
where
    E: prost::Message,
{
    type Error = ProtocolError;

    fn encode(&mut self, message: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = message.encoded_len();
        FrameHeader::for_payload(payload_len)?.encode(dst);
        dst.reserve(payload_len);
        message.encode(dst)?;

        Ok(())
    }
}
