//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Protobuf encoding failed
    #[error("Encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    /// Protobuf decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
