//! Protocol error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown job status value: {0}")]
    UnknownJobStatus(i32),

    #[error("Unknown task status value: {0}")]
    UnknownTaskStatus(i32),

    #[error("Unknown job kind value: {0}")]
    UnknownJobKind(i32),

    #[error("Invalid enum name: '{0}'")]
    InvalidName(String),

    #[error("Identifier out of range: {0}")]
    InvalidId(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("Protocol version mismatch: expected {expected:#04x}, got {got:#04x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("Payload length mismatch: header says {expected}, got {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
