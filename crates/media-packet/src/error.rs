use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Subsample layout covers {actual} bytes but payload has {expected}")]
    SubsampleMismatch { expected: usize, actual: u64 },
    #[error("Invalid IV length: {0} (expected 8 or 16)")]
    InvalidIvLength(usize),
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },
    #[error("Invalid box: {0}")]
    InvalidBox(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}
