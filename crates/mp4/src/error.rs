use thiserror::Error;

use crate::FourCc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mp4Error {
    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid box size {size} for '{box_type}'")]
    InvalidBoxSize { box_type: FourCc, size: u64 },

    #[error("Invalid '{box_type}' box: {reason}")]
    InvalidBox { box_type: FourCc, reason: String },

    #[error("Missing required box '{0}'")]
    MissingBox(FourCc),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
