//! Protocol error types

use std::fmt;

/// Errors that can occur during frame decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer length differs from the fixed frame size
    FrameSize { expected: usize, actual: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameSize { expected, actual } => {
                write!(f, "frame size mismatch: expected {} bytes, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for DecodeError {}
