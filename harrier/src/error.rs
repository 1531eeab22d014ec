use thiserror::Error;

use crate::capture::CaptureError;

/// Main application error type for harrier.
#[derive(Debug, Error)]
pub enum HarrierError {
    /// Capture engine setup errors
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Signal handling and thread spawn errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl HarrierError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Type alias for Result with HarrierError
pub type Result<T> = std::result::Result<T, HarrierError>;
