//! Error types for the core toolkit.

use std::fmt;

use thiserror::Error;

use crate::queue::QueueError;

/// Coarse classification shared by every Lumen error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No free console, device file missing or busy, session already live.
    ResourceUnavailable,
    /// Hardware refused the requested configuration.
    ConfigurationRejected,
    /// Programming error (queue misuse and the like).
    ProtocolViolation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::ResourceUnavailable => write!(f, "Resource unavailable"),
            ErrorCategory::ConfigurationRejected => write!(f, "Configuration rejected"),
            ErrorCategory::ProtocolViolation => write!(f, "Protocol violation"),
        }
    }
}

/// Errors raised by the queue, dispatcher and screen.
#[derive(Error, Debug)]
pub enum LumenError {
    /// Misuse of an ordered queue.
    #[error("Queue misuse: {0}")]
    Queue(#[from] QueueError),

    /// A file watcher was registered with an unusable descriptor.
    #[error("Invalid file descriptor: {0}")]
    InvalidDescriptor(i32),

    /// The multiplexed wait failed.
    #[error("Poll failed: {0}")]
    PollFailed(#[source] std::io::Error),

    /// The wakeup channel could not be created or used.
    #[error("Wakeup channel error: {0}")]
    Wakeup(#[source] std::io::Error),
}

impl LumenError {
    /// Map this error onto the shared taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LumenError::Queue(_) | LumenError::InvalidDescriptor(_) => {
                ErrorCategory::ProtocolViolation
            }
            LumenError::PollFailed(_) | LumenError::Wakeup(_) => {
                ErrorCategory::ResourceUnavailable
            }
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, LumenError>;
