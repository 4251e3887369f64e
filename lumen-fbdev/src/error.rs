//! Error types for the framebuffer backend.

use thiserror::Error;

use lumen_core::{ErrorCategory, LumenError};

/// Errors raised while acquiring or driving a console framebuffer session.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Another session already owns the console and framebuffer.
    #[error("A framebuffer session is already live")]
    SessionExists,

    /// No usable virtual console could be obtained.
    #[error("Virtual console unavailable: {0}")]
    ConsoleUnavailable(String),

    /// A device node could not be opened.
    #[error("Failed to open {path}: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A console or framebuffer control operation failed.
    #[error("{op} failed: {source}")]
    ControlFailed {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The framebuffer refused the requested video mode.
    #[error("Framebuffer rejected configuration: {0}")]
    ConfigurationRejected(String),

    /// Mapping the framebuffer memory failed.
    #[error("Failed to map framebuffer: {0}")]
    MapFailed(#[source] std::io::Error),

    /// Invalid backend configuration.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// Failure inside the dispatcher while registering the session.
    #[error(transparent)]
    Core(#[from] LumenError),
}

impl DeviceError {
    pub(crate) fn control(op: &'static str, source: std::io::Error) -> Self {
        DeviceError::ControlFailed { op, source }
    }

    /// Map this error onto the shared taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeviceError::SessionExists
            | DeviceError::ConsoleUnavailable(_)
            | DeviceError::DeviceUnavailable { .. }
            | DeviceError::ControlFailed { .. }
            | DeviceError::MapFailed(_) => ErrorCategory::ResourceUnavailable,
            DeviceError::ConfigurationRejected(_) | DeviceError::InvalidConfig { .. } => {
                ErrorCategory::ConfigurationRejected
            }
            DeviceError::Core(e) => e.category(),
        }
    }
}

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
