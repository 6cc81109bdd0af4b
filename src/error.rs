//! Error handling for the capture core.

use std::time::Duration;

use thiserror::Error;

use crate::config::CameraId;

/// Application error types
#[derive(Error, Debug)]
pub enum OurError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// The camera configuration can't be turned into a device descriptor.
    /// Raised before any device I/O happens.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Every descriptor (primary and fallback) failed to open
    #[error("Failed to open camera {camera}: {reason}")]
    DeviceOpen { camera: CameraId, reason: String },

    /// A single frame read failed; the acquisition loop retries these
    #[error("Frame read failed: {0}")]
    TransientRead(String),

    /// The acquisition thread didn't exit within the stop timeout
    #[error("Camera {camera} did not stop within {waited:?}")]
    ShutdownTimeout { camera: CameraId, waited: Duration },

    /// No session registered under this id
    #[error("Camera {0} not found")]
    CameraNotFound(CameraId),

    /// Generic application errors
    #[error("Application error: {0}")]
    App(String),
}

/// Application result type
pub type OurResult<T> = std::result::Result<T, OurError>;
