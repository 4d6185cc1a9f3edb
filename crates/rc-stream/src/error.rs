//! Error kinds shared across the streaming core.

use thiserror::Error;

/// Errors surfaced by capture, encoding, and session plumbing.
///
/// Call sites branch on the kind: transient errors are retried, device
/// loss rebuilds GPU state in place, setter validation errors surface to
/// the caller, and only `Fatal` tears a session down.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The platform lacks this capability entirely.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Capture permission has not been granted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("display {0} not found")]
    DisplayNotFound(u32),

    #[error("invalid codec: {0}")]
    InvalidCodec(String),

    #[error("invalid quality: {0}")]
    InvalidQuality(String),

    #[error("invalid bitrate: {0}")]
    InvalidBitrate(String),

    #[error("invalid fps: {0}")]
    InvalidFps(String),

    /// The GPU device was lost or reset; the caller reinitializes.
    #[error("graphics device lost: {0}")]
    DeviceLost(String),

    /// Timeouts and empty acquires; retried by the capture loop.
    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl StreamError {
    /// Whether the capture loop should simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Transient(_))
    }

    /// Whether the error requires rebuilding the GPU device state.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, StreamError::DeviceLost(_))
    }
}
