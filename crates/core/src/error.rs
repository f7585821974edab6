//! Error types for html-to-png conversion.

use crate::backend::{BackendError, BackendErrorKind};
use thiserror::Error;

/// Main error type for the html-to-png library.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Request options are outside the accepted limits.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// No worker became available before the deadline.
    #[error("No render worker became available within {waited_ms} ms")]
    AcquireTimeout { waited_ms: u64 },

    /// The document could not be loaded.
    #[error("Document navigation failed: {0}")]
    NavigationFailure(String),

    /// A settle step did not finish within its budget.
    #[error("Document did not finish '{stage}' within {timeout_ms} ms")]
    LoadTimeout { stage: &'static str, timeout_ms: u64 },

    /// The overall request deadline expired.
    #[error("Conversion exceeded its deadline of {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The render backend reported memory or process pressure.
    #[error("Render backend out of resources: {0}")]
    ResourceExhausted(String),

    /// Cards mode found nothing to export.
    #[error("No cards found in document")]
    NoCardsFound,

    /// Not a single backend instance could be started.
    #[error("Failed to start any of {attempted} render workers: {message}")]
    PoolInitializationFailure { attempted: usize, message: String },

    /// Pool shutdown.
    #[error("Render worker pool has been shut down")]
    PoolShutdown,

    /// The backend process or session died.
    #[error("Render backend crashed: {0}")]
    BackendCrashed(String),

    /// Screenshot capture failed.
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Image decoding or encoding failed.
    #[error("Image encoding failed: {0}")]
    EncodingError(String),

    /// Building the card archive failed.
    #[error("Archive creation failed: {0}")]
    ArchiveError(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backend gave up on an operation on its own clock.
    #[error("Render backend timed out: {0}")]
    BackendTimeout(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, ConversionError>;

/// What happens to a borrowed worker once a call is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerDisposition {
    /// The worker is healthy and goes back to the idle set.
    Release,
    /// The worker is suspect and gets closed.
    Retire,
}

impl ConversionError {
    /// Disposition of the worker that was in use when this error surfaced.
    pub fn worker_disposition(&self) -> WorkerDisposition {
        match self {
            ConversionError::NavigationFailure(_)
            | ConversionError::LoadTimeout { .. }
            | ConversionError::Timeout { .. }
            | ConversionError::BackendTimeout(_)
            | ConversionError::ResourceExhausted(_)
            | ConversionError::BackendCrashed(_) => WorkerDisposition::Retire,
            _ => WorkerDisposition::Release,
        }
    }

    /// Status code a front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ConversionError::InvalidOptions(_) | ConversionError::NoCardsFound => 400,
            ConversionError::Timeout { .. }
            | ConversionError::LoadTimeout { .. }
            | ConversionError::BackendTimeout(_) => 408,
            ConversionError::NavigationFailure(_) => 502,
            ConversionError::AcquireTimeout { .. } | ConversionError::PoolShutdown => 503,
            ConversionError::ResourceExhausted(_) => 507,
            _ => 500,
        }
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConversionError::AcquireTimeout { .. }
                | ConversionError::Timeout { .. }
                | ConversionError::LoadTimeout { .. }
                | ConversionError::BackendTimeout(_)
                | ConversionError::ResourceExhausted(_)
                | ConversionError::BackendCrashed(_)
        )
    }
}

impl From<BackendError> for ConversionError {
    fn from(err: BackendError) -> Self {
        match err.kind {
            BackendErrorKind::Crashed | BackendErrorKind::Protocol => {
                ConversionError::BackendCrashed(err.message)
            }
            BackendErrorKind::Navigation => ConversionError::NavigationFailure(err.message),
            BackendErrorKind::OutOfMemory => ConversionError::ResourceExhausted(err.message),
            BackendErrorKind::Timeout => ConversionError::BackendTimeout(err.message),
            BackendErrorKind::Capture | BackendErrorKind::UnsupportedFormat => {
                ConversionError::CaptureFailed(err.message)
            }
        }
    }
}

impl From<image::ImageError> for ConversionError {
    fn from(err: image::ImageError) -> Self {
        ConversionError::EncodingError(err.to_string())
    }
}

impl From<zip::result::ZipError> for ConversionError {
    fn from(err: zip::result::ZipError) -> Self {
        ConversionError::ArchiveError(err.to_string())
    }
}
