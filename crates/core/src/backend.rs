//! Render backend abstraction.
//!
//! A backend is a long-lived, expensive process (typically a headless
//! browser) that the [`WorkerPool`](crate::pool::WorkerPool) keeps warm.
//! Each conversion opens an isolated [`RenderSession`] inside a borrowed
//! backend, loads the document, waits for it to settle and captures pixels.

use crate::config::OutputFormat;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "cdp")]
pub mod chrome;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// Identity of a backend instance inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Positive, finite size and finite origin.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// Viewport of a render session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    /// Device pixel ratio.
    pub scale: f64,
}

/// Region to capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureTarget {
    /// The whole scrollable document.
    FullPage,
    /// Only the visible viewport.
    Viewport,
    /// A rectangle in CSS pixels.
    Clip(Rect),
}

/// Parameters of one screenshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub target: CaptureTarget,
    /// Omit the default white page background.
    pub transparent: bool,
    pub format: OutputFormat,
    /// Lossy quality (JPEG/WebP), 1..=100.
    pub quality: Option<u8>,
}

/// An element of a loaded document, as reported for card detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Lowercase tag name.
    pub tag: String,
    /// Attribute values by lowercase name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Bounding box in CSS pixels, relative to the document.
    pub rect: Rect,
    /// Index of the closest element ancestor in the same snapshot.
    #[serde(default)]
    pub parent: Option<usize>,
    /// Outer markup.
    #[serde(default)]
    pub markup: String,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Whitespace separated class tokens.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }
}

/// Elements of a document in document order.
pub type ElementSnapshot = Vec<ElementInfo>;

/// Failure categories reported by backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The process or session is gone.
    Crashed,
    /// The document could not be loaded.
    Navigation,
    /// The backend ran out of memory.
    OutOfMemory,
    /// A backend-internal timeout.
    Timeout,
    /// Capturing failed but the session is still usable.
    Capture,
    /// The requested image format cannot be produced natively.
    UnsupportedFormat,
    /// Unexpected protocol traffic.
    Protocol,
}

/// Error reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Crashed, message)
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Capture, message)
    }

    pub fn unsupported_format(format: OutputFormat) -> Self {
        Self::new(
            BackendErrorKind::UnsupportedFormat,
            format!("format '{}' is not supported natively", format.extension()),
        )
    }

    /// Classify a free-form backend message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("memory") {
            BackendErrorKind::OutOfMemory
        } else if lower.contains("timeout") || lower.contains("timed out") {
            BackendErrorKind::Timeout
        } else if lower.contains("navigat") || lower.contains("net::err") {
            BackendErrorKind::Navigation
        } else if lower.contains("target closed")
            || lower.contains("connection closed")
            || lower.contains("crash")
            || lower.contains("disconnected")
        {
            BackendErrorKind::Crashed
        } else {
            BackendErrorKind::Protocol
        };
        Self { kind, message }
    }

    /// Errors after which the backend instance must not be reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Crashed | BackendErrorKind::OutOfMemory | BackendErrorKind::Protocol
        )
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Creates backend instances.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Start a new backend instance.
    async fn create(&self, id: WorkerId) -> BackendResult<Arc<dyn RenderBackend>>;
}

/// A running backend instance.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Liveness probe. Returns a version string on success.
    async fn probe(&self) -> BackendResult<String>;

    /// Open an isolated session (a tab) with the given viewport.
    async fn open_session(&self, viewport: Viewport) -> BackendResult<Box<dyn RenderSession>>;

    /// Terminate the instance. Must be idempotent.
    async fn close(&self);
}

/// An isolated page inside a backend.
///
/// Methods take `&self` so that independent waits (one per embedded image)
/// can run concurrently.
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Load the markup. Resolves once the DOM is parsed.
    async fn load(&self, document: &str) -> BackendResult<()>;

    /// Resolves once no network requests have been in flight for a while.
    async fn wait_for_network_idle(&self) -> BackendResult<()>;

    /// Resolves once web fonts report ready.
    async fn wait_for_fonts(&self) -> BackendResult<()>;

    /// Number of embedded images in the document.
    async fn image_count(&self) -> BackendResult<usize>;

    /// Resolves once image `index` has loaded or failed.
    async fn wait_for_image(&self, index: usize) -> BackendResult<()>;

    /// Report the document's elements for card detection.
    async fn snapshot_elements(&self) -> BackendResult<ElementSnapshot>;

    /// Take a screenshot. Returns encoded bytes in `request.format`.
    async fn capture(&self, request: &CaptureRequest) -> BackendResult<Vec<u8>>;

    /// Close the session.
    async fn close(&self);
}
