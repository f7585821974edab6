//! # html-to-png-core
//!
//! HTML to image rendering on top of a pool of warm headless browsers.
//!
//! - **Worker pool** of long-lived browser processes with probing,
//!   recycling and background replacement
//! - **Card mode** that detects the cards of a composite page and exports
//!   each one as its own image
//! - **Format fallback**: PNG, JPEG or WebP, transcoded locally when the
//!   browser cannot produce a format itself
//! - **Packaging** of results as a single image or a zip of cards
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "cdp")]
//! use html_to_png_core::{Converter, ConverterConfig, ConversionRequest, package};
//!
//! # #[cfg(feature = "cdp")]
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Three Chrome instances, default limits
//!     let converter = Converter::with_chrome(ConverterConfig::new(3)).await?;
//!
//!     let request = ConversionRequest::new("<h1>Hello</h1>").with_viewport(800, 600);
//!     let result = converter.convert(request).await?;
//!
//!     let response = package(&result)?;
//!     println!("{} ({} bytes)", response.filename, response.body.len());
//!     Ok(())
//! }
//! # #[cfg(not(feature = "cdp"))]
//! # fn main() {}
//! ```
//!
//! ## Splitting Cards
//!
//! ```rust,no_run
//! # #[cfg(feature = "cdp")]
//! use html_to_png_core::{ConverterBuilder, ConversionRequest, RenderOutput};
//!
//! # #[cfg(feature = "cdp")]
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let converter = ConverterBuilder::new().pool_size(2).build().await?;
//!
//!     let html = r#"<div class="card">A</div><div class="card">B</div>"#;
//!     let result = converter.convert(ConversionRequest::new(html).cards()).await?;
//!
//!     if let RenderOutput::Cards(cards) = &result.output {
//!         for card in cards {
//!             println!("card {}: {}x{}", card.index, card.image.width, card.image.height);
//!         }
//!     }
//!     converter.shutdown().await;
//!     Ok(())
//! }
//! # #[cfg(not(feature = "cdp"))]
//! # fn main() {}
//! ```

pub mod backend;
pub mod card_locator;
pub mod config;
pub mod converter;
pub mod encoder;
pub mod error;
pub mod package;
pub mod pool;

// Re-export main types for convenience
pub use backend::{
    BackendError, BackendErrorKind, BackendFactory, ElementInfo, Rect, RenderBackend,
    RenderSession, WorkerId,
};
pub use card_locator::{locate_cards, CardCandidate, SelectorTier};
pub use config::{
    CardConfig, CardImage, ConversionLimits, ConversionRequest, ConverterConfig, DocumentConfig,
    EncodeConfig, OutputFormat, PoolConfig, RenderMode, RenderOptions, RenderOutput, RenderResult,
    RenderedImage, SettleConfig,
};
pub use converter::{Converter, ConverterBuilder, ConverterStats};
pub use encoder::ImageEncoder;
pub use error::{ConversionError, Result, WorkerDisposition};
pub use package::{package, PackagedOutput};
pub use pool::{InstanceHealth, Liveness, PoolHealth, PoolStats, PooledWorker, WorkerPool};

/// Initialize the library's logging.
/// Call this once at application startup if you want to see logs.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
