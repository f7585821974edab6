//! Configuration, request and result types for html-to-png conversion.

use crate::backend::Rect;
use crate::card_locator::SelectorTier;
use crate::error::{ConversionError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;

/// Configuration for the render worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of render workers (browser processes) in the pool.
    /// Default: 3.
    pub pool_size: usize,

    /// How long `acquire` waits for a worker when no timeout is given.
    /// Default: 30 seconds.
    pub acquire_timeout: Duration,

    /// Budget for a single liveness probe.
    /// Default: 5 seconds.
    pub probe_timeout: Duration,

    /// Budget for starting one backend instance.
    /// Default: 30 seconds.
    pub create_timeout: Duration,

    /// Pause between creation attempts while an acquirer is waiting.
    /// Default: 100 milliseconds.
    pub create_retry_backoff: Duration,

    /// Maximum number of conversions served by one worker before it is
    /// recycled. This bounds memory growth inside long-lived browsers.
    /// Zero disables recycling. Default: 100.
    pub max_uses_per_worker: u32,

    /// Whether unhealthy workers found by a health check are replaced in
    /// the background. Default: true.
    pub replenish: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            acquire_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            create_timeout: Duration::from_secs(30),
            create_retry_backoff: Duration::from_millis(100),
            max_uses_per_worker: 100,
            replenish: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool config with specified pool size.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Set the default acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the liveness probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the instance startup timeout.
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Set the maximum conversions per worker before recycling.
    pub fn max_uses_per_worker(mut self, max: u32) -> Self {
        self.max_uses_per_worker = max;
        self
    }

    /// Enable or disable background replacement of unhealthy workers.
    pub fn replenish(mut self, enabled: bool) -> Self {
        self.replenish = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ConversionError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConversionError::InvalidConfig(
                "acquire_timeout must be greater than 0".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() || self.create_timeout.is_zero() {
            return Err(ConversionError::InvalidConfig(
                "probe_timeout and create_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input limits checked before a worker is borrowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionLimits {
    /// Maximum document size in bytes. Default: 5 MiB.
    pub max_document_bytes: usize,
    /// Smallest accepted viewport side. Default: 100.
    pub min_dimension: u32,
    /// Default: 4000.
    pub max_width: u32,
    /// Default: 4000.
    pub max_height: u32,
    /// Default: 0.1.
    pub min_scale: f64,
    /// Default: 3.0.
    pub max_scale: f64,
}

impl Default for ConversionLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: 5 * 1024 * 1024,
            min_dimension: 100,
            max_width: 4000,
            max_height: 4000,
            min_scale: 0.1,
            max_scale: 3.0,
        }
    }
}

impl ConversionLimits {
    /// Check a request against the limits.
    pub fn check(&self, request: &ConversionRequest) -> Result<()> {
        let invalid = |msg: String| Err(ConversionError::InvalidOptions(msg));
        let options = &request.options;

        if request.document.trim().is_empty() {
            return invalid("document must not be empty".to_string());
        }
        if request.document.len() > self.max_document_bytes {
            return invalid(format!(
                "document is {} bytes, maximum is {} bytes",
                request.document.len(),
                self.max_document_bytes
            ));
        }
        if options.width < self.min_dimension || options.width > self.max_width {
            return invalid(format!(
                "width must be between {} and {}, got {}",
                self.min_dimension, self.max_width, options.width
            ));
        }
        if options.height < self.min_dimension || options.height > self.max_height {
            return invalid(format!(
                "height must be between {} and {}, got {}",
                self.min_dimension, self.max_height, options.height
            ));
        }
        if !options.scale.is_finite()
            || options.scale < self.min_scale
            || options.scale > self.max_scale
        {
            return invalid(format!(
                "scale must be between {} and {}, got {}",
                self.min_scale, self.max_scale, options.scale
            ));
        }
        if let Some(clip) = &options.clip {
            if !clip.is_valid() {
                return invalid(format!("clip {:?} must have a positive size", clip));
            }
            if clip.x < 0.0 || clip.y < 0.0 {
                return invalid(format!("clip {:?} must not start at negative coordinates", clip));
            }
        }
        if let Some(quality) = options.quality {
            if quality == 0 || quality > 100 {
                return invalid(format!("quality must be between 1 and 100, got {}", quality));
            }
        }
        if options.timeout_ms == Some(0) {
            return invalid("timeoutMs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Budgets for the content-settle waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleConfig {
    /// DOM ready plus network idle. Exceeding it fails the conversion.
    /// Default: 60 seconds.
    pub load_timeout: Duration,

    /// Web fonts ready. Exceeding it is logged and ignored.
    /// Default: 10 seconds.
    pub font_timeout: Duration,

    /// Per embedded image. An image that has not loaded in time counts as
    /// settled. Default: 5 seconds.
    pub image_timeout: Duration,

    /// Extra pause after everything settled. Default: none.
    pub settle_delay: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(60),
            font_timeout: Duration::from_secs(10),
            image_timeout: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
        }
    }
}

const FONT_STACK: &str = "\"Noto Sans SC\", \"PingFang SC\", \"Hiragino Sans GB\", \
    \"Microsoft YaHei\", \"WenQuanYi Micro Hei\", \"Helvetica Neue\", Helvetica, Arial, sans-serif";

/// How markup fragments are turned into a full document before loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Wrap documents that lack `<!DOCTYPE>` and `<html>`. Default: true.
    pub wrap_fragments: bool,

    /// `lang` attribute of the wrapper. Default: "zh-CN".
    pub lang: String,

    /// Stylesheet URLs linked from the wrapper head. Default: Noto Sans SC
    /// and Font Awesome 6.
    pub stylesheets: Vec<String>,

    /// Extra markup appended to the wrapper head.
    pub extra_head: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            wrap_fragments: true,
            lang: "zh-CN".to_string(),
            stylesheets: vec![
                "https://fonts.googleapis.com/css2?family=Noto+Sans+SC:wght@300;400;500;700&display=swap"
                    .to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css"
                    .to_string(),
            ],
            extra_head: String::new(),
        }
    }
}

impl DocumentConfig {
    /// Leave every document as submitted.
    pub fn passthrough() -> Self {
        Self {
            wrap_fragments: false,
            ..Default::default()
        }
    }

    /// Whether `document` is already a complete page.
    pub fn is_full_document(document: &str) -> bool {
        let head: String = document
            .trim_start_matches('\u{feff}')
            .trim_start()
            .chars()
            .take(9)
            .collect::<String>()
            .to_ascii_lowercase();
        head.starts_with("<!doctype") || head.starts_with("<html")
    }

    /// The markup handed to the backend.
    pub fn prepare<'a>(&self, document: &'a str) -> Cow<'a, str> {
        if !self.wrap_fragments || Self::is_full_document(document) {
            return Cow::Borrowed(document);
        }

        let links: String = self
            .stylesheets
            .iter()
            .map(|href| format!("<link rel=\"stylesheet\" href=\"{}\">\n", href))
            .collect();
        Cow::Owned(format!(
            "<!DOCTYPE html>\n<html lang=\"{lang}\">\n<head>\n\
             <meta charset=\"UTF-8\">\n\
             <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
             {links}<style>\n\
             body, text {{ font-family: {fonts}; -webkit-font-smoothing: antialiased; }}\n\
             .fa, .fas, .far, .fab {{ display: inline-block; font-style: normal; line-height: 1; }}\n\
             svg {{ shape-rendering: geometricPrecision; text-rendering: geometricPrecision; }}\n\
             </style>\n{extra}</head>\n<body>\n{document}\n</body>\n</html>\n",
            lang = self.lang,
            links = links,
            fonts = FONT_STACK,
            extra = self.extra_head,
            document = document,
        ))
    }
}

/// Card detection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    /// Minimum width and height of a card in CSS pixels. Default: 50.
    pub min_card_size: f64,

    /// Keep matches nested inside another match of the same tier.
    /// Default: false.
    pub keep_nested: bool,

    /// Selector tiers, most specific first.
    pub tiers: Vec<SelectorTier>,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            min_card_size: 50.0,
            keep_nested: false,
            tiers: SelectorTier::defaults(),
        }
    }
}

impl CardConfig {
    /// Set the minimum card size.
    pub fn min_card_size(mut self, size: f64) -> Self {
        self.min_card_size = size;
        self
    }

    /// Replace the selector tiers.
    pub fn tiers(mut self, tiers: Vec<SelectorTier>) -> Self {
        self.tiers = tiers;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_card_size.is_nan() || self.min_card_size < 0.0 {
            return Err(ConversionError::InvalidConfig(
                "min_card_size must not be negative".to_string(),
            ));
        }
        if self.tiers.is_empty() {
            return Err(ConversionError::InvalidConfig(
                "at least one card selector tier is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Image encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeConfig {
    /// Threads used to transcode captured images.
    /// Default: number of CPU cores.
    pub encode_threads: usize,

    /// Colour used when transparency has to be flattened (JPEG).
    /// Default: white (255, 255, 255).
    pub background_color: (u8, u8, u8),

    /// JPEG quality when the request does not set one. Default: 90.
    pub default_jpeg_quality: u8,

    /// Largest accepted output image in pixels.
    /// Default: 12000 x 12000.
    pub max_output_pixels: u64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            encode_threads: num_cpus::get(),
            background_color: (255, 255, 255),
            default_jpeg_quality: 90,
            max_output_pixels: 12_000 * 12_000,
        }
    }
}

impl EncodeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.encode_threads == 0 {
            return Err(ConversionError::InvalidConfig(
                "encode_threads must be at least 1".to_string(),
            ));
        }
        if self.default_jpeg_quality == 0 || self.default_jpeg_quality > 100 {
            return Err(ConversionError::InvalidConfig(
                "default_jpeg_quality must be between 1 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Combined configuration for the converter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConverterConfig {
    /// Pool configuration.
    pub pool: PoolConfig,

    /// Input limits.
    pub limits: ConversionLimits,

    /// Settle budgets.
    pub settle: SettleConfig,

    /// Fragment wrapping.
    pub document: DocumentConfig,

    /// Card detection.
    pub cards: CardConfig,

    /// Encoding.
    pub encode: EncodeConfig,

    /// Overall deadline of a conversion when the request sets none.
    /// `None` means 60 seconds.
    pub request_timeout: Option<Duration>,
}

impl ConverterConfig {
    /// Create a new converter config with the given pool size.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: PoolConfig::with_pool_size(pool_size),
            ..Default::default()
        }
    }

    /// Overall deadline applied to requests without their own.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.unwrap_or(Duration::from_secs(60))
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.cards.validate()?;
        self.encode.validate()?;
        if self.limits.min_dimension == 0 || self.limits.min_scale <= 0.0 {
            return Err(ConversionError::InvalidConfig(
                "limits must have a positive minimum dimension and scale".to_string(),
            ));
        }
        Ok(())
    }
}

/// Single image or card split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Single,
    Cards,
}

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    /// MIME type.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    /// Whether the format keeps an alpha channel.
    pub fn supports_alpha(self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }
}

/// Per-request render options.
///
/// Field names follow the JSON request accepted by front ends
/// (`fullPage`, `transparentBackground`, `timeoutMs`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub full_page: bool,
    pub transparent_background: bool,
    pub mode: RenderMode,
    /// Capture only this rectangle (single mode).
    pub clip: Option<Rect>,
    pub format: OutputFormat,
    /// JPEG quality.
    pub quality: Option<u8>,
    /// Overall deadline for this request.
    pub timeout_ms: Option<u64>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            scale: 2.0,
            full_page: true,
            transparent_background: false,
            mode: RenderMode::Single,
            clip: None,
            format: OutputFormat::Png,
            quality: None,
            timeout_ms: None,
        }
    }
}

/// A single conversion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// HTML markup to render.
    pub document: String,

    #[serde(flatten)]
    pub options: RenderOptions,
}

impl ConversionRequest {
    /// Create a new single-image request with default options.
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            options: RenderOptions::default(),
        }
    }

    /// Set the viewport size.
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.options.width = width;
        self.options.height = height;
        self
    }

    /// Set the device pixel scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.options.scale = scale;
        self
    }

    /// Switch to card split mode.
    pub fn cards(mut self) -> Self {
        self.options.mode = RenderMode::Cards;
        self
    }

    /// Capture only the viewport instead of the full scrollable page.
    pub fn viewport_only(mut self) -> Self {
        self.options.full_page = false;
        self
    }

    /// Capture only a rectangle.
    pub fn with_clip(mut self, clip: Rect) -> Self {
        self.options.clip = Some(clip);
        self
    }

    /// Omit the page background.
    pub fn transparent(mut self) -> Self {
        self.options.transparent_background = true;
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.options.format = format;
        self
    }

    /// Set the overall deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis().max(1) as u64);
        self
    }
}

/// An encoded image.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    /// Encoded image data.
    pub data: Vec<u8>,

    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Encoding of `data`.
    pub format: OutputFormat,
}

impl RenderedImage {
    /// Size of the encoded image.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// One exported card.
#[derive(Debug, Clone)]
pub struct CardImage {
    /// Card number (1-indexed, document order).
    pub index: usize,

    /// Card bounds in CSS pixels.
    pub rect: Rect,

    pub image: RenderedImage,
}

/// What a conversion produced.
#[derive(Debug, Clone)]
pub enum RenderOutput {
    Single(RenderedImage),
    /// Never empty.
    Cards(Vec<CardImage>),
}

/// Result of one conversion.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub output: RenderOutput,

    /// Processing time including the wait for a worker.
    pub duration: Duration,
}

impl RenderResult {
    /// Number of images produced.
    pub fn image_count(&self) -> usize {
        match &self.output {
            RenderOutput::Single(_) => 1,
            RenderOutput::Cards(cards) => cards.len(),
        }
    }

    /// Total encoded bytes across all images.
    pub fn byte_len(&self) -> usize {
        match &self.output {
            RenderOutput::Single(image) => image.byte_len(),
            RenderOutput::Cards(cards) => cards.iter().map(|c| c.image.byte_len()).sum(),
        }
    }
}
