//! Conversion pipeline that ties together the worker pool, card detection and
//! the image encoder.
//!
//! A conversion borrows one worker, opens a session, loads the document,
//! waits for it to settle and captures either the whole page or every
//! detected card. The worker is released or retired exactly once, depending
//! on how the call ended.

use crate::backend::{
    BackendError, BackendErrorKind, BackendFactory, CaptureRequest, CaptureTarget, RenderSession,
    Viewport,
};
use crate::card_locator::{locate_cards, CardCandidate};
use crate::config::{
    CardImage, ConversionLimits, ConversionRequest, ConverterConfig, DocumentConfig, OutputFormat,
    RenderMode, RenderOptions, RenderOutput, RenderResult, RenderedImage,
};
use crate::encoder::{CapturedImage, ImageEncoder};
use crate::error::{ConversionError, Result};
use crate::pool::{PoolHealth, PoolStats, PooledWorker, WorkerPool};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Main converter for HTML documents to images.
///
/// This is the primary interface for conversions. It owns a pool of render
/// backends and an encoder thread pool.
pub struct Converter {
    /// Render worker pool.
    pool: Arc<WorkerPool>,
    /// Transcoding and verification of captured images.
    encoder: Arc<ImageEncoder>,
    /// Configuration.
    config: ConverterConfig,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

impl Converter {
    /// Create a new converter with the given configuration and backend.
    pub async fn new(config: ConverterConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;

        info!(
            "Initializing converter with pool_size={}, request_timeout={:?}",
            config.pool.pool_size,
            config.request_timeout()
        );

        let encoder = ImageEncoder::new(config.encode.clone())?;
        let pool = WorkerPool::new(config.pool.clone(), factory).await?;

        Ok(Self {
            pool: Arc::new(pool),
            encoder: Arc::new(encoder),
            config,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Create a converter backed by headless Chrome.
    #[cfg(feature = "cdp")]
    pub async fn with_chrome(config: ConverterConfig) -> Result<Self> {
        let factory = crate::backend::chrome::ChromeFactory::new(Default::default())?;
        Self::new(config, Arc::new(factory)).await
    }

    /// Convert one document.
    pub async fn convert(&self, request: ConversionRequest) -> Result<RenderResult> {
        let start = Instant::now();
        let request_id = Uuid::new_v4();

        info!(
            "[{}] Converting {} byte document ({:?} mode, {}x{} @{}x)",
            request_id,
            request.document.len(),
            request.options.mode,
            request.options.width,
            request.options.height,
            request.options.scale
        );

        let outcome = self.run(&request, request_id, start).await;
        match &outcome {
            Ok(result) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[{}] Produced {} image(s), {} bytes in {:?}",
                    request_id,
                    result.image_count(),
                    result.byte_len(),
                    result.duration
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("[{}] Conversion failed after {:?}: {}", request_id, start.elapsed(), e);
            }
        }
        outcome
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        request_id: Uuid,
        start: Instant,
    ) -> Result<RenderResult> {
        self.config.limits.check(request)?;

        let budget = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.request_timeout());
        let deadline = start + budget;

        let worker = self.pool.acquire_until(deadline).await?;
        debug!("[{}] Using {}", request_id, worker.id());

        let outcome = match timeout_at(deadline, self.render_on(&worker, request, request_id)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ConversionError::Timeout {
                timeout_ms: budget.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(_) => worker.release().await,
            Err(e) => {
                let disposition = e.worker_disposition();
                debug!("[{}] {:?} {} after error", request_id, disposition, worker.id());
                worker.dispose(disposition, &e.to_string()).await;
            }
        }

        outcome.map(|output| RenderResult {
            output,
            duration: start.elapsed(),
        })
    }

    async fn render_on(
        &self,
        worker: &PooledWorker,
        request: &ConversionRequest,
        request_id: Uuid,
    ) -> Result<RenderOutput> {
        let options = &request.options;
        let session = worker
            .backend()
            .open_session(Viewport {
                width: options.width,
                height: options.height,
                scale: options.scale,
            })
            .await?;

        let outcome = self
            .render_in_session(session.as_ref(), request, request_id)
            .await;
        session.close().await;
        outcome
    }

    async fn render_in_session(
        &self,
        session: &dyn RenderSession,
        request: &ConversionRequest,
        request_id: Uuid,
    ) -> Result<RenderOutput> {
        self.settle(session, &request.document, request_id).await?;

        let options = &request.options;
        match options.mode {
            RenderMode::Single => {
                let target = match options.clip {
                    Some(clip) => CaptureTarget::Clip(clip),
                    None if options.full_page => CaptureTarget::FullPage,
                    None => CaptureTarget::Viewport,
                };
                let captured = self.capture(session, target, options).await?;
                let image = self.encode_one(captured, options).await?;
                Ok(RenderOutput::Single(image))
            }
            RenderMode::Cards => self
                .render_cards(session, options, request_id)
                .await
                .map(RenderOutput::Cards),
        }
    }

    /// Load the document and wait until its content is stable.
    async fn settle(
        &self,
        session: &dyn RenderSession,
        document: &str,
        request_id: Uuid,
    ) -> Result<()> {
        let settle = &self.config.settle;
        let document = self.config.document.prepare(document);

        let load = async {
            session.load(&document).await?;
            session.wait_for_network_idle().await
        };
        match timeout(settle.load_timeout, load).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConversionError::LoadTimeout {
                    stage: "network idle",
                    timeout_ms: settle.load_timeout.as_millis() as u64,
                })
            }
        }

        match timeout(settle.font_timeout, session.wait_for_fonts()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => return Err(e.into()),
            Ok(Err(e)) => debug!("[{}] Font readiness failed, continuing: {}", request_id, e),
            Err(_) => warn!(
                "[{}] Fonts not ready after {:?}, continuing",
                request_id, settle.font_timeout
            ),
        }

        let images = session.image_count().await?;
        if images > 0 {
            let image_timeout = settle.image_timeout;
            let waits = (0..images).map(|index| async move {
                (index, timeout(image_timeout, session.wait_for_image(index)).await)
            });
            let mut pending = 0;
            for (index, outcome) in join_all(waits).await {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_fatal() => return Err(e.into()),
                    Ok(Err(e)) => debug!("[{}] Image {} failed: {}", request_id, index, e),
                    Err(_) => pending += 1,
                }
            }
            if pending > 0 {
                warn!(
                    "[{}] {} of {} images not loaded after {:?}, continuing",
                    request_id, pending, images, image_timeout
                );
            }
        }

        if !settle.settle_delay.is_zero() {
            sleep(settle.settle_delay).await;
        }
        Ok(())
    }

    /// Capture in the requested format, or in PNG when the backend cannot
    /// encode the requested one.
    async fn capture(
        &self,
        session: &dyn RenderSession,
        target: CaptureTarget,
        options: &RenderOptions,
    ) -> std::result::Result<CapturedImage, BackendError> {
        let quality = match options.format {
            OutputFormat::Jpeg => Some(
                options
                    .quality
                    .unwrap_or(self.config.encode.default_jpeg_quality),
            ),
            _ => options.quality,
        };
        let mut request = CaptureRequest {
            target,
            transparent: options.transparent_background,
            format: options.format,
            quality,
        };

        match session.capture(&request).await {
            Ok(data) => Ok(CapturedImage {
                data,
                format: options.format,
            }),
            Err(e)
                if e.kind == BackendErrorKind::UnsupportedFormat
                    && options.format != OutputFormat::Png =>
            {
                debug!("{}, capturing PNG instead", e.message);
                request.format = OutputFormat::Png;
                request.quality = None;
                let data = session.capture(&request).await?;
                Ok(CapturedImage {
                    data,
                    format: OutputFormat::Png,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn encode_one(
        &self,
        captured: CapturedImage,
        options: &RenderOptions,
    ) -> Result<RenderedImage> {
        let encoder = Arc::clone(&self.encoder);
        let (format, quality) = (options.format, options.quality);
        tokio::task::spawn_blocking(move || encoder.finish(captured, format, quality))
            .await
            .map_err(|e| ConversionError::EncodingError(format!("Encoder task failed: {}", e)))?
    }

    async fn render_cards(
        &self,
        session: &dyn RenderSession,
        options: &RenderOptions,
        request_id: Uuid,
    ) -> Result<Vec<CardImage>> {
        let elements = session.snapshot_elements().await?;
        let candidates = locate_cards(&elements, &self.config.cards);
        let Some(first) = candidates.first() else {
            info!("[{}] No cards in {} elements", request_id, elements.len());
            return Err(ConversionError::NoCardsFound);
        };
        info!(
            "[{}] Found {} card(s) with tier '{}'",
            request_id,
            candidates.len(),
            first.tier
        );

        let mut captured: Vec<(&CardCandidate, CapturedImage)> = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match self
                .capture(session, CaptureTarget::Clip(candidate.rect), options)
                .await
            {
                Ok(image) => captured.push((candidate, image)),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!(
                    "[{}] Skipping card {}: {}",
                    request_id, candidate.index, e
                ),
            }
        }

        let (kept, images): (Vec<&CardCandidate>, Vec<CapturedImage>) =
            captured.into_iter().unzip();
        let encoder = Arc::clone(&self.encoder);
        let (format, quality) = (options.format, options.quality);
        let encoded = tokio::task::spawn_blocking(move || {
            encoder.finish_batch(images, format, quality)
        })
        .await
        .map_err(|e| ConversionError::EncodingError(format!("Encoder task failed: {}", e)))?;

        let mut cards = Vec::with_capacity(kept.len());
        for (candidate, result) in kept.into_iter().zip(encoded) {
            match result {
                Ok(image) => cards.push(CardImage {
                    index: cards.len() + 1,
                    rect: candidate.rect,
                    image,
                }),
                Err(e) => warn!(
                    "[{}] Dropping card {}: {}",
                    request_id, candidate.index, e
                ),
            }
        }

        if cards.is_empty() {
            warn!("[{}] Every card capture failed", request_id);
            return Err(ConversionError::NoCardsFound);
        }
        Ok(cards)
    }

    /// Convert many documents, at most `concurrency` at a time. Results keep
    /// the input order.
    pub async fn convert_parallel(
        &self,
        requests: Vec<ConversionRequest>,
        concurrency: usize,
    ) -> Vec<Result<RenderResult>> {
        stream::iter(requests)
            .map(|request| self.convert(request))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Probe every worker.
    pub async fn health(&self) -> PoolHealth {
        self.pool.health_check().await
    }

    /// Shutdown the converter and close every worker.
    pub async fn shutdown(&self) {
        info!("Shutting down converter");
        self.pool.close().await;
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Get statistics about processing.
    pub fn stats(&self) -> ConverterStats {
        ConverterStats {
            conversions_succeeded: self.succeeded.load(Ordering::Relaxed),
            conversions_failed: self.failed.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }
}

/// Statistics about the converter.
#[derive(Debug, Clone)]
pub struct ConverterStats {
    pub conversions_succeeded: u64,
    /// Includes rejected requests.
    pub conversions_failed: u64,
    pub pool: PoolStats,
}

/// Builder for creating a Converter with custom settings.
pub struct ConverterBuilder {
    config: ConverterConfig,
    factory: Option<Arc<dyn BackendFactory>>,
}

impl ConverterBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ConverterConfig::default(),
            factory: None,
        }
    }

    /// Render backend to use.
    pub fn backend(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.pool_size = size;
        self
    }

    /// Set how long a conversion may wait for a worker when it has no
    /// deadline of its own.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    /// Set the default overall deadline of a conversion.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum conversions per worker before recycling.
    pub fn max_uses_per_worker(mut self, max: u32) -> Self {
        self.config.pool.max_uses_per_worker = max;
        self
    }

    /// Set the input limits.
    pub fn limits(mut self, limits: ConversionLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the minimum card size in CSS pixels.
    pub fn min_card_size(mut self, size: f64) -> Self {
        self.config.cards.min_card_size = size;
        self
    }

    /// Set an extra pause after the document settled.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle.settle_delay = delay;
        self
    }

    /// Set how markup fragments are wrapped before loading.
    pub fn document(mut self, document: DocumentConfig) -> Self {
        self.config.document = document;
        self
    }

    /// Set the number of encoder threads.
    pub fn encode_threads(mut self, threads: usize) -> Self {
        self.config.encode.encode_threads = threads;
        self
    }

    /// Build the converter.
    pub async fn build(self) -> Result<Converter> {
        match self.factory {
            Some(factory) => Converter::new(self.config, factory).await,
            #[cfg(feature = "cdp")]
            None => Converter::with_chrome(self.config).await,
            #[cfg(not(feature = "cdp"))]
            None => Err(ConversionError::InvalidConfig(
                "no render backend configured".to_string(),
            )),
        }
    }
}

impl Default for ConverterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
