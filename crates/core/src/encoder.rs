//! Output image encoding.
//!
//! Backends return encoded screenshots. When a backend cannot produce the
//! requested format itself, it captures PNG and the image is transcoded
//! here. Every image leaving this module has been decoded once to check
//! that its dimensions are sane.
//!
//! Card batches are transcoded in parallel on a dedicated rayon pool.

use crate::config::{EncodeConfig, OutputFormat, RenderedImage};
use crate::error::{ConversionError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageReader, RgbaImage};
use rayon::prelude::*;
use std::io::Cursor;
use tracing::{debug, info};

/// Bytes captured by a backend, not yet verified.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub data: Vec<u8>,
    /// Encoding of `data`.
    pub format: OutputFormat,
}

/// Transcodes and verifies captured images.
pub struct ImageEncoder {
    config: EncodeConfig,
    /// Rayon thread pool for batch encoding.
    thread_pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ImageEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEncoder")
            .field("config", &self.config)
            .finish()
    }
}

impl ImageEncoder {
    /// Create an encoder.
    pub fn new(config: EncodeConfig) -> Result<Self> {
        config.validate()?;

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.encode_threads)
            .thread_name(|i| format!("html-to-png-encode-{}", i))
            .build()
            .map_err(|e| {
                ConversionError::InvalidConfig(format!("Failed to create thread pool: {}", e))
            })?;

        info!(
            "Image encoder initialized with {} threads",
            config.encode_threads
        );

        Ok(Self {
            config,
            thread_pool,
        })
    }

    /// Encoding configuration.
    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    /// Bring a captured image into `target` and verify it.
    pub fn finish(
        &self,
        captured: CapturedImage,
        target: OutputFormat,
        quality: Option<u8>,
    ) -> Result<RenderedImage> {
        if captured.format == target {
            let (width, height) = inspect_dimensions(&captured.data)?;
            self.check_dimensions(width, height)?;
            return Ok(RenderedImage {
                data: captured.data,
                width,
                height,
                format: target,
            });
        }

        let decoded = image::load_from_memory(&captured.data)?.to_rgba8();
        self.check_dimensions(decoded.width(), decoded.height())?;
        debug!(
            "Transcoding {}x{} image from {} to {}",
            decoded.width(),
            decoded.height(),
            captured.format.extension(),
            target.extension()
        );
        self.encode(decoded, target, quality)
    }

    /// [`finish`](Self::finish) for many images at once, in parallel.
    /// Results keep the input order.
    pub fn finish_batch(
        &self,
        captured: Vec<CapturedImage>,
        target: OutputFormat,
        quality: Option<u8>,
    ) -> Vec<Result<RenderedImage>> {
        self.thread_pool.install(|| {
            captured
                .into_par_iter()
                .map(|image| self.finish(image, target, quality))
                .collect()
        })
    }

    /// Encode raw pixels.
    pub fn encode(
        &self,
        image: RgbaImage,
        target: OutputFormat,
        quality: Option<u8>,
    ) -> Result<RenderedImage> {
        let (width, height) = image.dimensions();
        let image = if target.supports_alpha() {
            image
        } else {
            self.apply_background(image)
        };
        let data = match target {
            OutputFormat::Png => encode_png(&image)?,
            OutputFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
                let quality = quality.unwrap_or(self.config.default_jpeg_quality);
                let mut buffer = Vec::new();
                JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(&rgb)?;
                buffer
            }
            OutputFormat::Webp => {
                let mut buffer = Vec::new();
                WebPEncoder::new_lossless(&mut buffer).encode(
                    image.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
                buffer
            }
        };

        Ok(RenderedImage {
            data,
            width,
            height,
            format: target,
        })
    }

    /// Flatten transparency onto the configured background colour.
    fn apply_background(&self, mut image: RgbaImage) -> RgbaImage {
        let (r, g, b) = self.config.background_color;

        for pixel in image.pixels_mut() {
            let alpha = pixel[3] as f32 / 255.0;
            if alpha < 1.0 {
                let inv_alpha = 1.0 - alpha;
                pixel[0] = ((pixel[0] as f32 * alpha) + (r as f32 * inv_alpha)) as u8;
                pixel[1] = ((pixel[1] as f32 * alpha) + (g as f32 * inv_alpha)) as u8;
                pixel[2] = ((pixel[2] as f32 * alpha) + (b as f32 * inv_alpha)) as u8;
                pixel[3] = 255;
            }
        }

        image
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ConversionError::EncodingError(format!(
                "captured image is empty ({}x{})",
                width, height
            )));
        }
        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.config.max_output_pixels {
            return Err(ConversionError::EncodingError(format!(
                "captured image {}x{} exceeds the limit of {} pixels",
                width, height, self.config.max_output_pixels
            )));
        }
        Ok(())
    }
}

/// Read the dimensions from an encoded image header.
pub fn inspect_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ConversionError::EncodingError(format!("Unreadable image: {}", e)))?;
    Ok(reader.into_dimensions()?)
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());

    let mut encoder = png::Encoder::new(&mut buffer, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::Fast);

    let mut writer = encoder.write_header().map_err(|e| {
        ConversionError::EncodingError(format!("Failed to write PNG header: {}", e))
    })?;
    writer.write_image_data(image.as_raw()).map_err(|e| {
        ConversionError::EncodingError(format!("Failed to write PNG data: {}", e))
    })?;
    drop(writer);

    Ok(buffer.into_inner())
}
