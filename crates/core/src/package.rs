//! Turning a [`RenderResult`] into a response body.
//!
//! A single image is returned as is. Cards come back as a raw image when
//! there is exactly one, otherwise as a zip archive with one entry per card.

use crate::config::{CardImage, RenderOutput, RenderResult};
use crate::error::{ConversionError, Result};
use serde::Serialize;
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::FileOptions;
use zip::ZipWriter;

pub const HEADER_PROCESSING_TIME: &str = "X-Processing-Time";
pub const HEADER_IMAGE_SIZE: &str = "X-Image-Size";
pub const HEADER_CARDS_COUNT: &str = "X-Cards-Count";

/// Response body plus metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PackagedOutput {
    pub content_type: String,
    /// Suggested download name.
    pub filename: String,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl PackagedOutput {
    /// Value of a response header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Content-Disposition` value for the suggested file name.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

/// Package a conversion result.
pub fn package(result: &RenderResult) -> Result<PackagedOutput> {
    let mut headers = vec![(
        HEADER_PROCESSING_TIME.to_string(),
        result.duration.as_millis().to_string(),
    )];

    let packaged = match &result.output {
        RenderOutput::Single(image) => {
            headers.push((HEADER_IMAGE_SIZE.to_string(), image.byte_len().to_string()));
            PackagedOutput {
                content_type: image.format.content_type().to_string(),
                filename: format!("converted.{}", image.format.extension()),
                body: image.data.clone(),
                headers,
            }
        }
        RenderOutput::Cards(cards) => {
            headers.push((HEADER_CARDS_COUNT.to_string(), cards.len().to_string()));
            match cards.as_slice() {
                [] => return Err(ConversionError::NoCardsFound),
                [card] => {
                    headers.push((
                        HEADER_IMAGE_SIZE.to_string(),
                        card.image.byte_len().to_string(),
                    ));
                    PackagedOutput {
                        content_type: card.image.format.content_type().to_string(),
                        filename: format!("card.{}", card.image.format.extension()),
                        body: card.image.data.clone(),
                        headers,
                    }
                }
                cards => PackagedOutput {
                    content_type: "application/zip".to_string(),
                    filename: "cards.zip".to_string(),
                    body: archive(cards)?,
                    headers,
                },
            }
        }
    };

    debug!(
        "Packaged {} ({} bytes)",
        packaged.filename,
        packaged.body.len()
    );
    Ok(packaged)
}

/// Name of a card inside the archive.
pub fn card_entry_name(card: &CardImage) -> String {
    format!("card_{}.{}", card.index, card.image.format.extension())
}

fn archive(cards: &[CardImage]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for card in cards {
        zip.start_file(card_entry_name(card), options)?;
        zip.write_all(&card.image.data).map_err(|e| {
            ConversionError::ArchiveError(format!(
                "Failed to write card {}: {}",
                card.index, e
            ))
        })?;
    }

    Ok(zip.finish()?.into_inner())
}
