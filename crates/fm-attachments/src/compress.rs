//! Upload compression
//!
//! Shrinks oversized raster images to a byte budget before they are handed
//! to the upload contract. Non-images and files already within budget pass
//! through untouched.

use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use fm_core::config::CompressionConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageError, RgbImage};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::model::{is_raster_image, PendingFile};

/// Quality of the first encode attempt
pub const QUALITY_START: u8 = 90;
/// Lowest quality the search will try
pub const QUALITY_FLOOR: u8 = 50;
/// Quality decrement between attempts
pub const QUALITY_STEP: u8 = 10;
/// Upper bound on encode attempts: 90, 80, 70, 60, 50
pub const MAX_ENCODE_ATTEMPTS: u32 = ((QUALITY_START - QUALITY_FLOOR) / QUALITY_STEP) as u32 + 1;

/// Quality used for local previews
const PREVIEW_QUALITY: u8 = 75;

/// Longest side of a local preview
pub const PREVIEW_MAX_EDGE: u32 = 256;

/// Content type of every re-encoded image
pub const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";

/// Compression errors
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Failed to decode image {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: ImageError,
    },
    #[error("Failed to encode image {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: ImageError,
    },
    #[error("Compression worker failed: {0}")]
    Worker(String),
}

pub type CompressResult<T> = Result<T, CompressError>;

/// Size and dimension targets for one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionBudget {
    pub max_size_bytes: u64,
    pub max_dimension_px: u32,
}

impl Default for CompressionBudget {
    fn default() -> Self {
        CompressionConfig::default().into()
    }
}

impl From<CompressionConfig> for CompressionBudget {
    fn from(config: CompressionConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes,
            max_dimension_px: config.max_dimension_px,
        }
    }
}

impl CompressionBudget {
    pub fn new(max_size_bytes: u64, max_dimension_px: u32) -> Self {
        Self {
            max_size_bytes,
            max_dimension_px,
        }
    }
}

/// What the compressor did with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// Not a raster image; returned unchanged
    NotRaster,
    /// Already within the byte budget; returned unchanged
    WithinBudget,
    /// Re-encoded as JPEG
    Reencoded,
    /// Re-encoding did not shrink the file; original returned
    NoGain,
}

/// Details of one compression run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    pub outcome: CompressionOutcome,
    /// Number of JPEG encodes performed
    pub attempts: u32,
    /// Quality of the last encode, if any
    pub final_quality: Option<u8>,
    pub original_size: u64,
    pub output_size: u64,
    pub original_dimensions: Option<(u32, u32)>,
    pub output_dimensions: Option<(u32, u32)>,
}

impl CompressionReport {
    fn passthrough(outcome: CompressionOutcome, size: u64) -> Self {
        Self {
            outcome,
            attempts: 0,
            final_quality: None,
            original_size: size,
            output_size: size,
            original_dimensions: None,
            output_dimensions: None,
        }
    }

    /// Whether the returned file fits the budget it was compressed against
    pub fn within(&self, budget: &CompressionBudget) -> bool {
        self.output_size <= budget.max_size_bytes
    }
}

/// Dimensions that fit inside a `max_edge` square, preserving aspect ratio.
///
/// Never upscales; each side is at least one pixel, even for a zero edge.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let max_edge = max_edge.max(1);
    if width <= max_edge && height <= max_edge {
        return (width, height);
    }

    if width >= height {
        let scaled_height = ((height as f64) * (max_edge as f64) / (width as f64)).round() as u32;
        (max_edge, scaled_height.max(1))
    } else {
        let scaled_width = ((width as f64) * (max_edge as f64) / (height as f64)).round() as u32;
        (scaled_width.max(1), max_edge)
    }
}

/// Compress one file on the current thread
pub fn compress_blocking(
    file: &PendingFile,
    budget: CompressionBudget,
) -> CompressResult<PendingFile> {
    compress_with_report_blocking(file, budget).map(|(file, _)| file)
}

/// Compress one file on the current thread and describe what happened
pub fn compress_with_report_blocking(
    file: &PendingFile,
    budget: CompressionBudget,
) -> CompressResult<(PendingFile, CompressionReport)> {
    let original_size = file.size();

    if !is_raster_image(&file.content_type) {
        return Ok((
            file.clone(),
            CompressionReport::passthrough(CompressionOutcome::NotRaster, original_size),
        ));
    }

    if original_size <= budget.max_size_bytes {
        return Ok((
            file.clone(),
            CompressionReport::passthrough(CompressionOutcome::WithinBudget, original_size),
        ));
    }

    let decoded = image::load_from_memory(&file.bytes).map_err(|source| CompressError::Decode {
        name: file.name.clone(),
        source,
    })?;
    let (width, height) = decoded.dimensions();
    let (target_width, target_height) = fit_within(width, height, budget.max_dimension_px);

    let scaled = if target_width == width && target_height == height {
        decoded
    } else {
        decoded.resize_exact(target_width, target_height, FilterType::Triangle)
    };
    // JPEG carries no alpha channel
    let rgb = scaled.to_rgb8();

    let mut quality = QUALITY_START;
    let mut attempts = 0;
    let encoded = loop {
        let bytes = encode_jpeg(&rgb, quality).map_err(|source| CompressError::Encode {
            name: file.name.clone(),
            source,
        })?;
        attempts += 1;

        debug!(
            file = %file.name,
            quality = quality,
            size = bytes.len(),
            budget = budget.max_size_bytes,
            "Encode attempt"
        );

        if bytes.len() as u64 <= budget.max_size_bytes || quality <= QUALITY_FLOOR {
            break bytes;
        }
        quality -= QUALITY_STEP;
    };

    let output_size = encoded.len() as u64;
    if output_size >= original_size {
        return Ok((
            file.clone(),
            CompressionReport {
                outcome: CompressionOutcome::NoGain,
                attempts,
                final_quality: Some(quality),
                original_size,
                output_size: original_size,
                original_dimensions: Some((width, height)),
                output_dimensions: Some((width, height)),
            },
        ));
    }

    if output_size > budget.max_size_bytes {
        warn!(
            file = %file.name,
            size = output_size,
            budget = budget.max_size_bytes,
            "Image still above budget at quality floor"
        );
    }

    let output = file.with_content(
        jpeg_name(&file.name),
        OUTPUT_CONTENT_TYPE,
        Bytes::from(encoded),
    );
    let report = CompressionReport {
        outcome: CompressionOutcome::Reencoded,
        attempts,
        final_quality: Some(quality),
        original_size,
        output_size,
        original_dimensions: Some((width, height)),
        output_dimensions: Some((target_width, target_height)),
    };

    Ok((output, report))
}

/// Compress one file on the blocking pool
pub async fn compress(file: PendingFile, budget: CompressionBudget) -> CompressResult<PendingFile> {
    compress_with_report(file, budget).await.map(|(file, _)| file)
}

/// Compress one file on the blocking pool and describe what happened
#[instrument(skip(file), fields(file = %file.name, size = file.size()))]
pub async fn compress_with_report(
    file: PendingFile,
    budget: CompressionBudget,
) -> CompressResult<(PendingFile, CompressionReport)> {
    let (output, report) =
        tokio::task::spawn_blocking(move || compress_with_report_blocking(&file, budget))
            .await
            .map_err(|e| CompressError::Worker(e.to_string()))??;

    debug!(
        outcome = ?report.outcome,
        attempts = report.attempts,
        output_size = report.output_size,
        "Compression finished"
    );

    Ok((output, report))
}

/// Compress every file independently.
///
/// Results keep the input order; one failure does not affect the others.
pub async fn compress_many(
    files: Vec<PendingFile>,
    budget: CompressionBudget,
) -> Vec<CompressResult<PendingFile>> {
    futures::future::join_all(files.into_iter().map(|file| compress(file, budget))).await
}

/// Compress every file, dropping the ones that fail
pub async fn compress_many_lossy(
    files: Vec<PendingFile>,
    budget: CompressionBudget,
) -> Vec<PendingFile> {
    compress_many(files, budget)
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "Skipping file that could not be compressed");
                None
            }
        })
        .collect()
}

impl PendingFile {
    /// Attach a small JPEG thumbnail for display before upload.
    ///
    /// Non-raster files and undecodable images get no preview.
    pub fn with_local_preview(mut self, max_edge: u32) -> Self {
        if !is_raster_image(&self.content_type) {
            return self;
        }

        match render_preview(&self.bytes, max_edge) {
            Ok(preview) => self.local_preview = Some(Bytes::from(preview)),
            Err(e) => warn!(file = %self.name, error = %e, "Could not render local preview"),
        }
        self
    }
}

fn render_preview(bytes: &[u8], max_edge: u32) -> Result<Vec<u8>, ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = decoded.dimensions();
    let (target_width, target_height) = fit_within(width, height, max_edge);

    let preview = if target_width == width && target_height == height {
        decoded
    } else {
        decoded.thumbnail_exact(target_width, target_height)
    };
    encode_jpeg(&preview.to_rgb8(), PREVIEW_QUALITY)
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode_image(rgb)?;
    }
    Ok(out.into_inner())
}

fn jpeg_name(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match stem {
        Some(stem) => format!("{}.jpg", stem),
        None => format!("image-{}.jpg", chrono::Utc::now().timestamp_millis()),
    }
}
