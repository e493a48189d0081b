//! Tile payload encoder.
//!
//! Opaque tiles are stored as JPEG at the configured quality. Tiles with an
//! alpha channel are stored as PNG so transparency survives.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, ImageReader};

use super::TileFormat;
use crate::codec::{PixelBuffer, PixelFormat};
use crate::error::DecodeError;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

// =============================================================================
// Tile Encoder
// =============================================================================

/// Encodes tile pixels for storage.
#[derive(Debug, Clone, Copy)]
pub struct TileEncoder {
    quality: u8,
}

impl TileEncoder {
    /// Create an encoder; `quality` is clamped to 1-100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: clamp_quality(quality),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Format a buffer will be stored in.
    pub fn format_for(pixels: &PixelBuffer) -> TileFormat {
        match pixels.format() {
            PixelFormat::Rgb => TileFormat::Jpeg,
            PixelFormat::Rgba => TileFormat::Png,
        }
    }

    /// Encode `pixels`, returning the chosen format and the payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Encode`] if the underlying encoder fails.
    pub fn encode(&self, pixels: &PixelBuffer) -> Result<(TileFormat, Bytes), DecodeError> {
        let mut output = Vec::new();
        let format = Self::format_for(pixels);
        let (w, h) = (pixels.width(), pixels.height());

        let result = match format {
            TileFormat::Jpeg => JpegEncoder::new_with_quality(&mut output, self.quality).encode(
                pixels.data(),
                w,
                h,
                ExtendedColorType::Rgb8,
            ),
            TileFormat::Png => {
                PngEncoder::new(&mut output).write_image(pixels.data(), w, h, ExtendedColorType::Rgba8)
            }
        };
        result.map_err(|e| DecodeError::Encode(e.to_string()))?;

        Ok((format, Bytes::from(output)))
    }

    /// Decode a stored payload.
    pub fn decode(format: TileFormat, data: &[u8]) -> Result<PixelBuffer, DecodeError> {
        let image_format = match format {
            TileFormat::Jpeg => ImageFormat::Jpeg,
            TileFormat::Png => ImageFormat::Png,
        };
        let image = ImageReader::with_format(Cursor::new(data), image_format)
            .decode()
            .map_err(|e| DecodeError::Codec {
                codec: format!("{:?}", format).to_lowercase(),
                message: e.to_string(),
            })?;
        Ok(PixelBuffer::from_image(image))
    }
}

impl Default for TileEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

/// Clamp quality to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}
