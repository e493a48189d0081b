use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use super::{CodecAdapter, PixelBuffer};
use crate::error::DecodeError;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Codec backed by the `image` crate for a single format.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    name: &'static str,
    format: ImageFormat,
    extensions: &'static [&'static str],
    mime_types: &'static [&'static str],
    magic: &'static [u8],
}

impl ImageCodec {
    pub fn jpeg() -> Self {
        Self {
            name: "jpeg",
            format: ImageFormat::Jpeg,
            extensions: &["jpg", "jpeg", "jpe"],
            mime_types: &["image/jpeg", "image/jpg"],
            magic: JPEG_MAGIC,
        }
    }

    pub fn png() -> Self {
        Self {
            name: "png",
            format: ImageFormat::Png,
            extensions: &["png"],
            mime_types: &["image/png"],
            magic: PNG_MAGIC,
        }
    }

    fn error(&self, err: impl std::fmt::Display) -> DecodeError {
        DecodeError::Codec {
            codec: self.name.to_string(),
            message: err.to_string(),
        }
    }
}

impl CodecAdapter for ImageCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn extensions(&self) -> &'static [&'static str] {
        self.extensions
    }

    fn mime_types(&self) -> &'static [&'static str] {
        self.mime_types
    }

    fn matches_magic(&self, header: &[u8]) -> bool {
        header.starts_with(self.magic)
    }

    fn decode(&self, data: &[u8]) -> Result<PixelBuffer, DecodeError> {
        let image = ImageReader::with_format(Cursor::new(data), self.format)
            .decode()
            .map_err(|e| self.error(e))?;
        Ok(PixelBuffer::from_image(image))
    }

    fn probe_size(&self, data: &[u8]) -> Result<(u32, u32), DecodeError> {
        ImageReader::with_format(Cursor::new(data), self.format)
            .into_dimensions()
            .map_err(|e| self.error(e))
    }
}
