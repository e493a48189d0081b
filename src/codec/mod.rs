//! Image codecs.
//!
//! A [`CodecAdapter`] turns encoded bytes into a [`PixelBuffer`]. The
//! [`CodecRegistry`] picks one by explicit name (an `image-<codec>` handler),
//! by file extension, by reported MIME type, or by magic number, in that
//! order.

mod image_codec;
mod pixels;

pub use image_codec::ImageCodec;
pub use pixels::{PixelBuffer, PixelFormat};

use std::path::Path;
use std::sync::Arc;

use crate::error::DecodeError;

/// Handler type naming a codec explicitly, e.g. `//image-png`.
pub const IMAGE_HANDLER_TYPE: &str = "image";

// =============================================================================
// CodecAdapter Trait
// =============================================================================

/// Decoder for one image format.
pub trait CodecAdapter: Send + Sync {
    /// Short name, e.g. `jpeg`.
    fn name(&self) -> &'static str;

    /// Lowercase file extensions, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    fn mime_types(&self) -> &'static [&'static str];

    fn matches_magic(&self, header: &[u8]) -> bool;

    /// Decode the full image.
    fn decode(&self, data: &[u8]) -> Result<PixelBuffer, DecodeError>;

    /// Read the image dimensions without decoding pixel data.
    fn probe_size(&self, data: &[u8]) -> Result<(u32, u32), DecodeError>;
}

// =============================================================================
// CodecRegistry
// =============================================================================

#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn CodecAdapter>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the JPEG and PNG codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ImageCodec::jpeg());
        registry.register(ImageCodec::png());
        registry
    }

    pub fn register(&mut self, codec: impl CodecAdapter + 'static) {
        self.codecs.push(Arc::new(codec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CodecAdapter>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    pub fn find_by_extension(&self, file_name: &str) -> Option<Arc<dyn CodecAdapter>> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
        self.codecs
            .iter()
            .find(|c| c.extensions().contains(&ext.as_str()))
            .cloned()
    }

    pub fn find_by_mime_type(&self, mime: &str) -> Option<Arc<dyn CodecAdapter>> {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        self.codecs
            .iter()
            .find(|c| c.mime_types().iter().any(|m| m.eq_ignore_ascii_case(mime)))
            .cloned()
    }

    pub fn find_by_magic(&self, header: &[u8]) -> Option<Arc<dyn CodecAdapter>> {
        self.codecs
            .iter()
            .find(|c| c.matches_magic(header))
            .cloned()
    }

    /// Pick a codec: extension first, then MIME type, then magic.
    ///
    /// A match by name or MIME type is only trusted when the magic number
    /// agrees or no codec claims the magic number at all.
    pub fn select(
        &self,
        file_name: Option<&str>,
        content_type: Option<&str>,
        header: &[u8],
    ) -> Option<Arc<dyn CodecAdapter>> {
        let by_magic = self.find_by_magic(header);
        let hinted = file_name
            .and_then(|name| self.find_by_extension(name))
            .or_else(|| content_type.and_then(|mime| self.find_by_mime_type(mime)));
        match hinted {
            Some(codec) if by_magic.is_none() || codec.matches_magic(header) => Some(codec),
            _ => by_magic,
        }
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| c.name()))
            .finish()
    }
}
