//! Tiles: addressing, payload encoding and the write-back buffer.
//!
//! A tile is identified by `(image_id, scale, x, y)`. Scale 0 is full
//! resolution; each higher scale halves both dimensions. Tiles are stored
//! encoded, as JPEG for opaque pixels and PNG when there is an alpha
//! channel.
//!
//! # Components
//!
//! - [`TileEntry`]: An encoded tile as stored and delivered
//! - [`TileEncoder`]: Pixel buffer to payload and back
//! - [`TileBuffer`]: In-memory write-back buffer in front of the store

mod buffer;
mod encoder;

pub use buffer::TileBuffer;
pub use encoder::{
    clamp_quality, is_valid_quality, TileEncoder, DEFAULT_JPEG_QUALITY, MAX_JPEG_QUALITY,
    MIN_JPEG_QUALITY,
};

use bytes::Bytes;
use serde::Serialize;

use crate::codec::PixelBuffer;
use crate::error::{DecodeError, StoreError};
use crate::resource::RowId;

/// Default edge length of a tile in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Tile column and row at some scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TilePos {
    pub x: u32,
    pub y: u32,
}

impl TilePos {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Unique address of a stored tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub image_id: RowId,
    pub scale: u32,
    pub pos: TilePos,
}

impl TileKey {
    pub fn new(image_id: RowId, scale: u32, pos: TilePos) -> Self {
        Self {
            image_id,
            scale,
            pos,
        }
    }
}

/// Encoding of a tile payload. The discriminant is the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Jpeg = 0,
    Png = 1,
}

impl TileFormat {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(TileFormat::Jpeg),
            1 => Ok(TileFormat::Png),
            other => Err(StoreError::Corrupt(format!("unknown tile format {}", other))),
        }
    }
}

/// An encoded tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEntry {
    pub image_id: RowId,
    pub scale: u32,
    pub pos: TilePos,
    pub format: TileFormat,
    pub data: Bytes,
}

impl TileEntry {
    pub fn key(&self) -> TileKey {
        TileKey::new(self.image_id, self.scale, self.pos)
    }

    /// Decode the payload back into pixels.
    pub fn decode(&self) -> Result<PixelBuffer, DecodeError> {
        TileEncoder::decode(self.format, &self.data)
    }
}
