//! Tile pyramid generation.
//!
//! Scale 0 is the decoded image. Each following scale is the previous one
//! halved with a 2x2 box filter, until the whole image fits in a single
//! tile. Every scale is cut into `tile_size` squares starting at the
//! top-left corner; tiles on the right and bottom edges are clipped to the
//! image instead of padded.
//!
//! ```text
//! 1000x1000, tile size 256
//!
//! scale 0  1000x1000  4x4 tiles, edge tiles 232 px
//! scale 1   500x500   2x2 tiles, edge tiles 244 px
//! scale 2   250x250   1 tile
//! ```

use serde::Serialize;

use crate::codec::PixelBuffer;
use crate::tile::{TilePos, DEFAULT_TILE_SIZE};

/// Size of a dimension after `scale` halvings. Never below one pixel.
pub fn scaled_dimension(size: u32, scale: u32) -> u32 {
    (0..scale).fold(size, |s, _| (s / 2).max(1))
}

/// Coarsest scale of an image: the number of halvings until both dimensions
/// fit in one tile.
pub fn calc_max_scale(width: u32, height: u32, tile_size: u32) -> u32 {
    let tile_size = tile_size.max(1);
    let (mut w, mut h) = (width, height);
    let mut scale = 0;
    while w > tile_size || h > tile_size {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        scale += 1;
    }
    scale
}

// =============================================================================
// ScaleRange
// =============================================================================

/// Inclusive range of scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScaleRange {
    pub min: u32,
    pub max: u32,
}

impl ScaleRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn single(scale: u32) -> Self {
        Self::new(scale, scale)
    }

    pub fn contains(&self, scale: u32) -> bool {
        (self.min..=self.max).contains(&scale)
    }

    pub fn covers(&self, other: &ScaleRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Smallest range containing both `self` and `scale`.
    pub fn including(&self, scale: u32) -> Self {
        Self::new(self.min.min(scale), self.max.max(scale))
    }

    /// Smallest range containing both ranges.
    pub fn union(&self, other: &ScaleRange) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }
}

// =============================================================================
// Generator
// =============================================================================

/// A raw tile produced by the generator, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub scale: u32,
    pub pos: TilePos,
    pub pixels: PixelBuffer,
}

/// Whether generation ran to the end or stopped on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { tiles: usize },
    Aborted { tiles: usize },
}

/// Cuts a decoded image into its tile pyramid.
#[derive(Debug, Clone, Copy)]
pub struct PyramidGenerator {
    tile_size: u32,
}

impl PyramidGenerator {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size.max(1),
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Every scale of an image of the given size.
    pub fn scale_range(&self, width: u32, height: u32) -> ScaleRange {
        ScaleRange::new(0, calc_max_scale(width, height, self.tile_size))
    }

    /// Split one scale's image into tiles, row by row.
    pub fn tiles_for_scale(&self, image: &PixelBuffer, scale: u32) -> Vec<Tile> {
        let ts = self.tile_size;
        let cols = image.width().div_ceil(ts);
        let rows = image.height().div_ceil(ts);
        let mut tiles = Vec::with_capacity((cols * rows) as usize);
        for y in 0..rows {
            for x in 0..cols {
                tiles.push(Tile {
                    scale,
                    pos: TilePos::new(x, y),
                    pixels: image.crop(x * ts, y * ts, ts, ts),
                });
            }
        }
        tiles
    }

    /// Generate the tiles of `range`, finest scale first.
    ///
    /// `range` is clamped to the image's own scales. `is_aborted` is polled
    /// before each tile; once it returns true no further tile is emitted.
    pub fn generate_range<A, E>(
        &self,
        image: &PixelBuffer,
        range: ScaleRange,
        is_aborted: A,
        mut emit: E,
    ) -> GenerationOutcome
    where
        A: Fn() -> bool,
        E: FnMut(Tile),
    {
        let max_scale = calc_max_scale(image.width(), image.height(), self.tile_size);
        let last = range.max.min(max_scale);
        let mut count = 0;

        if range.min > last {
            return GenerationOutcome::Completed { tiles: 0 };
        }

        let mut current = None::<PixelBuffer>;
        for _ in 0..range.min {
            if is_aborted() {
                return GenerationOutcome::Aborted { tiles: 0 };
            }
            current = Some(current.as_ref().unwrap_or(image).halve());
        }

        for scale in range.min..=last {
            if scale > range.min {
                current = Some(current.as_ref().unwrap_or(image).halve());
            }
            let level = current.as_ref().unwrap_or(image);
            for tile in self.tiles_for_scale(level, scale) {
                if is_aborted() {
                    return GenerationOutcome::Aborted { tiles: count };
                }
                emit(tile);
                count += 1;
            }
        }

        GenerationOutcome::Completed { tiles: count }
    }

    /// Generate the whole pyramid.
    pub fn generate(&self, image: &PixelBuffer) -> Vec<Tile> {
        let mut tiles = Vec::new();
        self.generate_range(
            image,
            self.scale_range(image.width(), image.height()),
            || false,
            |tile| tiles.push(tile),
        );
        tiles
    }

    /// Reassemble one scale from its tiles.
    pub fn assemble<'a>(
        &self,
        width: u32,
        height: u32,
        tiles: impl IntoIterator<Item = (TilePos, &'a PixelBuffer)>,
    ) -> Option<PixelBuffer> {
        let mut out: Option<PixelBuffer> = None;
        for (pos, pixels) in tiles {
            let target =
                out.get_or_insert_with(|| PixelBuffer::new(width, height, pixels.format()));
            target.blit(pixels, pos.x * self.tile_size, pos.y * self.tile_size);
        }
        out
    }
}

impl Default for PyramidGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_SIZE)
    }
}
