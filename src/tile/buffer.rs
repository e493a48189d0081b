//! Write-back buffer for freshly generated tiles.
//!
//! New tiles land here first and reach the database in batches. Readers
//! consult the buffer before the database, so a buffered tile is visible
//! immediately. The buffer is owned by the coordinator thread and needs no
//! locking.

use std::collections::HashMap;

use crate::pyramid::ScaleRange;
use crate::resource::RowId;

use super::{TileEntry, TileKey};

/// Pending tiles keyed by address. A later tile for the same key replaces
/// the earlier one.
#[derive(Debug, Default)]
pub struct TileBuffer {
    tiles: HashMap<TileKey, TileEntry>,
}

impl TileBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a tile, returning the one it replaced.
    pub fn insert(&mut self, tile: TileEntry) -> Option<TileEntry> {
        self.tiles.insert(tile.key(), tile)
    }

    pub fn get(&self, key: &TileKey) -> Option<&TileEntry> {
        self.tiles.get(key)
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.tiles.contains_key(key)
    }

    /// Range of scales buffered for `image_id`.
    pub fn scale_range(&self, image_id: RowId) -> Option<ScaleRange> {
        self.tiles
            .keys()
            .filter(|key| key.image_id == image_id)
            .map(|key| key.scale)
            .fold(None, |range: Option<ScaleRange>, scale| {
                Some(match range {
                    Some(r) => r.including(scale),
                    None => ScaleRange::single(scale),
                })
            })
    }

    /// Buffered tiles of one image, unordered.
    pub fn tiles_for(&self, image_id: RowId) -> impl Iterator<Item = &TileEntry> {
        self.tiles.values().filter(move |t| t.image_id == image_id)
    }

    /// Drop every buffered tile of `image_id`.
    pub fn remove_image(&mut self, image_id: RowId) -> usize {
        let before = self.tiles.len();
        self.tiles.retain(|key, _| key.image_id != image_id);
        before - self.tiles.len()
    }

    /// All buffered tiles in key order, leaving the buffer intact.
    ///
    /// The buffer is only cleared once the caller's write has committed.
    pub fn snapshot(&self) -> Vec<&TileEntry> {
        let mut tiles: Vec<_> = self.tiles.values().collect();
        tiles.sort_by_key(|t| t.key());
        tiles
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
