use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::error::StoreError;
use crate::pyramid::ScaleRange;
use crate::resource::RowId;
use crate::tile::{TileEntry, TileFormat, TileKey, TilePos};

impl Database {
    /// Look up one tile, buffered tiles first.
    pub fn get_tile(
        &self,
        image_id: RowId,
        scale: u32,
        pos: TilePos,
    ) -> Result<Option<TileEntry>, StoreError> {
        let id = image_id.get()?;
        if let Some(tile) = self.buffer.get(&TileKey::new(image_id, scale, pos)) {
            return Ok(Some(tile.clone()));
        }

        let row = self
            .conn
            .query_row(
                "SELECT data, format FROM tile WHERE image_id = ?1 AND scale = ?2 AND x = ?3 AND y = ?4",
                params![id, scale, pos.x, pos.y],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        row.map(|(data, format)| -> Result<TileEntry, StoreError> {
            Ok(TileEntry {
                image_id,
                scale,
                pos,
                format: TileFormat::from_i64(format)?,
                data: Bytes::from(data),
            })
        })
        .transpose()
    }

    pub fn has_tile(&self, image_id: RowId, scale: u32, pos: TilePos) -> Result<bool, StoreError> {
        let id = image_id.get()?;
        if self.buffer.contains(&TileKey::new(image_id, scale, pos)) {
            return Ok(true);
        }
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM tile WHERE image_id = ?1 AND scale = ?2 AND x = ?3 AND y = ?4",
                params![id, scale, pos.x, pos.y],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Range of scales stored for `image_id`, across buffer and table.
    pub fn get_min_max_scale(&self, image_id: RowId) -> Result<Option<ScaleRange>, StoreError> {
        let id = image_id.get()?;
        let (min, max): (Option<u32>, Option<u32>) = self.conn.query_row(
            "SELECT MIN(scale), MAX(scale) FROM tile WHERE image_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let stored = min.zip(max).map(|(min, max)| ScaleRange::new(min, max));
        let buffered = self.buffer.scale_range(image_id);
        Ok(match (stored, buffered) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        })
    }

    /// Every tile of `image_id` at `scale`, buffered tiles overriding stored
    /// ones, ordered by position.
    pub fn get_tiles(&self, image_id: RowId, scale: u32) -> Result<Vec<TileEntry>, StoreError> {
        let id = image_id.get()?;
        let mut stmt = self.conn.prepare(
            "SELECT x, y, data, format FROM tile WHERE image_id = ?1 AND scale = ?2",
        )?;
        let rows = stmt.query_map(params![id, scale], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut tiles = BTreeMap::new();
        for row in rows {
            let (x, y, data, format) = row?;
            let pos = TilePos::new(x, y);
            tiles.insert(
                pos,
                TileEntry {
                    image_id,
                    scale,
                    pos,
                    format: TileFormat::from_i64(format)?,
                    data: Bytes::from(data),
                },
            );
        }
        for tile in self.buffer.tiles_for(image_id).filter(|t| t.scale == scale) {
            tiles.insert(tile.pos, tile.clone());
        }
        Ok(tiles.into_values().collect())
    }

    /// Buffer a tile, flushing once the buffer exceeds the threshold.
    pub fn store_tile(&mut self, tile: TileEntry) -> Result<(), StoreError> {
        tile.image_id.get()?;
        self.buffer.insert(tile);
        if self.buffer.len() > self.flush_threshold {
            self.flush_tiles()?;
        }
        Ok(())
    }

    /// Write every buffered tile in a single transaction.
    ///
    /// The buffer is only cleared after the commit succeeds, so a failed
    /// flush loses nothing.
    pub fn flush_tiles(&mut self) -> Result<usize, StoreError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tile (image_id, scale, x, y, data, format)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for tile in self.buffer.snapshot() {
                stmt.execute(params![
                    tile.image_id.raw(),
                    tile.scale,
                    tile.pos.x,
                    tile.pos.y,
                    &tile.data[..],
                    tile.format.as_i64(),
                ])?;
            }
        }
        tx.commit()?;

        let count = self.buffer.len();
        self.buffer.clear();
        debug!(count, "flushed tiles");
        Ok(count)
    }

    /// Positions of the tiles stored for `image_id` at `scale`, without
    /// loading their payloads.
    pub fn tile_positions(&self, image_id: RowId, scale: u32) -> Result<BTreeSet<TilePos>, StoreError> {
        let id = image_id.get()?;
        let mut stmt = self
            .conn
            .prepare("SELECT x, y FROM tile WHERE image_id = ?1 AND scale = ?2")?;
        let rows = stmt.query_map(params![id, scale], |row| {
            Ok(TilePos::new(row.get(0)?, row.get(1)?))
        })?;

        let mut positions = BTreeSet::new();
        for pos in rows {
            positions.insert(pos?);
        }
        positions.extend(
            self.buffer
                .tiles_for(image_id)
                .filter(|t| t.scale == scale)
                .map(|t| t.pos),
        );
        Ok(positions)
    }

    /// Remove every tile of `image_id` from buffer and table.
    pub fn delete_tiles(&mut self, image_id: RowId) -> Result<usize, StoreError> {
        let id = image_id.get()?;
        let buffered = self.buffer.remove_image(image_id);
        let stored = self
            .conn
            .execute("DELETE FROM tile WHERE image_id = ?1", params![id])?;
        Ok(buffered + stored)
    }

    /// Tiles waiting in the write-back buffer.
    pub fn pending_tiles(&self) -> usize {
        self.buffer.len()
    }
}
