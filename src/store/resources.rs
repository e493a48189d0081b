use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use super::Database;
use crate::blob::BlobInfo;
use crate::error::StoreError;
use crate::locator::{Handler, Locator};
use crate::resource::{ImageInfo, ResourceInfo, ResourceMetadata, ResourceName, ResourceStatus, RowId};

const RESOURCE_COLUMNS: &str =
    "r.id, r.blob_hash, r.blob_size, r.handler_type, r.handler_name, r.handler_args, r.status";

/// Rows removed by [`Database::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub orphan_locators: usize,
    pub orphan_images: usize,
    pub orphan_tiles: usize,
}

type RawResource = (i64, String, i64, String, String, String, String);

fn raw_resource(row: &Row<'_>) -> rusqlite::Result<RawResource> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn resource_info(raw: RawResource) -> Result<ResourceInfo, StoreError> {
    let (id, hash, size, kind, name, args, status) = raw;
    let blob = BlobInfo::from_hex(&hash, size as u64)
        .ok_or_else(|| StoreError::Corrupt(format!("bad blob hash '{}'", hash)))?;
    Ok(ResourceInfo {
        id: RowId::new(id),
        name: ResourceName::new(blob, Handler::new(kind, name, args)),
        status: status.parse()?,
    })
}

impl Database {
    pub fn find_resource_by_name(
        &self,
        name: &ResourceName,
    ) -> Result<Option<ResourceInfo>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM resource r
                     WHERE r.blob_hash = ?1 AND r.blob_size = ?2
                       AND r.handler_type = ?3 AND r.handler_name = ?4 AND r.handler_args = ?5",
                    RESOURCE_COLUMNS
                ),
                params![
                    name.blob.hash_hex(),
                    name.blob.size() as i64,
                    name.handler.kind(),
                    name.handler.name(),
                    name.handler.args(),
                ],
                raw_resource,
            )
            .optional()?;
        raw.map(resource_info).transpose()
    }

    pub fn get_resource(&self, id: RowId) -> Result<Option<ResourceInfo>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM resource r WHERE r.id = ?1", RESOURCE_COLUMNS),
                params![id.get()?],
                raw_resource,
            )
            .optional()?;
        raw.map(resource_info).transpose()
    }

    /// Insert a resource, or update the status of the existing row with
    /// the same name.
    pub fn store_resource(
        &mut self,
        name: &ResourceName,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, StoreError> {
        if let Some(existing) = self.find_resource_by_name(name)? {
            if existing.status != status {
                self.update_status(existing.id, status)?;
            }
            return Ok(ResourceInfo { status, ..existing });
        }

        self.conn.execute(
            "INSERT INTO resource (blob_hash, blob_size, handler_type, handler_name, handler_args, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name.blob.hash_hex(),
                name.blob.size() as i64,
                name.handler.kind(),
                name.handler.name(),
                name.handler.args(),
                status.as_str(),
            ],
        )?;
        Ok(ResourceInfo {
            id: RowId::new(self.conn.last_insert_rowid()),
            name: name.clone(),
            status,
        })
    }

    pub fn update_status(&mut self, id: RowId, status: ResourceStatus) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE resource SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.get()?],
        )?;
        Ok(())
    }

    pub fn store_image_info(&mut self, id: RowId, image: &ImageInfo) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO image (resource_id, width, height) VALUES (?1, ?2, ?3)",
            params![id.get()?, image.width, image.height],
        )?;
        Ok(())
    }

    pub fn get_image_info(&self, id: RowId) -> Result<Option<ImageInfo>, StoreError> {
        let image = self
            .conn
            .query_row(
                "SELECT width, height FROM image WHERE resource_id = ?1",
                params![id.get()?],
                |row| Ok(ImageInfo::new(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(image)
    }

    /// Point `locator` at resource `id`, replacing any earlier mapping.
    pub fn store_locator(&mut self, locator: &Locator, id: RowId) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO locator (locator, resource_id) VALUES (?1, ?2)",
            params![locator.to_string(), id.get()?],
        )?;
        Ok(())
    }

    pub fn find_resource_by_locator(
        &self,
        locator: &Locator,
    ) -> Result<Option<ResourceInfo>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM locator l JOIN resource r ON r.id = l.resource_id
                     WHERE l.locator = ?1",
                    RESOURCE_COLUMNS
                ),
                params![locator.to_string()],
                raw_resource,
            )
            .optional()?;
        raw.map(resource_info).transpose()
    }

    /// Full metadata for a locator already in the store.
    pub fn get_metadata(&self, locator: &Locator) -> Result<Option<ResourceMetadata>, StoreError> {
        let Some(info) = self.find_resource_by_locator(locator)? else {
            return Ok(None);
        };
        let image = self.get_image_info(info.id)?;
        Ok(Some(ResourceMetadata {
            info,
            locator: locator.clone(),
            image,
        }))
    }

    /// Every stored locator with its resource, optionally filtered by a glob
    /// over the canonical locator string. Ordered by locator.
    pub fn list_resources(
        &self,
        pattern: Option<&glob::Pattern>,
    ) -> Result<Vec<ResourceMetadata>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT l.locator, {}, i.width, i.height
             FROM locator l
             JOIN resource r ON r.id = l.resource_id
             LEFT JOIN image i ON i.resource_id = r.id
             ORDER BY l.locator",
            RESOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![], |row| {
            let locator: String = row.get(0)?;
            let raw: RawResource = (
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            );
            let size: Option<(u32, u32)> = match (row.get(8)?, row.get(9)?) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            };
            Ok((locator, raw, size))
        })?;

        let mut resources = Vec::new();
        for row in rows {
            let (text, raw, size) = row?;
            if pattern.is_some_and(|p| !p.matches(&text)) {
                continue;
            }
            let locator = match Locator::parse(&text) {
                Ok(locator) => locator,
                Err(e) => {
                    warn!("skipping unparsable stored locator '{}': {}", text, e);
                    continue;
                }
            };
            resources.push(ResourceMetadata {
                info: resource_info(raw)?,
                locator,
                image: size.map(|(w, h)| ImageInfo::new(w, h)),
            });
        }
        Ok(resources)
    }

    /// Remove a resource with its image row, locators and tiles in one
    /// transaction. Returns false if no such resource existed.
    pub fn delete_resource(&mut self, id: RowId) -> Result<bool, StoreError> {
        let raw = id.get()?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tile WHERE image_id = ?1", params![raw])?;
        tx.execute("DELETE FROM image WHERE resource_id = ?1", params![raw])?;
        tx.execute("DELETE FROM locator WHERE resource_id = ?1", params![raw])?;
        let removed = tx.execute("DELETE FROM resource WHERE id = ?1", params![raw])?;
        tx.commit()?;
        self.buffer.remove_image(id);
        Ok(removed > 0)
    }

    /// Flush, drop rows that no longer belong to a resource, and compact the
    /// file.
    pub fn cleanup(&mut self) -> Result<CleanupReport, StoreError> {
        self.flush_tiles()?;

        let tx = self.conn.transaction()?;
        let orphan_locators = tx.execute(
            "DELETE FROM locator WHERE resource_id NOT IN (SELECT id FROM resource)",
            params![],
        )?;
        let orphan_images = tx.execute(
            "DELETE FROM image WHERE resource_id NOT IN (SELECT id FROM resource)",
            params![],
        )?;
        let orphan_tiles = tx.execute(
            "DELETE FROM tile WHERE image_id NOT IN (SELECT resource_id FROM image)",
            params![],
        )?;
        tx.commit()?;

        self.conn.execute_batch("VACUUM;")?;
        let report = CleanupReport {
            orphan_locators,
            orphan_images,
            orphan_tiles,
        };
        info!(?report, "database cleanup finished");
        Ok(report)
    }
}
