//! Persistent store for resources and tiles.
//!
//! One SQLite file holds four tables:
//!
//! - `resource`: content identity (blob hash, size, handler) and status
//! - `image`: dimensions of resources that decoded as images
//! - `locator`: canonical locator string to resource id
//! - `tile`: encoded tiles keyed by `(image_id, scale, x, y)`
//!
//! Tile writes go through a [`TileBuffer`] and reach the database in one
//! transaction once the buffer grows past the flush threshold, on an
//! explicit flush, or when the database is closed. Reads merge the buffer
//! and the table.
//!
//! A [`Database`] is owned by the coordinator thread and is not shared.

mod resources;
mod tiles;

pub use resources::CleanupReport;

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::tile::TileBuffer;

/// Buffered tile count that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 256;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS resource (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        blob_hash TEXT NOT NULL,
        blob_size INTEGER NOT NULL,
        handler_type TEXT NOT NULL,
        handler_name TEXT NOT NULL,
        handler_args TEXT NOT NULL,
        status TEXT NOT NULL,
        UNIQUE (blob_hash, blob_size, handler_type, handler_name, handler_args)
    );
    CREATE TABLE IF NOT EXISTS image (
        resource_id INTEGER PRIMARY KEY,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS locator (
        locator TEXT PRIMARY KEY,
        resource_id INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_locator_resource ON locator (resource_id);
    CREATE TABLE IF NOT EXISTS tile (
        image_id INTEGER NOT NULL,
        scale INTEGER NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        data BLOB NOT NULL,
        format INTEGER NOT NULL,
        PRIMARY KEY (image_id, scale, x, y)
    );";

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

/// SQLite connection plus the tile write-back buffer.
pub struct Database {
    conn: Connection,
    buffer: TileBuffer,
    flush_threshold: usize,
    location: DatabaseLocation,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        info!("opened database {}", path.display());
        Self::initialize(conn, DatabaseLocation::File(path.to_path_buf()))
    }

    /// Database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?, DatabaseLocation::Memory)
    }

    pub fn open_location(location: &DatabaseLocation) -> Result<Self, StoreError> {
        match location {
            DatabaseLocation::File(path) => Self::open(path),
            DatabaseLocation::Memory => Self::open_in_memory(),
        }
    }

    fn initialize(mut conn: Connection, location: DatabaseLocation) -> Result<Self, StoreError> {
        let tx = conn.transaction()?;
        tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
        let version: Option<i64> = tx
            .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| {
                row.get(0)
            })
            .optional()?;
        match version {
            None => {
                tx.execute_batch(SCHEMA)?;
                tx.execute(
                    "INSERT INTO store_meta (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(StoreError::Corrupt(format!(
                    "unsupported schema version {}",
                    v
                )))
            }
        }
        tx.commit()?;

        Ok(Self {
            conn,
            buffer: TileBuffer::new(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            location,
        })
    }

    /// Set the buffered tile count that triggers a flush. Zero writes every
    /// tile through immediately.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// Flush buffered tiles and close the connection.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.flush_tiles()?;
        debug!("database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.flush_tiles() {
            error!(
                "failed to flush {} buffered tiles on close: {}",
                self.buffer.len(),
                e
            );
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .field("buffered_tiles", &self.buffer.len())
            .field("flush_threshold", &self.flush_threshold)
            .finish()
    }
}
