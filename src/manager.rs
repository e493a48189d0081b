//! Resource manager: the application context.
//!
//! [`ResourceManager`] wires the worker pool, network transport, blob
//! resolver, pyramid generator and coordinator together. Every request
//! returns a [`Pending`] right away; nothing on the calling thread waits
//! for I/O, decoding or the database.
//!
//! # Example
//!
//! ```rust,no_run
//! use pyramid_cache::{ManagerConfig, ResourceManager, TilePos};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pyramid_cache::ResourceError> {
//!     let manager = ResourceManager::open(ManagerConfig::default())?;
//!     let metadata = manager
//!         .request_metadata_str("file:///data/scan.zip//archive-zip:page1.png")
//!         .await?;
//!     let tile = manager.request_tile(&metadata, 0, TilePos::new(0, 0)).await?;
//!     println!("{} bytes", tile.data.len());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::archive::ArchiveRegistry;
use crate::codec::{CodecRegistry, PixelBuffer};
use crate::coordinator::{
    Coordinator, CoordinatorState, CoordinatorStats, Pending, Responder, Services, StatsSnapshot,
    DEFAULT_RECEIVE_CAPACITY, DEFAULT_REQUEST_CAPACITY,
};
use crate::error::ResourceError;
use crate::io::{HttpTransport, NetworkTransport, WorkerRuntime};
use crate::locator::Locator;
use crate::pyramid::{calc_max_scale, PyramidGenerator, ScaleRange};
use crate::resolver::{BlobResolver, DEFAULT_REMOTE_CACHE_CAPACITY};
use crate::resource::{ResourceMetadata, RowId};
use crate::store::{CleanupReport, Database, DatabaseLocation, DEFAULT_FLUSH_THRESHOLD};
use crate::tile::{TileEncoder, TileEntry, TilePos, DEFAULT_JPEG_QUALITY, DEFAULT_TILE_SIZE};

/// Default worker pool size.
pub const DEFAULT_THREADS: usize = 4;

/// Default timeout for one HTTP transfer.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Settings for [`ResourceManager::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub database: DatabaseLocation,
    /// Worker pool size
    pub threads: usize,
    pub tile_size: u32,
    /// Buffered tiles that trigger a flush
    pub flush_threshold: usize,
    pub request_capacity: usize,
    pub receive_capacity: usize,
    pub jpeg_quality: u8,
    /// Downloaded blobs kept in memory
    pub remote_cache_capacity: usize,
    pub http_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            threads: DEFAULT_THREADS,
            tile_size: DEFAULT_TILE_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            remote_cache_capacity: DEFAULT_REMOTE_CACHE_CAPACITY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

// =============================================================================
// ResourceManager
// =============================================================================

/// Asynchronous front end for metadata and tile requests.
///
/// Dropping the manager stops the coordinator, which fails outstanding
/// requests with [`ResourceError::Shutdown`] and flushes buffered tiles.
pub struct ResourceManager {
    // Field order is drop order: the coordinator must stop before the pool
    // it schedules work on goes away.
    coordinator: Coordinator,
    services: Arc<Services>,
    _runtime: WorkerRuntime,
}

impl ResourceManager {
    /// Open the database and start the pool, the HTTP transport and the
    /// coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or a thread cannot
    /// be started.
    pub fn open(config: ManagerConfig) -> Result<Self, ResourceError> {
        let transport = HttpTransport::with_reqwest(config.http_timeout)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Like [`open`](Self::open) with a caller-supplied network transport.
    pub fn with_transport(
        config: ManagerConfig,
        transport: Arc<dyn NetworkTransport>,
    ) -> Result<Self, ResourceError> {
        let db = Database::open_location(&config.database)?
            .with_flush_threshold(config.flush_threshold);
        let runtime = WorkerRuntime::new(config.threads)?;
        let pool = runtime.pool();

        let resolver = BlobResolver::with_cache_capacity(
            pool,
            transport,
            ArchiveRegistry::with_defaults(),
            config.remote_cache_capacity,
        );
        let services = Arc::new(Services {
            resolver,
            codecs: CodecRegistry::with_defaults(),
            generator: PyramidGenerator::new(config.tile_size),
            encoder: TileEncoder::new(config.jpeg_quality),
            stats: CoordinatorStats::default(),
        });

        let coordinator = Coordinator::start(
            db,
            Arc::clone(&services),
            config.request_capacity,
            config.receive_capacity,
        )?;

        info!(
            database = ?config.database,
            threads = config.threads,
            tile_size = config.tile_size,
            "resource manager ready"
        );
        Ok(Self {
            coordinator,
            services,
            _runtime: runtime,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.services.generator.tile_size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.coordinator.stats()
    }

    /// Queue `task` on the coordinator with a fresh responder.
    fn submit<T, F>(&self, task: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CoordinatorState, Responder<T>) + Send + 'static,
    {
        let (responder, pending) = Pending::channel();
        if let Err(e) = self
            .coordinator
            .mailbox()
            .request(move |state| {
                responder.start();
                task(state, responder)
            })
        {
            debug!("request rejected: {}", e);
        }
        pending
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Metadata for `locator`, resolving and probing the blob on a miss.
    pub fn request_resource_metadata(&self, locator: Locator) -> Pending<ResourceMetadata> {
        self.submit(move |state, responder| state.request_resource_metadata(locator, responder))
    }

    /// Parse `locator` and request its metadata.
    pub fn request_metadata_str(&self, locator: &str) -> Pending<ResourceMetadata> {
        match Locator::parse(locator) {
            Ok(locator) => self.request_resource_metadata(locator),
            Err(e) => Pending::ready(Err(e.into())),
        }
    }

    /// Child locators for every entry of the archive behind `locator`.
    ///
    /// Does not touch the database.
    pub fn request_archive_entries(&self, locator: &Locator) -> Pending<Vec<Locator>> {
        let (responder, pending) = Pending::channel();
        responder.start();
        self.services
            .resolver
            .resolve_entries(locator, move |result| responder.send(result));
        pending
    }

    // =========================================================================
    // Tiles
    // =========================================================================

    /// One tile, generated on demand.
    pub fn request_tile(
        &self,
        metadata: &ResourceMetadata,
        scale: u32,
        pos: TilePos,
    ) -> Pending<TileEntry> {
        let metadata = metadata.clone();
        self.submit(move |state, responder| state.request_tile(metadata, scale, pos, responder))
    }

    /// The single tile of the coarsest scale.
    pub fn request_thumbnail(&self, metadata: &ResourceMetadata) -> Pending<TileEntry> {
        let scale = metadata
            .image
            .map(|image| image.max_scale(self.tile_size()))
            .unwrap_or(0);
        self.request_tile(metadata, scale, TilePos::new(0, 0))
    }

    /// Generate every missing tile of `range`. Resolves to the number of
    /// tiles generated.
    pub fn request_tiles(&self, metadata: &ResourceMetadata, range: ScaleRange) -> Pending<usize> {
        let metadata = metadata.clone();
        self.submit(move |state, responder| state.request_tiles(metadata, range, responder))
    }

    /// Rebuild the whole image at the coarsest scale that fits in a
    /// `size`x`size` box, from stored tiles.
    pub async fn assemble(
        &self,
        metadata: &ResourceMetadata,
        size: u32,
    ) -> Result<PixelBuffer, ResourceError> {
        let not_found = |scale| ResourceError::TileNotFound {
            image_id: metadata.id().raw(),
            scale,
            x: 0,
            y: 0,
        };
        let image = metadata.image.ok_or_else(|| not_found(0))?;
        let tile_size = self.tile_size();
        let scale = calc_max_scale(image.width, image.height, size.max(1));

        self.request_tiles(metadata, ScaleRange::single(scale)).await?;

        let (cols, rows) = image.tile_grid(scale, tile_size);
        let mut tiles = Vec::with_capacity((cols * rows) as usize);
        for y in 0..rows {
            for x in 0..cols {
                let pos = TilePos::new(x, y);
                let entry = self.request_tile(metadata, scale, pos).await?;
                tiles.push((pos, entry.decode()?));
            }
        }

        let (width, height) = image.scaled_size(scale);
        self.services
            .generator
            .assemble(width, height, tiles.iter().map(|(pos, pixels)| (*pos, pixels)))
            .ok_or_else(|| not_found(scale))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete a resource, its locators and its tiles.
    pub fn delete_resource(&self, id: RowId) -> Pending<bool> {
        self.submit(move |state, responder| state.delete_resource(id, responder))
    }

    /// Stored resources whose locator matches the glob `pattern`.
    pub fn list_resources(&self, pattern: Option<&str>) -> Pending<Vec<ResourceMetadata>> {
        let pattern = match pattern.map(glob::Pattern::new).transpose() {
            Ok(pattern) => pattern,
            Err(e) => {
                return Pending::ready(Err(ResourceError::InvalidPattern {
                    pattern: pattern.unwrap_or_default().to_string(),
                    message: e.to_string(),
                }))
            }
        };
        self.submit(move |state, responder| state.list_resources(pattern, responder))
    }

    /// Write buffered tiles to disk. Resolves to the number written.
    pub fn flush(&self) -> Pending<usize> {
        self.submit(|state, responder| state.flush(responder))
    }

    /// Remove orphaned rows and compact the database.
    pub fn cleanup(&self) -> Pending<CleanupReport> {
        self.submit(|state, responder| state.cleanup(responder))
    }

    /// Stop the coordinator. Outstanding and later requests fail with
    /// [`ResourceError::Shutdown`].
    pub fn shutdown(&self) {
        self.coordinator.stop();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.coordinator.stop();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("tile_size", &self.tile_size())
            .field("stats", &self.stats())
            .finish()
    }
}
