//! # Pyramid Cache
//!
//! Resolves resource locators to images and keeps their tile pyramids in a
//! persistent, content-addressed cache.
//!
//! A locator names a file, a remote URL or an entry inside (possibly
//! nested) archives. The first request for a locator fetches and probes the
//! bytes; tile requests decode the image once and cut it into a pyramid of
//! fixed-size tiles, which are stored so later requests never decode again.
//!
//! ## Features
//!
//! - **Chained locators**: `file:///scans.tar//archive-tar:a.zip//archive-zip:page1.png`
//! - **Content addressing**: resources are keyed by SHA-1 and size, so two
//!   locators with the same bytes share one set of tiles
//! - **Incremental pyramids**: thumbnails first, finer scales on demand
//! - **Single writer**: one coordinator thread owns the SQLite database and
//!   deduplicates concurrent work per locator
//! - **Write-back tile buffer**: tiles reach the database in batches
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`locator`] - Locator parsing and serialization
//! - [`blob`] - Byte handles and the content addresser
//! - [`io`] - Network transport and worker pool
//! - [`archive`] - Archive adapters (zip, tar)
//! - [`codec`] - Image codec adapters and pixel buffers
//! - [`resolver`] - Locator to bytes
//! - [`pyramid`] - Tile pyramid generation
//! - [`tile`] - Tile addressing, encoding and the write-back buffer
//! - [`store`] - SQLite persistence
//! - [`job`] - Cancelable job handles
//! - [`coordinator`] - The single-writer coordinator thread
//! - [`manager`] - [`ResourceManager`], the entry point
//! - [`config`] - CLI configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use pyramid_cache::{ManagerConfig, ResourceManager, ScaleRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pyramid_cache::ResourceError> {
//!     let manager = ResourceManager::open(ManagerConfig::default())?;
//!
//!     let metadata = manager.request_metadata_str("/data/large.png").await?;
//!     let image = metadata.image.expect("an image");
//!     let coarsest = image.max_scale(manager.tile_size());
//!
//!     // Thumbnail only
//!     manager
//!         .request_tiles(&metadata, ScaleRange::single(coarsest))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod blob;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod io;
pub mod job;
pub mod locator;
pub mod manager;
pub mod pyramid;
pub mod resolver;
pub mod resource;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use blob::{Blob, BlobInfo};
pub use config::{Cli, Command};
pub use coordinator::{Pending, StatsSnapshot};
pub use error::{DecodeError, IoError, LocatorError, ResourceError, StoreError};
pub use io::{HttpResponse, NetworkTransport, TransferCallback};
pub use job::{JobHandle, JobState};
pub use locator::{Handler, Locator, ResourceUrl};
pub use manager::{ManagerConfig, ResourceManager};
pub use pyramid::{PyramidGenerator, ScaleRange};
pub use resource::{ImageInfo, ResourceInfo, ResourceMetadata, ResourceName, ResourceStatus, RowId};
pub use store::{CleanupReport, Database, DatabaseLocation};
pub use tile::{TileEntry, TileFormat, TilePos};
