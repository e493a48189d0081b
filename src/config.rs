//! Command-line configuration for the `pyramid-cache` binary.
//!
//! Global options apply to every subcommand and can also be set through
//! environment variables with the `PYRAMID_` prefix:
//!
//! - `PYRAMID_DATABASE` - Database file (default: `~/.cache/pyramid-cache/cache.sqlite3`)
//! - `PYRAMID_THREADS` - Worker pool size (default: 4)
//! - `PYRAMID_TILE_SIZE` - Tile edge length in pixels (default: 256)
//! - `PYRAMID_FLUSH_THRESHOLD` - Buffered tiles before a flush (default: 256)
//! - `PYRAMID_QUEUE_CAPACITY` - Coordinator request queue capacity (default: 256)
//! - `PYRAMID_JPEG_QUALITY` - JPEG quality of stored tiles (default: 85)
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use pyramid_cache::config::Cli;
//!
//! let cli = Cli::parse();
//! cli.validate()?;
//! let manager = ResourceManager::open(cli.manager_config())?;
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::coordinator::{DEFAULT_RECEIVE_CAPACITY, DEFAULT_REQUEST_CAPACITY};
use crate::manager::{ManagerConfig, DEFAULT_HTTP_TIMEOUT, DEFAULT_THREADS};
use crate::resolver::DEFAULT_REMOTE_CACHE_CAPACITY;
use crate::store::{DatabaseLocation, DEFAULT_FLUSH_THRESHOLD};
use crate::tile::{is_valid_quality, DEFAULT_JPEG_QUALITY, DEFAULT_TILE_SIZE};

// =============================================================================
// Default Values
// =============================================================================

/// Database file name.
pub const DATABASE_FILE_NAME: &str = "cache.sqlite3";

/// Database used when no home directory is known.
pub const FALLBACK_DATABASE: &str = "pyramid-cache.sqlite3";

/// Default edge length of exported images.
pub const DEFAULT_EXPORT_SIZE: u32 = 512;

/// Smallest accepted tile size.
pub const MIN_TILE_SIZE: u32 = 16;

/// Largest accepted tile size.
pub const MAX_TILE_SIZE: u32 = 4096;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pyramid Cache - persistent tile pyramids for large images.
///
/// Resolves files, archive entries and URLs to images and keeps their tile
/// pyramids in a local database.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyramid-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database file.
    #[arg(long, global = true, env = "PYRAMID_DATABASE")]
    pub database: Option<PathBuf>,

    /// Number of worker threads for resolving and decoding.
    #[arg(long, global = true, default_value_t = DEFAULT_THREADS, env = "PYRAMID_THREADS")]
    pub threads: usize,

    /// Tile edge length in pixels.
    #[arg(long, global = true, default_value_t = DEFAULT_TILE_SIZE, env = "PYRAMID_TILE_SIZE")]
    pub tile_size: u32,

    /// Buffered tiles that trigger a write to the database.
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_FLUSH_THRESHOLD,
        env = "PYRAMID_FLUSH_THRESHOLD"
    )]
    pub flush_threshold: usize,

    /// Capacity of the coordinator's request queue.
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_REQUEST_CAPACITY,
        env = "PYRAMID_QUEUE_CAPACITY"
    )]
    pub queue_capacity: usize,

    /// JPEG quality of stored tiles (1-100).
    #[arg(long, global = true, default_value_t = DEFAULT_JPEG_QUALITY, env = "PYRAMID_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate the coarsest tile (thumbnail) of each resource.
    Thumbgen(ThumbgenArgs),

    /// Generate the full tile pyramid of each resource.
    Generate(LocatorArgs),

    /// Print resource metadata.
    Info(InfoArgs),

    /// List stored resources.
    List(ListArgs),

    /// Remove orphaned rows and compact the database.
    Cleanup,

    /// Write a resource as a PNG assembled from its tiles.
    Export(ExportArgs),
}

/// Resources to operate on.
#[derive(Args, Debug, Clone)]
pub struct LocatorArgs {
    /// Locators or file paths, e.g. `scan.zip//archive-zip:page1.png`.
    #[arg(required = true)]
    pub locators: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ThumbgenArgs {
    /// Locators or file paths.
    pub locators: Vec<String>,

    /// Also regenerate thumbnails of every stored resource.
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Args, Debug, Clone)]
pub struct InfoArgs {
    #[command(flatten)]
    pub target: LocatorArgs,

    /// Print JSON instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Glob patterns over stored locators. Lists everything when empty.
    pub patterns: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Locator or file path of the image.
    pub locator: String,

    /// Output PNG file.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Largest edge of the exported image; the coarsest scale that fits is used.
    #[arg(long, default_value_t = DEFAULT_EXPORT_SIZE)]
    pub size: u32,
}

impl Cli {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be greater than 0".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if !(MIN_TILE_SIZE..=MAX_TILE_SIZE).contains(&self.tile_size) {
            return Err(format!(
                "tile_size must be between {} and {}",
                MIN_TILE_SIZE, MAX_TILE_SIZE
            ));
        }
        if !is_valid_quality(self.jpeg_quality) {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if let Command::Export(args) = &self.command {
            if args.size == 0 {
                return Err("export size must be greater than 0".to_string());
            }
        }
        Ok(())
    }

    /// Database file: `--database`, else the user cache directory, else
    /// the working directory.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database {
            return path.clone();
        }
        match std::env::var_os("HOME").filter(|home| !home.is_empty()) {
            Some(home) => PathBuf::from(home)
                .join(".cache")
                .join("pyramid-cache")
                .join(DATABASE_FILE_NAME),
            None => PathBuf::from(FALLBACK_DATABASE),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            database: DatabaseLocation::File(self.database_path()),
            threads: self.threads,
            tile_size: self.tile_size,
            flush_threshold: self.flush_threshold,
            request_capacity: self.queue_capacity,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
            jpeg_quality: self.jpeg_quality,
            remote_cache_capacity: DEFAULT_REMOTE_CACHE_CAPACITY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
