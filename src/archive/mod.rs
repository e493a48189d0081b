//! Archive adapters.
//!
//! An archive handler (`//archive-<name>:<entry>`) pulls one entry out of a
//! container blob. Adapters work on file paths, so in-memory blobs are
//! spilled to a temporary file first.
//!
//! Adapters are selected by handler name when the locator names one, and
//! otherwise by file extension with a magic-number fallback.

mod tar_archive;
mod zip_archive;

pub use tar_archive::TarArchive;
pub use zip_archive::ZipArchive;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::blob::{Blob, MAGIC_PROBE_LEN};
use crate::error::ResourceError;
use crate::locator::Handler;

/// Handler type that routes to archive adapters.
pub const ARCHIVE_HANDLER_TYPE: &str = "archive";

// =============================================================================
// ArchiveAdapter Trait
// =============================================================================

/// A container format that can list and extract entries.
pub trait ArchiveAdapter: Send + Sync {
    /// Short name used in handler segments, e.g. `zip`.
    fn name(&self) -> &'static str;

    /// Lowercase file extensions, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Whether the leading bytes of a file identify this format.
    fn matches_magic(&self, header: &[u8]) -> bool;

    /// Names of all regular-file entries.
    fn list_entries(&self, path: &Path) -> Result<Vec<String>, ResourceError>;

    /// Contents of a single entry.
    fn read_entry(&self, path: &Path, entry: &str) -> Result<Bytes, ResourceError>;

    /// Unpack every entry under `dest`.
    fn extract_all(&self, path: &Path, dest: &Path) -> Result<(), ResourceError>;
}

// =============================================================================
// ArchiveRegistry
// =============================================================================

/// The set of known archive adapters.
#[derive(Clone, Default)]
pub struct ArchiveRegistry {
    adapters: Vec<Arc<dyn ArchiveAdapter>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the zip and tar adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ZipArchive);
        registry.register(TarArchive);
        registry
    }

    pub fn register(&mut self, adapter: impl ArchiveAdapter + 'static) {
        self.adapters.push(Arc::new(adapter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ArchiveAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn find_by_extension(&self, file_name: &str) -> Option<Arc<dyn ArchiveAdapter>> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
        self.adapters
            .iter()
            .find(|a| a.extensions().contains(&ext.as_str()))
            .cloned()
    }

    pub fn find_by_magic(&self, header: &[u8]) -> Option<Arc<dyn ArchiveAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.matches_magic(header))
            .cloned()
    }

    /// Pick an adapter for a blob: extension first, then magic.
    pub fn select(&self, file_name: Option<&str>, header: &[u8]) -> Option<Arc<dyn ArchiveAdapter>> {
        file_name
            .and_then(|name| self.find_by_extension(name))
            .or_else(|| self.find_by_magic(header))
    }

    /// Resolve one `archive-<name>:<entry>` handler against `blob`.
    ///
    /// If the named adapter fails, an adapter chosen by magic number gets a
    /// second try, which covers archives with a misleading name.
    pub fn dig(&self, blob: &Blob, handler: &Handler) -> Result<Blob, ResourceError> {
        let adapter = self
            .get(handler.name())
            .ok_or_else(|| ResourceError::UnknownHandler(handler.qualified_name()))?;
        let path = blob.stdio_path()?;
        let entry = handler.args();

        let data = match adapter.read_entry(&path, entry) {
            Ok(data) => data,
            Err(err) => {
                let header = blob.header(MAGIC_PROBE_LEN)?;
                match self.find_by_magic(&header) {
                    Some(alt) if alt.name() != adapter.name() => {
                        warn!(
                            "{} adapter failed on {}, retrying as {}: {}",
                            adapter.name(),
                            path.display(),
                            alt.name(),
                            err
                        );
                        alt.read_entry(&path, entry)?
                    }
                    _ => return Err(err),
                }
            }
        };

        debug!(entry, len = data.len(), "extracted archive entry");
        let name = Path::new(entry)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(Blob::from_bytes(data, name))
    }

    /// List the entries of an archive blob, choosing the adapter by name
    /// hint and magic.
    pub fn list(&self, blob: &Blob) -> Result<(Arc<dyn ArchiveAdapter>, Vec<String>), ResourceError> {
        let header = blob.header(MAGIC_PROBE_LEN)?;
        let adapter = self
            .select(blob.name(), &header)
            .ok_or_else(|| ResourceError::UnknownHandler(format!("{:?} is not an archive", blob)))?;
        let path = blob.stdio_path()?;
        let entries = adapter.list_entries(&path)?;
        Ok((adapter, entries))
    }
}

impl std::fmt::Debug for ArchiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|a| a.name()))
            .finish()
    }
}
