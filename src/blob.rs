//! Blobs: immutable byte sequences with a content identity.
//!
//! A blob is backed either by a local file or by bytes in memory (a download
//! or an entry pulled out of an archive). Adapters that can only work on a
//! file path get one through [`Blob::stdio_path`], which spills in-memory
//! blobs to a temporary file that lives as long as the blob.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use crate::error::IoError;

/// Number of leading bytes handed to magic-number detection.
pub const MAGIC_PROBE_LEN: usize = 512;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// BlobInfo
// =============================================================================

/// Content identity of a blob: SHA-1 digest plus byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobInfo {
    hash: [u8; 20],
    size: u64,
}

impl BlobInfo {
    pub fn new(hash: [u8; 20], size: u64) -> Self {
        Self { hash, size }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let hash: [u8; 20] = Sha1::digest(data).into();
        Self::new(hash, data.len() as u64)
    }

    /// Hash a stream without holding it in memory.
    pub fn from_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Self::new(hasher.finalize().into(), size))
    }

    /// Rebuild from the hex digest stored in the database.
    pub fn from_hex(hash: &str, size: u64) -> Option<Self> {
        let bytes = hex::decode(hash).ok()?;
        let hash: [u8; 20] = bytes.try_into().ok()?;
        Some(Self::new(hash, size))
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for BlobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_hex(), self.size)
    }
}

impl Serialize for BlobInfo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Blob
// =============================================================================

#[derive(Clone)]
enum Source {
    File(PathBuf),
    Memory(Bytes),
}

struct Inner {
    source: Source,
    name: Option<String>,
    content_type: Option<String>,
    info: OnceLock<BlobInfo>,
    spill: Mutex<Option<NamedTempFile>>,
}

/// Shared handle to an immutable byte sequence.
///
/// Cloning is cheap. A temporary file created by [`Blob::stdio_path`] is
/// removed when the last clone is dropped.
#[derive(Clone)]
pub struct Blob {
    inner: Arc<Inner>,
}

impl Blob {
    fn with_source(source: Source, name: Option<String>, content_type: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                name,
                content_type,
                info: OnceLock::new(),
                spill: Mutex::new(None),
            }),
        }
    }

    /// Blob backed by a local file. The file is read lazily.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Self::with_source(Source::File(path), name, None)
    }

    /// Blob backed by bytes in memory.
    ///
    /// `name` is a file name hint (an archive entry or the last url segment)
    /// used for extension-based format selection.
    pub fn from_bytes(data: impl Into<Bytes>, name: Option<String>) -> Self {
        Self::with_source(Source::Memory(data.into()), name, None)
    }

    /// Attach the media type a server reported for the blob. Parameters
    /// such as `; charset=...` are dropped.
    pub fn with_content_type(self, content_type: Option<String>) -> Self {
        let content_type = content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        Self::with_source(self.inner.source.clone(), self.inner.name.clone(), content_type)
    }

    /// File name hint, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Media type reported by the server the blob came from.
    pub fn content_type(&self) -> Option<&str> {
        self.inner.content_type.as_deref()
    }

    /// Path of the backing file, when the blob came from one.
    pub fn source_path(&self) -> Option<&Path> {
        match &self.inner.source {
            Source::File(path) => Some(path),
            Source::Memory(_) => None,
        }
    }

    /// The full contents.
    pub fn data(&self) -> Result<Bytes, IoError> {
        match &self.inner.source {
            Source::Memory(data) => Ok(data.clone()),
            Source::File(path) => std::fs::read(path)
                .map(Bytes::from)
                .map_err(|e| IoError::file(path.display(), e)),
        }
    }

    /// Up to `len` leading bytes, for magic-number detection.
    pub fn header(&self, len: usize) -> Result<Bytes, IoError> {
        match &self.inner.source {
            Source::Memory(data) => Ok(data.slice(..len.min(data.len()))),
            Source::File(path) => {
                let file = File::open(path).map_err(|e| IoError::file(path.display(), e))?;
                let mut buf = Vec::with_capacity(len);
                file.take(len as u64)
                    .read_to_end(&mut buf)
                    .map_err(|e| IoError::file(path.display(), e))?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Content hash and size, computed once.
    pub fn info(&self) -> Result<BlobInfo, IoError> {
        if let Some(info) = self.inner.info.get() {
            return Ok(*info);
        }
        let info = match &self.inner.source {
            Source::Memory(data) => BlobInfo::from_bytes(data),
            Source::File(path) => File::open(path)
                .and_then(BlobInfo::from_reader)
                .map_err(|e| IoError::file(path.display(), e))?,
        };
        Ok(*self.inner.info.get_or_init(|| info))
    }

    /// A filesystem path holding the blob's bytes.
    ///
    /// File-backed blobs return their own path. In-memory blobs are written
    /// once to a temporary file that keeps the name hint's extension.
    pub fn stdio_path(&self) -> Result<PathBuf, IoError> {
        let data = match &self.inner.source {
            Source::File(path) => return Ok(path.clone()),
            Source::Memory(data) => data,
        };

        let mut spill = self
            .inner
            .spill
            .lock()
            .map_err(|_| IoError::file("<temporary file>", "spill lock poisoned"))?;
        if let Some(file) = spill.as_ref() {
            return Ok(file.path().to_path_buf());
        }

        let suffix = self
            .name()
            .and_then(|name| Path::new(name).extension())
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("pyramid-blob-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| IoError::file("<temporary file>", e))?;
        file.write_all(data)
            .and_then(|_| file.flush())
            .map_err(|e| IoError::file(file.path().display(), e))?;

        let path = file.path().to_path_buf();
        *spill = Some(file);
        Ok(path)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Blob");
        match &self.inner.source {
            Source::File(path) => s.field("path", path),
            Source::Memory(data) => s.field("len", &data.len()),
        };
        s.field("name", &self.inner.name)
            .field("content_type", &self.inner.content_type)
            .finish()
    }
}
