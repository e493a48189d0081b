use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;

use super::ArchiveAdapter;
use crate::error::ResourceError;

const HANDLER: &str = "archive-tar";

/// `ustar` signature at offset 257 of the first header block.
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Uncompressed tar archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchive;

fn open(path: &Path) -> Result<tar::Archive<File>, ResourceError> {
    let file = File::open(path).map_err(|e| ResourceError::handler(HANDLER, e))?;
    Ok(tar::Archive::new(file))
}

fn handler_err(err: impl std::fmt::Display) -> ResourceError {
    ResourceError::handler(HANDLER, err)
}

impl ArchiveAdapter for TarArchive {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tar"]
    }

    fn matches_magic(&self, header: &[u8]) -> bool {
        header
            .get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len())
            .is_some_and(|magic| magic == USTAR_MAGIC)
    }

    fn list_entries(&self, path: &Path) -> Result<Vec<String>, ResourceError> {
        let mut archive = open(path)?;
        let mut names = Vec::new();
        for entry in archive.entries().map_err(handler_err)? {
            let entry = entry.map_err(handler_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            names.push(entry.path().map_err(handler_err)?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn read_entry(&self, path: &Path, name: &str) -> Result<Bytes, ResourceError> {
        let archive_len = std::fs::metadata(path).map_err(handler_err)?.len();
        let mut archive = open(path)?;
        for entry in archive.entries().map_err(handler_err)? {
            let mut entry = entry.map_err(handler_err)?;
            if entry.path().map_err(handler_err)?.to_string_lossy() != name {
                continue;
            }
            // Entries are stored uncompressed, so a larger size is a lie.
            let size = entry.size();
            if size > archive_len {
                return Err(handler_err(format!(
                    "{}: declares {} bytes in a {} byte archive",
                    name, size, archive_len
                )));
            }
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data).map_err(handler_err)?;
            return Ok(Bytes::from(data));
        }
        Err(handler_err(format!("{}: no such entry", name)))
    }

    fn extract_all(&self, path: &Path, dest: &Path) -> Result<(), ResourceError> {
        open(path)?.unpack(dest).map_err(handler_err)
    }
}
