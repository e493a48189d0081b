use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use zip::ZipArchive as ZipReader;

use super::ArchiveAdapter;
use crate::error::ResourceError;

const HANDLER: &str = "archive-zip";

/// Local file header and the empty-archive end-of-central-directory record.
const ZIP_MAGIC: [&[u8]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];

/// Zip archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchive;

fn open(path: &Path) -> Result<ZipReader<File>, ResourceError> {
    let file = File::open(path).map_err(|e| ResourceError::handler(HANDLER, e))?;
    ZipReader::new(file).map_err(|e| ResourceError::handler(HANDLER, e))
}

impl ArchiveAdapter for ZipArchive {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["zip"]
    }

    fn matches_magic(&self, header: &[u8]) -> bool {
        ZIP_MAGIC.iter().any(|magic| header.starts_with(magic))
    }

    fn list_entries(&self, path: &Path) -> Result<Vec<String>, ResourceError> {
        let archive = open(path)?;
        let names = archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_owned)
            .collect();
        Ok(names)
    }

    fn read_entry(&self, path: &Path, entry: &str) -> Result<Bytes, ResourceError> {
        let archive_len = std::fs::metadata(path)
            .map_err(|e| ResourceError::handler(HANDLER, e))?
            .len();
        let mut archive = open(path)?;
        let mut file = archive
            .by_name(entry)
            .map_err(|e| ResourceError::handler(HANDLER, format!("{}: {}", entry, e)))?;
        // The declared size comes from the archive; only trust it as far as
        // the archive's own length.
        let mut data = Vec::with_capacity(file.size().min(archive_len) as usize);
        file.read_to_end(&mut data)
            .map_err(|e| ResourceError::handler(HANDLER, format!("{}: {}", entry, e)))?;
        Ok(Bytes::from(data))
    }

    fn extract_all(&self, path: &Path, dest: &Path) -> Result<(), ResourceError> {
        open(path)?
            .extract(dest)
            .map_err(|e| ResourceError::handler(HANDLER, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::zip_bytes;

    #[test]
    fn test_list_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, zip_bytes(&[("x/", &b""[..]), ("x/a.png", &b"1"[..]), ("b.jpg", &b"2"[..])])).unwrap();

        let mut entries = ZipArchive.list_entries(&path).unwrap();
        entries.sort();
        assert_eq!(entries, vec!["b.jpg".to_string(), "x/a.png".to_string()]);
    }

    #[test]
    fn test_extract_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, zip_bytes(&[("x/a.txt", b"zipped")])).unwrap();

        let out = dir.path().join("out");
        ZipArchive.extract_all(&path, &out).unwrap();
        assert_eq!(std::fs::read(out.join("x/a.txt")).unwrap(), b"zipped");
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, b"plain text").unwrap();

        assert!(!ZipArchive.matches_magic(b"plain text"));
        assert!(matches!(
            ZipArchive.list_entries(&path),
            Err(ResourceError::Handler { .. })
        ));
    }
}
