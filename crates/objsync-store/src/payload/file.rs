//! File-backed payload store.
//!
//! One file per object key under the root directory. In-flight writes go
//! to `<path>.tmp`; the rename onto the final path is the publish step.

use super::PayloadStore;
use objsync_common::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Payload store rooted at a local directory
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Create a store from a `file://<absolute path>` URI. Any other
    /// scheme is rejected.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::new(parse_file_uri(uri)?)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

/// Parse a `file://` URI into its absolute path; the scheme match is
/// case-insensitive.
fn parse_file_uri(uri: &str) -> Result<PathBuf> {
    let path = uri
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("file://"))
        .map(|_| &uri[7..])
        .ok_or_else(|| Error::invalid_uri(uri))?;
    if !path.starts_with('/') {
        return Err(Error::invalid_uri(uri));
    }
    Ok(PathBuf::from(path))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

fn short_write(written: u64, expected: u64) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::WriteZero,
        format!("wrote {written} of {expected} bytes"),
    ))
}

impl PayloadStore for FileStore {
    fn append(
        &self,
        key: &str,
        reader: &mut dyn Read,
        length: u32,
        offset: i64,
        _total: i64,
        first_chunk: bool,
        last_chunk: bool,
    ) -> Result<()> {
        let path = self.blob_path(key);
        let staging = staging_path(&path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(first_chunk)
            .open(&staging)?;
        file.seek(SeekFrom::Start(offset.max(0) as u64))?;
        let written = if length > 0 {
            io::copy(&mut reader.take(u64::from(length)), &mut file)?
        } else {
            io::copy(reader, &mut file)?
        };
        if length > 0 && written != u64::from(length) {
            return Err(short_write(written, u64::from(length)));
        }
        if last_chunk {
            debug!(key, "publishing staged payload");
            fs::rename(&staging, &path)?;
        }
        Ok(())
    }

    fn store(&self, key: &str, reader: &mut dyn Read, length: i64) -> Result<i64> {
        let path = self.blob_path(key);
        let staging = staging_path(&path);
        let mut file = File::create(&staging)?;
        let written = io::copy(reader, &mut file)?;
        if length > 0 && written != length as u64 {
            return Err(short_write(written, length as u64));
        }
        fs::rename(&staging, &path)?;
        Ok(written as i64)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        match File::open(self.blob_path(key)) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    fn get_chunk(&self, key: &str, size: usize, offset: i64) -> Result<(Vec<u8>, bool, usize)> {
        let mut file = match File::open(self.blob_path(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(err) => return Err(err.into()),
        };
        let blob_size = file.metadata()?.len() as i64;
        if offset >= blob_size {
            return Ok((Vec::new(), true, 0));
        }
        file.seek(SeekFrom::Start(offset.max(0) as u64))?;
        let want = size.min((blob_size - offset) as usize);
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)?;
        let eof = offset + want as i64 >= blob_size;
        Ok((buf, eof, want))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key);
        for candidate in [staging_path(&path), path] {
            if let Err(err) = fs::remove_file(&candidate) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_all(store: &FileStore, key: &str) -> Vec<u8> {
        let mut reader = store.get(key).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_uri_parsing() {
        assert!(parse_file_uri("file:///var/data").is_ok());
        assert!(parse_file_uri("FILE:///var/data").is_ok());
        assert!(matches!(
            parse_file_uri("http://example.com/data"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            parse_file_uri("file://relative/path"),
            Err(Error::InvalidUri(_))
        ));
    }

    #[test]
    fn test_store_then_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let payload = b"the quick brown fox";
        let written = store
            .store("org:model:m1", &mut &payload[..], payload.len() as i64)
            .unwrap();
        assert_eq!(written, payload.len() as i64);
        assert_eq!(read_all(&store, "org:model:m1"), payload);
    }

    #[test]
    fn test_store_length_zero_accepts_any_size() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let written = store.store("k", &mut &b"abcdef"[..], 0).unwrap();
        assert_eq!(written, 6);
    }

    #[test]
    fn test_store_shortfall_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let err = store.store("k", &mut &b"abc"[..], 10).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_append_publishes_only_on_last_chunk() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store
            .append("k", &mut &b"abcd"[..], 4, 0, 8, true, false)
            .unwrap();
        // staged but not published
        assert!(store.get("k").is_err());
        store
            .append("k", &mut &b"efgh"[..], 4, 4, 8, false, true)
            .unwrap();
        assert_eq!(read_all(&store, "k"), b"abcdefgh");
    }

    #[test]
    fn test_get_chunk_boundaries() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.store("k", &mut &b"0123456789"[..], 10).unwrap();

        let (bytes, eof, n) = store.get_chunk("k", 4, 0).unwrap();
        assert_eq!((bytes.as_slice(), eof, n), (&b"0123"[..], false, 4));

        let (bytes, eof, n) = store.get_chunk("k", 4, 8).unwrap();
        assert_eq!((bytes.as_slice(), eof, n), (&b"89"[..], true, 2));

        // reading exactly to the end reports eof
        let (_, eof, n) = store.get_chunk("k", 10, 0).unwrap();
        assert!(eof);
        assert_eq!(n, 10);

        // offset at the end: empty slice, eof, no error
        let (bytes, eof, n) = store.get_chunk("k", 4, 10).unwrap();
        assert!(bytes.is_empty());
        assert!(eof);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.delete("never-stored").unwrap();
        store.store("k", &mut &b"x"[..], 1).unwrap();
        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(store.get("k").is_err());
    }
}
