//! Backing media abstraction.

use crate::error::PoolResult;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Random-access backing media for a pool.
///
/// The pool owns all format interpretation; media implementations are
/// plain byte stores. The production implementation is [`FsPoolFile`];
/// tests substitute fault-injecting wrappers to exercise the crash
/// recovery path.
pub trait PoolFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PoolResult<()>;

    /// Writes all of `data` starting at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> PoolResult<()>;

    /// Resizes the media to `len` bytes, zero-filling any extension.
    fn set_len(&self, len: u64) -> PoolResult<()>;

    /// Returns the current media size in bytes.
    fn size(&self) -> PoolResult<u64>;

    /// Ensures all previous writes are durable.
    fn sync(&self) -> PoolResult<()>;
}

/// File-backed pool media using OS file APIs.
#[derive(Debug)]
pub struct FsPoolFile {
    path: PathBuf,
    file: RwLock<File>,
}

impl FsPoolFile {
    /// Creates a new backing file. Fails if the file already exists.
    pub fn create(path: &Path) -> PoolResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Opens an existing backing file.
    pub fn open(path: &Path) -> PoolResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PoolFile for FsPoolFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PoolResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PoolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn set_len(&self, len: u64) -> PoolResult<()> {
        let file = self.file.write();
        file.set_len(len)?;
        Ok(())
    }

    fn size(&self) -> PoolResult<u64> {
        let file = self.file.read();
        Ok(file.metadata()?.len())
    }

    fn sync(&self) -> PoolResult<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        let media = FsPoolFile::create(&path).unwrap();
        media.set_len(128).unwrap();
        media.write_at(16, b"hello").unwrap();
        media.sync().unwrap();
        drop(media);

        let media = FsPoolFile::open(&path).unwrap();
        assert_eq!(media.size().unwrap(), 128);

        let mut buf = [0u8; 5];
        media.read_at(16, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.bin");

        FsPoolFile::create(&path).unwrap();
        assert!(FsPoolFile::create(&path).is_err());
    }

    #[test]
    fn open_refuses_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(FsPoolFile::open(&path).is_err());
    }
}
