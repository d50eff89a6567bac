//! Storage backend abstraction
//!
//! The piece engine only speaks in file entries and byte ranges; a backend
//! decides where those bytes live. [`DiskBackend`] writes under a download
//! directory, [`MemoryBackend`] keeps everything in RAM.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::error::TorrentError;
use crate::storage::file::FileEntry;

/// Byte-range storage keyed by file entry
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare every non-padding file (create parents, size sparse files)
    async fn allocate(&self, files: &[FileEntry]) -> Result<()>;

    /// Write `data` at `offset` inside `file`
    async fn write_at(&self, file: &FileEntry, offset: u64, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at `offset` inside `file`. Bytes past the current
    /// end of the file read as zero.
    async fn read_at(&self, file: &FileEntry, offset: u64, length: usize) -> Result<Vec<u8>>;
}

/// Files under a base directory
#[derive(Debug, Clone)]
pub struct DiskBackend {
    base_path: PathBuf,
}

impl DiskBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, file: &FileEntry) -> PathBuf {
        self.base_path.join(&file.path)
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> TorrentError {
    error!("{} '{}': {}", action, path.display(), e);
    TorrentError::storage_error_full(action, path.display().to_string(), e.to_string())
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn allocate(&self, files: &[FileEntry]) -> Result<()> {
        for file in files.iter().filter(|f| !f.padding) {
            let path = self.full_path(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("Failed to create directory", parent, e))?;
            }
            let handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| io_error("Failed to create file", &path, e))?;
            let current = handle
                .metadata()
                .await
                .map_err(|e| io_error("Failed to stat file", &path, e))?
                .len();
            if current < file.length {
                handle
                    .set_len(file.length)
                    .await
                    .map_err(|e| io_error("Failed to set file length", &path, e))?;
            }
            debug!("Allocated {} ({} bytes)", path.display(), file.length);
        }
        Ok(())
    }

    async fn write_at(&self, file: &FileEntry, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.full_path(file);
        trace!("Writing {} bytes to {} at {}", data.len(), path.display(), offset);
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| io_error("Failed to open file for writing", &path, e))?;
        handle
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error("Failed to seek in file", &path, e))?;
        handle
            .write_all(data)
            .await
            .map_err(|e| io_error("Failed to write to file", &path, e))?;
        handle
            .flush()
            .await
            .map_err(|e| io_error("Failed to flush file", &path, e))?;
        Ok(())
    }

    async fn read_at(&self, file: &FileEntry, offset: u64, length: usize) -> Result<Vec<u8>> {
        let path = self.full_path(file);
        let mut buffer = vec![0u8; length];
        let mut handle = match fs::File::open(&path).await {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(buffer),
            Err(e) => return Err(io_error("Failed to open file for reading", &path, e).into()),
        };
        handle
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error("Failed to seek in file", &path, e))?;
        let mut filled = 0;
        while filled < length {
            let n = handle
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| io_error("Failed to read from file", &path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        trace!("Read {} of {} bytes from {} at {}", filled, length, path.display(), offset);
        Ok(buffer)
    }
}

/// In-memory storage, one growable buffer per file
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<usize, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn allocate(&self, files: &[FileEntry]) -> Result<()> {
        let mut map = self.files.lock().await;
        for file in files.iter().filter(|f| !f.padding) {
            map.entry(file.index).or_insert_with(|| vec![0u8; file.length as usize]);
        }
        Ok(())
    }

    async fn write_at(&self, file: &FileEntry, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end as u64 > file.length {
            return Err(TorrentError::storage_error_with_path(
                "Write past end of file",
                file.path.display().to_string(),
            )
            .into());
        }
        let mut map = self.files.lock().await;
        let buffer = map.entry(file.index).or_default();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, file: &FileEntry, offset: u64, length: usize) -> Result<Vec<u8>> {
        let map = self.files.lock().await;
        let mut out = vec![0u8; length];
        if let Some(buffer) = map.get(&file.index) {
            let start = (offset as usize).min(buffer.len());
            let end = (offset as usize + length).min(buffer.len());
            out[..end - start].copy_from_slice(&buffer[start..end]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, length: u64) -> FileEntry {
        FileEntry {
            index: 0,
            path: PathBuf::from(path),
            offset: 0,
            length,
            padding: false,
        }
    }

    #[tokio::test]
    async fn test_disk_backend_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path());
        let file = entry("nested/data.bin", 32);
        backend.allocate(std::slice::from_ref(&file)).await.unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("nested/data.bin")).unwrap().len(), 32);

        backend.write_at(&file, 4, b"hello").await.unwrap();
        let data = backend.read_at(&file, 2, 8).await.unwrap();
        assert_eq!(&data, b"\0\0hello\0");
    }

    #[tokio::test]
    async fn test_disk_backend_missing_file_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path());
        let data = backend.read_at(&entry("absent", 8), 0, 8).await.unwrap();
        assert_eq!(data, vec![0u8; 8]);
    }

    #[tokio::test]
    async fn test_memory_backend_bounds() {
        let backend = MemoryBackend::new();
        let file = entry("m", 8);
        backend.write_at(&file, 6, b"ab").await.unwrap();
        assert!(backend.write_at(&file, 7, b"ab").await.is_err());
        assert_eq!(backend.read_at(&file, 4, 6).await.unwrap(), b"\0\0ab\0\0".to_vec());
    }
}
