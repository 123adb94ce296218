//! Storage abstraction for journal segment files.
//!
//! A trait-based backend boundary so the journal can run over real files
//! in production and in-memory buffers in tests. The trait handles raw
//! bytes at offsets; segments, records and checksums are the journal's
//! concern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{JournalError, JournalResult};

/// Storage backend trait for segment files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens or creates a file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>>;

    /// Lists files in a directory with the given extension.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>>;

    /// Removes a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    async fn remove(&self, path: &Path) -> JournalResult<()>;

    /// Creates a directory and all parents.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> JournalResult<()>;
}

/// A handle to an open segment file.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Writes data at the given offset.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn write_at(&self, offset: u64, data: &[u8]) -> JournalResult<()>;

    /// Reads up to `len` bytes from the given offset.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_at(&self, offset: u64, len: usize) -> JournalResult<Bytes>;

    /// Reads the entire file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> JournalResult<Bytes>;

    /// Forces buffered data to stable storage (fsync).
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync(&self) -> JournalResult<()>;

    /// Returns the current file size.
    ///
    /// # Errors
    /// Returns an error if the size cannot be determined.
    async fn size(&self) -> JournalResult<u64>;

    /// Truncates the file to `len` bytes.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> JournalResult<()>;
}

/// File storage backed by `std::fs` through tokio's blocking pool.
///
/// Positioned reads and writes avoid shared-seek races between the
/// journal's append path and concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new storage instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>> {
        let path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
        })
        .await
        .map_err(|e| JournalError::io("open", e))?
        .map_err(|e| JournalError::io("open", e))?;

        Ok(Box::new(TokioFile {
            file: Arc::new(file),
        }))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>> {
        let dir = dir.to_path_buf();
        let extension = extension.to_string();
        tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == extension.as_str()) {
                    paths.push(path);
                }
            }
            Ok(paths)
        })
        .await
        .map_err(|e| JournalError::io("list", e))?
        .map_err(|e: std::io::Error| JournalError::io("list", e))
    }

    async fn remove(&self, path: &Path) -> JournalResult<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::remove_file(path))
            .await
            .map_err(|e| JournalError::io("remove", e))?
            .map_err(|e| JournalError::io("remove", e))
    }

    async fn create_dir_all(&self, path: &Path) -> JournalResult<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(path))
            .await
            .map_err(|e| JournalError::io("mkdir", e))?
            .map_err(|e| JournalError::io("mkdir", e))
    }
}

/// A file handle using positioned I/O.
struct TokioFile {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl StorageFile for TokioFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> JournalResult<()> {
        use std::os::unix::fs::FileExt;

        let file = Arc::clone(&self.file);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| JournalError::io("write", e))?
            .map_err(|e| JournalError::io("write", e))
    }

    async fn read_at(&self, offset: u64, len: usize) -> JournalResult<Bytes> {
        use std::os::unix::fs::FileExt;

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| JournalError::io("read", e))?
        .map_err(|e: std::io::Error| JournalError::io("read", e))
    }

    async fn read_all(&self) -> JournalResult<Bytes> {
        let size = self.size().await?;
        // Safe cast: segment files are bounded well below usize::MAX.
        #[allow(clippy::cast_possible_truncation)]
        self.read_at(0, size as usize).await
    }

    async fn sync(&self) -> JournalResult<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| JournalError::io("sync", e))?
            .map_err(|e| JournalError::io("sync", e))
    }

    async fn size(&self) -> JournalResult<u64> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(|e| JournalError::io("size", e))?
            .map_err(|e| JournalError::io("size", e))
    }

    async fn truncate(&self, len: u64) -> JournalResult<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|e| JournalError::io("truncate", e))?
            .map_err(|e| JournalError::io("truncate", e))
    }
}

/// In-memory storage for tests.
///
/// Clones share the same underlying file map, so a journal can be
/// "reopened" against the same storage to exercise recovery.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryStorage {
    /// Creates a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn open(&self, path: &Path) -> JournalResult<Box<dyn StorageFile>> {
        let mut files = self.files.lock().expect("storage lock poisoned");
        let data = files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        Ok(Box::new(MemoryFile {
            data: Arc::clone(data),
        }))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> JournalResult<Vec<PathBuf>> {
        let files = self.files.lock().expect("storage lock poisoned");
        Ok(files
            .keys()
            .filter(|p| {
                p.parent() == Some(dir) && p.extension().is_some_and(|e| e == extension)
            })
            .cloned()
            .collect())
    }

    async fn remove(&self, path: &Path) -> JournalResult<()> {
        let mut files = self.files.lock().expect("storage lock poisoned");
        files.remove(path);
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> JournalResult<()> {
        Ok(())
    }
}

/// An in-memory file.
struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl StorageFile for MemoryFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> JournalResult<()> {
        let mut file = self.data.lock().expect("file lock poisoned");
        // Safe cast: in-memory files are small.
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> JournalResult<Bytes> {
        let file = self.data.lock().expect("file lock poisoned");
        // Safe cast: in-memory files are small.
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        if offset >= file.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + len).min(file.len());
        Ok(Bytes::copy_from_slice(&file[offset..end]))
    }

    async fn read_all(&self) -> JournalResult<Bytes> {
        let file = self.data.lock().expect("file lock poisoned");
        Ok(Bytes::copy_from_slice(&file))
    }

    async fn sync(&self) -> JournalResult<()> {
        Ok(())
    }

    async fn size(&self) -> JournalResult<u64> {
        let file = self.data.lock().expect("file lock poisoned");
        Ok(file.len() as u64)
    }

    async fn truncate(&self, len: u64) -> JournalResult<()> {
        let mut file = self.data.lock().expect("file lock poisoned");
        // Safe cast: in-memory files are small.
        #[allow(clippy::cast_possible_truncation)]
        file.truncate(len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        let path = Path::new("/j/segment-0.jnl");

        let file = storage.open(path).await.unwrap();
        file.write_at(0, b"hello").await.unwrap();
        file.write_at(5, b" world").await.unwrap();

        assert_eq!(file.size().await.unwrap(), 11);
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello world");

        file.truncate(5).await.unwrap();
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_memory_storage_shared_across_clones() {
        let storage = MemoryStorage::new();
        let path = Path::new("/j/segment-0.jnl");

        {
            let file = storage.open(path).await.unwrap();
            file.write_at(0, b"persisted").await.unwrap();
        }

        let reopened = storage.clone().open(path).await.unwrap();
        assert_eq!(&reopened.read_all().await.unwrap()[..], b"persisted");
    }

    #[tokio::test]
    async fn test_memory_storage_list_and_remove() {
        let storage = MemoryStorage::new();
        storage.open(Path::new("/j/a.jnl")).await.unwrap();
        storage.open(Path::new("/j/b.jnl")).await.unwrap();
        storage.open(Path::new("/j/c.other")).await.unwrap();

        let listed = storage.list_files(Path::new("/j"), "jnl").await.unwrap();
        assert_eq!(listed.len(), 2);

        storage.remove(Path::new("/j/a.jnl")).await.unwrap();
        let listed = storage.list_files(Path::new("/j"), "jnl").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
