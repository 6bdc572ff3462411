//! Raw request bodies awaiting upload.
//!
//! Blobs are named by the upload id. Each blob is written once and deleted
//! when its upload completes or is abandoned.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rk_cache::store::{validate_key, write_atomic};
use rk_cache::StoreError;
use serde::Serialize;

/// Blob count and total size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlobStats {
    pub count: usize,
    pub bytes: u64,
}

/// Storage for upload bodies.
pub trait BlobStore: Send + Sync {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Deleting a missing blob is not an error.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    fn exists(&self, name: &str) -> Result<bool, StoreError>;
    /// All blob names, sorted. May include names that are not upload ids.
    fn list(&self) -> Result<Vec<String>, StoreError>;
    fn stats(&self) -> Result<BlobStats, StoreError>;
}

// ----------------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------------

/// One file per blob in a flat directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_key(name)?;
        Ok(self.dir.join(name))
    }

    fn io(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.path_for(name)?, bytes)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io(&path, e)),
        }
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io(&path, e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(name)?.is_file())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io(&self.dir, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && !name.contains(".tmp.") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn stats(&self) -> Result<BlobStats, StoreError> {
        let mut stats = BlobStats::default();
        for name in self.list()? {
            let path = self.dir.join(&name);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                // Deleted between list and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io(&path, e)),
            };
            stats.count += 1;
            stats.bytes += meta.len();
        }
        Ok(stats)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(name)?;
        self.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(name).cloned())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(name))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn stats(&self) -> Result<BlobStats, StoreError> {
        let blobs = self.lock();
        Ok(BlobStats {
            count: blobs.len(),
            bytes: blobs.values().map(|b| b.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_blob_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path().join("uploads")).unwrap();
        let name = "0b7f9a3e-5d1c-4c1e-9a57-2f4b8e6c1d20";

        store.write(name, b"payload").unwrap();
        assert!(store.exists(name).unwrap());
        assert_eq!(store.read(name).unwrap(), Some(b"payload".to_vec()));
        assert_eq!(
            store.stats().unwrap(),
            BlobStats {
                count: 1,
                bytes: 7
            }
        );

        store.delete(name).unwrap();
        assert!(!store.exists(name).unwrap());
        assert_eq!(store.read(name).unwrap(), None);
        store.delete(name).unwrap();
    }

    #[test]
    fn test_fs_list_skips_directories_and_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store.write("b", b"1").unwrap();
        store.write("a", b"22").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.tmp.99"), b"partial").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a", "b"]);
        assert_eq!(store.stats().unwrap().bytes, 3);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.write("../evil", b"x"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_memory_stats() {
        let store = MemoryBlobStore::new();
        store.write("x", b"abc").unwrap();
        store.write("y", b"de").unwrap();
        assert_eq!(
            store.stats().unwrap(),
            BlobStats {
                count: 2,
                bytes: 5
            }
        );
    }
}
