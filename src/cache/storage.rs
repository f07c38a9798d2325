//! Segment storage
//!
//! Addressable byte-blob store keyed by `(session_id, segment_index)`.
//! `DiskStore` keeps one file per segment so the playback engine can load
//! segments by path.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// File name prefix for cached segments
pub const CACHE_FILE_PREFIX: &str = "cache-";

/// File extension for cached segments
pub const CACHE_FILE_EXT: &str = ".mp3";

// ============ Keys ============

/// Storage key of one payload segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    pub session_id: u64,
    pub index: u32,
}

impl SegmentKey {
    pub fn new(session_id: u64, index: u32) -> Self {
        Self { session_id, index }
    }

    /// File name used by `DiskStore`, e.g. `cache-9987-0.mp3`
    pub fn file_name(&self) -> String {
        format!(
            "{}{}-{}{}",
            CACHE_FILE_PREFIX, self.session_id, self.index, CACHE_FILE_EXT
        )
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

// ============ Errors ============

/// Errors from the segment store
#[derive(Debug)]
pub enum StorageError {
    /// Storage directory could not be created
    CreateDir { path: PathBuf, source: io::Error },
    /// Segment could not be written
    Write { key: SegmentKey, source: io::Error },
    /// Segment could not be deleted
    Delete { key: SegmentKey, source: io::Error },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::CreateDir { path, source } => {
                write!(f, "Failed to create cache directory {:?}: {}", path, source)
            }
            StorageError::Write { key, source } => {
                write!(f, "Failed to write segment {}: {}", key, source)
            }
            StorageError::Delete { key, source } => {
                write!(f, "Failed to delete segment {}: {}", key, source)
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::CreateDir { source, .. }
            | StorageError::Write { source, .. }
            | StorageError::Delete { source, .. } => Some(source),
        }
    }
}

// ============ Store trait ============

/// Addressable segment storage
///
/// `write` replaces any blob already stored under the key and returns the
/// location the playback engine should load.
pub trait SegmentStore: Send + Sync {
    fn write(&self, key: &SegmentKey, bytes: &[u8]) -> Result<PathBuf, StorageError>;

    /// Deleting a key that was never written is not an error
    fn delete(&self, key: &SegmentKey) -> Result<(), StorageError>;
}

// ============ Disk store ============

/// One file per segment inside a cache directory
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of a segment, whether or not it exists
    pub fn path_for(&self, key: &SegmentKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl SegmentStore for DiskStore {
    fn write(&self, key: &SegmentKey, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key);
        fs::write(&path, bytes).map_err(|source| StorageError::Write { key: *key, source })?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(path)
    }

    fn delete(&self, key: &SegmentKey) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Delete { key: *key, source }),
        }
    }
}

// ============ Memory store ============

#[cfg(test)]
pub use memory::{FailingStore, MemoryStore};
