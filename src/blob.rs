//! Content-addressed blob storage.
//!
//! Sources and results are stored by their SHA-256 checksum. `put` is
//! idempotent: storing the same bytes twice yields the same checksum and
//! leaves a single copy.
//!
//! [`FsBlobStore`] lays files out as `<root>/<first two hex chars>/<checksum>`
//! and writes through a temp file + rename, so a reader never sees a
//! partially written blob.

use crate::cache::hash_bytes;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait BlobStore: Send + Sync {
    fn get(&self, checksum: &str) -> Result<Vec<u8>, BlobError>;
    /// Store `bytes`, returning their checksum.
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;
    fn contains(&self, checksum: &str) -> bool;
}

/// In-process store, used by the CLI and tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, checksum: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(checksum)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(checksum.to_string()))
    }

    fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let checksum = hash_bytes(bytes);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(checksum.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(checksum)
    }

    fn contains(&self, checksum: &str) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(checksum)
    }
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checksums are hex, so anything else can't name a blob. Rejecting it
    /// here also keeps `..` and separators out of paths.
    fn path_for(&self, checksum: &str) -> Option<PathBuf> {
        if checksum.len() < 3 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(&checksum[..2]).join(checksum))
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, checksum: &str) -> Result<Vec<u8>, BlobError> {
        let path = self
            .path_for(checksum)
            .ok_or_else(|| BlobError::NotFound(checksum.to_string()))?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(checksum.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let checksum = hash_bytes(bytes);
        let path = self
            .path_for(&checksum)
            .ok_or_else(|| BlobError::NotFound(checksum.clone()))?;
        if path.exists() {
            return Ok(checksum);
        }
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{checksum}.{}.tmp", std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(checksum)
    }

    fn contains(&self, checksum: &str) -> bool {
        self.path_for(checksum).is_some_and(|p| p.is_file())
    }
}
