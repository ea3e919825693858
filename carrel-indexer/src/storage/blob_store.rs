//! Blob store adapters.
//!
//! The pipeline treats raw file bytes as opaque blobs behind the
//! [`BlobStore`] trait. [`FsBlobStore`] is the real adapter: a flat
//! content-addressed directory where a blob's reference is the BLAKE3 hash
//! of its bytes, which makes re-storing identical content idempotent.
//! [`MemoryBlobStore`] backs tests and can simulate an outage so retry
//! behavior is exercisable without touching a disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::storage::{BlobRef, BlobStore};

fn blob_ref_for(bytes: &[u8]) -> BlobRef {
    blake3::hash(bytes).to_hex().to_string()
}

/// Content-addressed blob storage under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a blob directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| PipelineError::StorageUnavailable(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, blob_ref: &str) -> Result<PathBuf> {
        // Refs are hex digests produced by store(); anything else never
        // came from this adapter.
        if blob_ref.is_empty() || !blob_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::Internal(format!(
                "malformed blob ref '{blob_ref}'"
            )));
        }
        Ok(self.root.join(blob_ref))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, bytes: &[u8], _mime_type: &str) -> Result<BlobRef> {
        let blob_ref = blob_ref_for(bytes);
        let path = self.path_for(&blob_ref)?;
        // Each call stages under its own name; concurrent stores of
        // identical bytes must never share a partial file.
        let staging = self
            .root
            .join(format!("{blob_ref}.{}.partial", Uuid::new_v4()));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| PipelineError::StorageUnavailable(format!("write blob: {e}")))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(PipelineError::StorageUnavailable(format!(
                "publish blob: {e}"
            )));
        }
        Ok(blob_ref)
    }

    async fn fetch(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::StorageUnavailable(format!("read blob {blob_ref}: {e}")))
    }

    async fn delete(&self, blob_ref: &str) -> Result<()> {
        let path = self.path_for(blob_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::StorageUnavailable(format!(
                "delete blob {blob_ref}: {e}"
            ))),
        }
    }
}

/// In-memory blob storage for tests and demos.
#[derive(Debug, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobRef, Vec<u8>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle simulated availability; while unavailable every operation
    /// returns `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(PipelineError::StorageUnavailable(
                "blob store offline".into(),
            ))
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(&self, bytes: &[u8], _mime_type: &str) -> Result<BlobRef> {
        self.check_available()?;
        let blob_ref = blob_ref_for(bytes);
        self.blobs
            .write()
            .await
            .insert(blob_ref.clone(), bytes.to_vec());
        Ok(blob_ref)
    }

    async fn fetch(&self, blob_ref: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        self.blobs
            .read()
            .await
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| {
                PipelineError::StorageUnavailable(format!("blob {blob_ref} missing"))
            })
    }

    async fn delete(&self, blob_ref: &str) -> Result<()> {
        self.check_available()?;
        self.blobs.write().await.remove(blob_ref);
        Ok(())
    }
}
