//! Blob backends for pointer results.

use async_trait::async_trait;
use foreman_protocol::{Locator, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Abstract blob storage: pointer results keep only the locator.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<Locator, StoreError>;
    async fn read(&self, locator: &Locator) -> Result<Vec<u8>, StoreError>;
    async fn remove(&self, locator: &Locator) -> Result<(), StoreError>;
}

/// In-process blob storage, for tests and memory-backed deployments.
#[derive(Default)]
pub struct MemoryBlobBackend {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn write(&self, bytes: &[u8]) -> Result<Locator, StoreError> {
        let key = Uuid::new_v4().simple().to_string();
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .insert(key.clone(), bytes.to_vec());
        Ok(Locator::new("mem", key))
    }

    async fn read(&self, locator: &Locator) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .get(&locator.key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn remove(&self, locator: &Locator) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .remove(&locator.key);
        Ok(())
    }
}

/// Filesystem blob storage: `<root>/<aa>/<rest-of-key>`.
pub struct FsBlobBackend {
    root: PathBuf,
}

impl FsBlobBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let (prefix, rest) = key.split_at(2.min(key.len()));
        self.root.join(prefix).join(rest)
    }
}

#[async_trait]
impl BlobBackend for FsBlobBackend {
    async fn write(&self, bytes: &[u8]) -> Result<Locator, StoreError> {
        let key = Uuid::new_v4().simple().to_string();
        let path = self.path_for(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Blob(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))?;
        Ok(Locator::new("fs", key))
    }

    async fn read(&self, locator: &Locator) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path_for(&locator.key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Blob(e.to_string())),
        }
    }

    async fn remove(&self, locator: &Locator) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(&locator.key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Blob(e.to_string())),
        }
    }
}
