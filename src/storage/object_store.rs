//! Blob storage for raw document bytes, keyed by `{hash}_{safe_filename}`.
//! Deliberately thin: a trait the Orchestrator depends on, plus a
//! filesystem-backed implementation for local development and tests. A
//! production host wires in its own (S3, GCS, ...) behind the same trait.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> EngineResult<()>;
    async fn get(&self, key: &str) -> EngineResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
}

pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> EngineResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(EngineError::Validation(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> EngineResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> EngineResult<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}
