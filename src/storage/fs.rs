//! Filesystem-backed log storage rooted at a configured directory.

use super::{truncate_keep_tail, validate_path, LogStorage};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FsLogStorage {
    root_dir: PathBuf,
    max_content_bytes: usize,
}

impl FsLogStorage {
    pub fn new(root_dir: impl Into<PathBuf>, max_content_bytes: usize) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_content_bytes,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.root_dir, config.max_content_bytes)
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        validate_path(path)?;
        Ok(self.root_dir.join(path))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[async_trait]
impl LogStorage for FsLogStorage {
    async fn write(&self, path: &str, content: &[u8]) -> StorageResult<()> {
        let full_path = self.resolve(path)?;
        let body = truncate_keep_tail(content, self.max_content_bytes);
        if body.len() < content.len() {
            warn!(
                path = %path,
                original_bytes = content.len(),
                kept_bytes = body.len(),
                "Truncated oversized log content"
            );
        }

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&full_path, body)
            .await
            .map_err(|source| io_error(path, source))?;

        debug!(path = %path, bytes = body.len(), "Wrote log object");
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let full_path = self.resolve(path)?;
        tokio::fs::read(&full_path)
            .await
            .map_err(|source| io_error(path, source))
    }
}
