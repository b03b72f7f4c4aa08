//! In-process log storage, used by tests and embedded hosts.

use super::{truncate_keep_tail, validate_path, LogStorage};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct InMemoryLogStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    max_content_bytes: usize,
}

impl InMemoryLogStorage {
    pub fn new(max_content_bytes: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            max_content_bytes,
        }
    }

    /// Stored paths in lexical order
    pub fn paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().get(path).cloned()
    }
}

impl Default for InMemoryLogStorage {
    fn default() -> Self {
        Self::new(crate::constants::defaults::MAX_CONTENT_BYTES)
    }
}

#[async_trait]
impl LogStorage for InMemoryLogStorage {
    async fn write(&self, path: &str, content: &[u8]) -> StorageResult<()> {
        validate_path(path)?;
        let body = truncate_keep_tail(content, self.max_content_bytes).to_vec();
        self.objects.write().insert(path.to_string(), body);
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        validate_path(path)?;
        self.get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}
