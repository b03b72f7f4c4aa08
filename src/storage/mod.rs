//! # Log/Artifact Store
//!
//! Step logs and terraform artifacts are written under deterministic
//! per-task paths (see [`crate::constants::paths`]). Oversized content is
//! truncated from the front so the tail, which holds the final output of a
//! run, is always retained.

pub mod fs;
pub mod memory;

pub use fs::FsLogStorage;
pub use memory::InMemoryLogStorage;

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Component, Path};

#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Replace the object at `path` with `content`
    async fn write(&self, path: &str, content: &[u8]) -> StorageResult<()>;

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;
}

/// Keep at most `max_bytes` of `content`, dropping from the front.
///
/// The cut is moved forward past UTF-8 continuation bytes so text content
/// never starts mid-character.
pub fn truncate_keep_tail(content: &[u8], max_bytes: usize) -> &[u8] {
    if content.len() <= max_bytes {
        return content;
    }
    let mut start = content.len() - max_bytes;
    while start < content.len() && (content[start] & 0xC0) == 0x80 {
        start += 1;
    }
    &content[start..]
}

/// Reject absolute paths and parent traversal; storage paths are always relative
pub(crate) fn validate_path(path: &str) -> StorageResult<()> {
    let candidate = Path::new(path);
    let valid = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}
