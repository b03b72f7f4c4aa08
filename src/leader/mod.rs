//! # Leader Election
//!
//! Exactly one scheduler process may dispatch tasks at a time. Processes
//! compete for a [`DistributedLock`] keyed by a fixed identifier; the winner
//! receives a [`LockLease`] that carries a "lock lost" signal. Everything
//! derived from a leadership epoch observes that signal and stops when it
//! fires.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLock;
pub use postgres::PgAdvisoryLock;

use crate::error::LockResult;
use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until `key` is owned by `identity` or `cancel` fires.
    ///
    /// Contention is not an error: implementations keep retrying until the
    /// lock is free. Cancellation yields `LockError::Canceled`.
    async fn acquire(
        &self,
        key: &str,
        identity: &str,
        cancel: &CancellationToken,
    ) -> LockResult<LockLease>;
}

/// Backend hook that gives the lock up
#[async_trait]
pub trait LeaseReleaser: Send + Sync {
    async fn release(self: Box<Self>) -> LockResult<()>;
}

/// Proof of lock ownership for one leadership epoch
pub struct LockLease {
    key: String,
    identity: String,
    lost: CancellationToken,
    releaser: Option<Box<dyn LeaseReleaser>>,
}

impl LockLease {
    pub fn new(
        key: impl Into<String>,
        identity: impl Into<String>,
        lost: CancellationToken,
        releaser: Box<dyn LeaseReleaser>,
    ) -> Self {
        Self {
            key: key.into(),
            identity: identity.into(),
            lost,
            releaser: Some(releaser),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Token cancelled by the backend when ownership can no longer be guaranteed
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolve once the lock is lost
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Give the lock up explicitly
    pub async fn release(mut self) -> LockResult<()> {
        match self.releaser.take() {
            Some(releaser) => releaser.release().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("lost", &self.lost.is_cancelled())
            .finish()
    }
}
