//! Process-local lock with the same contract as the Postgres lock.
//!
//! Several schedulers in one process (or one test) can share an
//! `InMemoryLock` to model competing scheduler processes. `revoke` simulates
//! a lost lease.

use super::{DistributedLock, LeaseReleaser, LockLease};
use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Holder {
    identity: String,
    epoch: u64,
    lost: CancellationToken,
}

#[derive(Debug, Default)]
struct LockTable {
    holders: DashMap<String, Holder>,
    released: Notify,
    epochs: AtomicU64,
}

impl LockTable {
    fn remove_epoch(&self, key: &str, epoch: u64) {
        if self
            .holders
            .remove_if(key, |_, holder| holder.epoch == epoch)
            .is_some()
        {
            self.released.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLock {
    table: Arc<LockTable>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity currently holding `key`
    pub fn holder(&self, key: &str) -> Option<String> {
        self.table
            .holders
            .get(key)
            .map(|holder| holder.identity.clone())
    }

    /// Take the lock away from its holder, firing the holder's lost signal
    pub fn revoke(&self, key: &str) -> bool {
        match self.table.holders.remove(key) {
            Some((_, holder)) => {
                debug!(key = %key, identity = %holder.identity, "Revoking lock");
                holder.lost.cancel();
                self.table.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    fn try_claim(&self, key: &str, identity: &str) -> Option<(u64, CancellationToken)> {
        match self.table.holders.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let epoch = self.table.epochs.fetch_add(1, Ordering::SeqCst);
                let lost = CancellationToken::new();
                vacant.insert(Holder {
                    identity: identity.to_string(),
                    epoch,
                    lost: lost.clone(),
                });
                Some((epoch, lost))
            }
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(
        &self,
        key: &str,
        identity: &str,
        cancel: &CancellationToken,
    ) -> LockResult<LockLease> {
        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(LockError::Canceled {
                    key: key.to_string(),
                });
            }

            if let Some((epoch, lost)) = self.try_claim(key, identity) {
                let releaser = MemoryReleaser {
                    table: Arc::clone(&self.table),
                    key: key.to_string(),
                    epoch,
                };
                return Ok(LockLease::new(key, identity, lost, Box::new(releaser)));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LockError::Canceled { key: key.to_string() });
                }
                _ = &mut released => {}
            }
        }
    }
}

struct MemoryReleaser {
    table: Arc<LockTable>,
    key: String,
    epoch: u64,
}

#[async_trait]
impl LeaseReleaser for MemoryReleaser {
    async fn release(self: Box<Self>) -> LockResult<()> {
        // Drop does the work
        Ok(())
    }
}

impl Drop for MemoryReleaser {
    fn drop(&mut self) {
        self.table.remove_epoch(&self.key, self.epoch);
    }
}
