//! Leadership wrapper around the scheduler.
//!
//! `SchedulerCoordinator::start(identity)` is the host entrypoint. It loops
//! forever: acquire the leader lock, run a fresh [`TaskScheduler`] under an
//! epoch token, and tear the epoch down when the lease is lost or the host
//! shuts down. The epoch token is a child of the shutdown token, so shutdown
//! reaches every fiber of the current epoch.

use super::{SchedulerContext, TaskScheduler};
use crate::config::LeaderConfig;
use crate::error::{LockError, SchedulerError, SchedulerResult};
use crate::leader::DistributedLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub struct SchedulerCoordinator {
    ctx: Arc<SchedulerContext>,
    lock: Arc<dyn DistributedLock>,
    leader: LeaderConfig,
}

impl SchedulerCoordinator {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        lock: Arc<dyn DistributedLock>,
        leader: LeaderConfig,
    ) -> Self {
        Self { ctx, lock, leader }
    }

    /// Spawn the coordinator loop for this process
    pub fn start(self, identity: impl Into<String>) -> CoordinatorHandle {
        let identity = identity.into();
        let shutdown = CancellationToken::new();
        let is_leader = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn(self.run(
            identity.clone(),
            shutdown.clone(),
            Arc::clone(&is_leader),
        ));

        CoordinatorHandle {
            identity,
            shutdown,
            is_leader,
            join,
        }
    }

    #[instrument(skip(self, shutdown, is_leader))]
    async fn run(self, identity: String, shutdown: CancellationToken, is_leader: Arc<AtomicBool>) {
        info!(lock_key = %self.leader.lock_key, "Scheduler coordinator started");

        loop {
            let lease = match self
                .lock
                .acquire(&self.leader.lock_key, &identity, &shutdown)
                .await
            {
                Ok(lease) => lease,
                Err(LockError::Canceled { .. }) => break,
                Err(err) => {
                    warn!(error = %err, "Leader lock acquisition failed; retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.leader.retry_backoff()) => continue,
                    }
                }
            };

            info!("Acquired leadership");
            is_leader.store(true, Ordering::SeqCst);

            let epoch = shutdown.child_token();
            let scheduler = TaskScheduler::new(Arc::clone(&self.ctx));
            let run = scheduler.run(epoch.clone());
            tokio::pin!(run);

            tokio::select! {
                _ = &mut run => {}
                _ = lease.lost() => {
                    warn!("Leadership lost; canceling epoch");
                    epoch.cancel();
                    (&mut run).await;
                }
            }

            is_leader.store(false, Ordering::SeqCst);
            if let Err(err) = lease.release().await {
                warn!(error = %err, "Failed to release leader lock");
            }
            info!("Leadership epoch ended");

            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("Scheduler coordinator stopped");
    }
}

/// Handle to a running coordinator
#[derive(Debug)]
pub struct CoordinatorHandle {
    identity: String,
    shutdown: CancellationToken,
    is_leader: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this process currently holds the leader lock
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Cancel every epoch fiber and wait for the coordinator to finish draining
    pub async fn shutdown(self) -> SchedulerResult<()> {
        info!(identity = %self.identity, "Shutting down scheduler coordinator");
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|err| SchedulerError::Internal(format!("coordinator task failed: {err}")))
    }
}
