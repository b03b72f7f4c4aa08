//! Leader lock backed by a Postgres session-level advisory lock.
//!
//! Each lease owns a dedicated connection detached from the pool, because a
//! session advisory lock lives exactly as long as the session that took it.
//! A keeper task heartbeats that connection; if the heartbeat fails the
//! session (and with it the lock) must be presumed gone, so the lease's lost
//! signal fires.
//!
//! ```sql
//! SELECT pg_try_advisory_lock(hashtext('stackrun-task-scheduler')::bigint)
//! ```

use super::{DistributedLock, LeaseReleaser, LockLease};
use crate::config::LeaderConfig;
use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
    retry_backoff: Duration,
    heartbeat_interval: Duration,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool, retry_backoff: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            pool,
            retry_backoff,
            heartbeat_interval,
        }
    }

    pub fn from_config(pool: PgPool, config: &LeaderConfig) -> Self {
        Self::new(pool, config.retry_backoff(), config.heartbeat_interval())
    }

    async fn session(&self, identity: &str) -> LockResult<PgConnection> {
        let mut conn = self.pool.acquire().await?.detach();
        sqlx::query("SELECT set_config('application_name', $1, false)")
            .bind(identity)
            .execute(&mut conn)
            .await?;
        Ok(conn)
    }

    async fn try_lock(conn: &mut PgConnection, key: &str) -> LockResult<bool> {
        let acquired =
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
                .bind(key)
                .fetch_one(conn)
                .await?;
        Ok(acquired)
    }
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
    #[instrument(skip(self, cancel), fields(key = %key, identity = %identity))]
    async fn acquire(
        &self,
        key: &str,
        identity: &str,
        cancel: &CancellationToken,
    ) -> LockResult<LockLease> {
        let mut session: Option<PgConnection> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Canceled {
                    key: key.to_string(),
                });
            }

            if session.is_none() {
                match self.session(identity).await {
                    Ok(conn) => session = Some(conn),
                    Err(err) => warn!(error = %err, "Failed to open lock session"),
                }
            }

            if let Some(conn) = session.as_mut() {
                match Self::try_lock(conn, key).await {
                    Ok(true) => {
                        if let Some(conn) = session.take() {
                            info!("Acquired leader lock");
                            return Ok(self.lease(conn, key, identity));
                        }
                    }
                    Ok(false) => debug!("Leader lock held by another instance"),
                    Err(err) => {
                        warn!(error = %err, "Leader lock attempt failed; reopening session");
                        session = None;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LockError::Canceled { key: key.to_string() });
                }
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }
}

impl PgAdvisoryLock {
    fn lease(&self, conn: PgConnection, key: &str, identity: &str) -> LockLease {
        let lost = CancellationToken::new();
        let (release_tx, release_rx) = oneshot::channel();
        let keeper = tokio::spawn(keep_lock(
            conn,
            key.to_string(),
            self.heartbeat_interval,
            lost.clone(),
            release_rx,
        ));
        LockLease::new(
            key,
            identity,
            lost,
            Box::new(PgReleaser { release_tx, keeper }),
        )
    }
}

/// Heartbeat the lock session until released or the session fails
async fn keep_lock(
    mut conn: PgConnection,
    key: String,
    heartbeat_interval: Duration,
    lost: CancellationToken,
    mut release_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Fires on explicit release and when the lease is dropped
            _ = &mut release_rx => break,
            _ = ticker.tick() => {
                if let Err(err) = sqlx::query("SELECT 1").execute(&mut conn).await {
                    error!(key = %key, error = %err, "Leader lock session lost");
                    lost.cancel();
                    return;
                }
            }
        }
    }

    let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
        .bind(&key)
        .execute(&mut conn)
        .await;
    if let Err(err) = unlocked {
        warn!(key = %key, error = %err, "Failed to unlock leader lock; closing session");
    }
    if let Err(err) = conn.close().await {
        debug!(key = %key, error = %err, "Lock session close failed");
    }
    lost.cancel();
    info!(key = %key, "Released leader lock");
}

struct PgReleaser {
    release_tx: oneshot::Sender<()>,
    keeper: JoinHandle<()>,
}

#[async_trait]
impl LeaseReleaser for PgReleaser {
    async fn release(self: Box<Self>) -> LockResult<()> {
        let PgReleaser { release_tx, keeper } = *self;
        // The keeper may already have exited after a lost session
        let _ = release_tx.send(());
        keeper
            .await
            .map_err(|err| LockError::Backend(format!("lock keeper task failed: {err}")))
    }
}
