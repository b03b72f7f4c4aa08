//! # Task Scheduler
//!
//! The leader's dispatch loop. It ticks at a fixed interval:
//!
//! 0. Resume active tasks with no local fiber (orphans of a previous leader
//!    or of a fiber that failed to persist its outcome).
//! 1. Count runner slots from active task rows plus this process's in-flight
//!    fibers.
//! 2. Query a bounded batch of pending tasks, excluding saturated runners.
//! 3. Re-check each candidate against the live count and spawn its fiber.
//!
//! The per-runner count is rebuilt every tick and is advisory: a single-tick
//! overshoot is tolerated. Tasks already in flight locally are never
//! dispatched twice, even if their row still reads `pending`.
//!
//! When the epoch token is cancelled the loop stops ticking and waits for
//! every fiber it spawned to return.

use super::{SchedulerContext, TaskExecutor};
use crate::error::SchedulerResult;
use crate::state_machine::TaskStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct TaskScheduler {
    ctx: Arc<SchedulerContext>,
    executor: Arc<TaskExecutor>,
    /// task id to runner id for every fiber spawned by this scheduler
    in_flight: Arc<DashMap<i64, String>>,
    tracker: TaskTracker,
    scheduler_id: Uuid,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("scheduler_id", &self.scheduler_id)
            .field("in_flight", &self.in_flight.len())
            .field("config", &self.ctx.config)
            .finish()
    }
}

impl TaskScheduler {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            executor: Arc::new(TaskExecutor::new(Arc::clone(&ctx))),
            ctx,
            in_flight: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            scheduler_id: Uuid::new_v4(),
        }
    }

    pub fn scheduler_id(&self) -> Uuid {
        self.scheduler_id
    }

    /// Number of task fibers currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, task_id: i64) -> bool {
        self.in_flight.contains_key(&task_id)
    }

    /// Recover, then tick until `cancel` fires; returns after all fibers drain
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            scheduler_id = %self.scheduler_id,
            tick_interval_ms = self.ctx.config.tick_interval_ms,
            max_tasks_per_runner = self.ctx.config.max_tasks_per_runner,
            "Starting task scheduler"
        );

        let mut recovered = false;
        let mut ticker = interval(self.ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Active rows with no local fiber are orphans: left by a previous
            // leader, or by a fiber that could not persist its outcome
            match self.recover(&cancel).await {
                Ok(0) if recovered => {}
                Ok(count) => {
                    recovered = true;
                    info!(scheduler_id = %self.scheduler_id, recovered = count, "Resumed active tasks");
                }
                Err(err) => {
                    error!(scheduler_id = %self.scheduler_id, error = %err, "Task recovery failed; retrying next tick");
                    if !recovered {
                        continue;
                    }
                }
            }

            match self.tick(&cancel).await {
                Ok(0) => debug!(scheduler_id = %self.scheduler_id, "No tasks dispatched this tick"),
                Ok(dispatched) => info!(scheduler_id = %self.scheduler_id, dispatched, "Dispatched pending tasks"),
                Err(err) => warn!(scheduler_id = %self.scheduler_id, error = %err, "Scheduling tick failed"),
            }
        }

        self.drain().await;
    }

    /// Resume every active task that has no fiber in this process.
    ///
    /// Runs before every tick. Tasks already in flight are skipped, so the
    /// sweep only picks up rows a previous leader left active or whose fiber
    /// exited without persisting a terminal status.
    pub async fn recover(&self, cancel: &CancellationToken) -> SchedulerResult<usize> {
        let mut recovered = 0;
        for status in [TaskStatus::Running, TaskStatus::Approving] {
            for task in self.ctx.repository.tasks_by_status(status).await? {
                if self.spawn(cancel, task.task_id, task.runner_id) {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// One scheduling pass; returns the number of fibers spawned
    pub async fn tick(&self, cancel: &CancellationToken) -> SchedulerResult<usize> {
        let cap = self.ctx.config.max_tasks_per_runner;
        let mut load = self.runner_load().await?;
        let saturated: Vec<String> = load
            .iter()
            .filter(|(_, count)| **count >= cap)
            .map(|(runner_id, _)| runner_id.clone())
            .collect();

        let candidates = self
            .ctx
            .repository
            .pending_tasks(self.ctx.config.pending_batch_size, &saturated)
            .await?;

        let mut dispatched = 0;
        for task in candidates {
            if cancel.is_cancelled() {
                break;
            }
            if self.is_in_flight(task.task_id) {
                continue;
            }

            let count = load.entry(task.runner_id.clone()).or_insert(0);
            if *count >= cap {
                debug!(
                    task_id = task.task_id,
                    runner_id = %task.runner_id,
                    "Runner saturated; deferring task"
                );
                continue;
            }
            if self.spawn(cancel, task.task_id, task.runner_id) {
                *count += 1;
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Stop accepting fibers and wait for the running ones to return
    pub async fn drain(&self) {
        info!(
            scheduler_id = %self.scheduler_id,
            in_flight = self.in_flight.len(),
            "Draining task fibers"
        );
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn runner_load(&self) -> SchedulerResult<HashMap<String, usize>> {
        let mut slots: HashMap<i64, String> = self
            .ctx
            .repository
            .active_task_runners()
            .await?
            .into_iter()
            .collect();
        for entry in self.in_flight.iter() {
            slots.insert(*entry.key(), entry.value().clone());
        }

        let mut load = HashMap::new();
        for runner_id in slots.into_values() {
            *load.entry(runner_id).or_insert(0) += 1;
        }
        Ok(load)
    }

    fn spawn(&self, cancel: &CancellationToken, task_id: i64, runner_id: String) -> bool {
        match self.in_flight.entry(task_id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(runner_id);
            }
        }

        let executor = Arc::clone(&self.executor);
        let in_flight = Arc::clone(&self.in_flight);
        let cancel = cancel.clone();
        self.tracker.spawn(async move {
            let result = AssertUnwindSafe(executor.execute(cancel, task_id))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(outcome)) => debug!(task_id, ?outcome, "Task fiber finished"),
                Ok(Err(err)) => error!(task_id, error = %err, "Task execution aborted"),
                Err(_) => error!(task_id, "Task fiber panicked"),
            }
            in_flight.remove(&task_id);
        });
        true
    }
}
