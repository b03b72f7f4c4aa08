//! # Orchestration
//!
//! The scheduling core, leaves first:
//!
//! - [`StepRunner`]: approval gate, start on the runner, status stream with
//!   deadline and reconnects, terminal persistence.
//! - [`TaskExecutor`]: one task through its ordered steps, resuming at the
//!   persisted current step.
//! - [`PostStepDispatcher`]: callback and collect steps after the main
//!   sequence ends.
//! - [`TaskScheduler`]: recovery plus the dispatch tick bounded by the
//!   per-runner cap.
//! - [`SchedulerCoordinator`]: leader election wrapped around the scheduler.
//!
//! All collaborators are injected through [`SchedulerContext`].

pub mod coordinator;
pub mod post_step;
pub mod run_context;
pub mod scheduler;
pub mod step_runner;
pub mod task_executor;

pub use coordinator::{CoordinatorHandle, SchedulerCoordinator};
pub use post_step::{FlowOutcome, PostStepDispatcher};
pub use run_context::{RunContext, RunContextResolver, TaskRecordResolver};
pub use scheduler::TaskScheduler;
pub use step_runner::StepRunner;
pub use task_executor::{TaskExecutor, TaskOutcome};

use crate::config::SchedulerConfig;
use crate::repository::TaskRepository;
use crate::runner::RunnerClient;
use crate::storage::LogStorage;
use std::fmt;
use std::sync::Arc;

/// Shared handles every orchestration component works through
#[derive(Clone)]
pub struct SchedulerContext {
    pub repository: Arc<dyn TaskRepository>,
    pub runner_client: Arc<dyn RunnerClient>,
    pub resolver: Arc<dyn RunContextResolver>,
    pub storage: Arc<dyn LogStorage>,
    pub config: SchedulerConfig,
}

impl SchedulerContext {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        runner_client: Arc<dyn RunnerClient>,
        resolver: Arc<dyn RunContextResolver>,
        storage: Arc<dyn LogStorage>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            runner_client,
            resolver,
            storage,
            config,
        }
    }
}

impl fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
