#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Stackrun Core
//!
//! Distributed task scheduler for infrastructure-as-code pipelines.
//!
//! ## Overview
//!
//! A task is one plan, apply, or destroy run against an environment. It is a
//! persisted sequence of steps (init, plan, apply, play, ...) that execute in
//! strict order on a remote runner. Several scheduler processes may run at
//! once; a distributed lock elects one leader, and only the leader dispatches.
//!
//! ## Architecture
//!
//! ```text
//! SchedulerCoordinator ── leader lock ──▶ TaskScheduler (tick)
//!                                             │ one fiber per task
//!                                             ▼
//!                                        TaskExecutor ──▶ StepRunner ──▶ runner
//!                                             │
//!                                             ▼
//!                                     PostStepDispatcher (callbacks, collect)
//! ```
//!
//! Every component receives its collaborators explicitly through
//! [`orchestration::SchedulerContext`]: the task repository, the runner
//! client, the run-request resolver, and the log store.
//!
//! ## Module Organization
//!
//! - [`models`] - Task and step records
//! - [`state_machine`] - Task and step statuses and transitions
//! - [`repository`] - Task/step persistence (Postgres and in-memory)
//! - [`runner`] - Runner transport (HTTP) and runner directory
//! - [`storage`] - Log and artifact store
//! - [`leader`] - Distributed lock for leader election
//! - [`orchestration`] - Scheduler, executor, step runner, post-step dispatch
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stackrun_core::config::StackrunConfig;
//! use stackrun_core::leader::PgAdvisoryLock;
//! use stackrun_core::orchestration::{SchedulerContext, SchedulerCoordinator, TaskRecordResolver};
//! use stackrun_core::repository::PgTaskRepository;
//! use stackrun_core::runner::{HttpRunnerClient, StaticRunnerDirectory};
//! use stackrun_core::storage::FsLogStorage;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let config = StackrunConfig::load()?;
//! let directory = Arc::new(StaticRunnerDirectory::from_config(&config.runner));
//! let ctx = Arc::new(SchedulerContext::new(
//!     Arc::new(PgTaskRepository::new(pool.clone())),
//!     Arc::new(HttpRunnerClient::new(config.runner.request_timeout())?),
//!     Arc::new(TaskRecordResolver::new(directory)),
//!     Arc::new(FsLogStorage::from_config(&config.storage)),
//!     config.scheduler.clone(),
//! ));
//! let lock = Arc::new(PgAdvisoryLock::from_config(pool, &config.leader));
//!
//! let handle = SchedulerCoordinator::new(ctx, lock, config.leader.clone()).start("scheduler-1");
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod leader;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod repository;
pub mod runner;
pub mod state_machine;
pub mod storage;

pub use config::StackrunConfig;
pub use constants::COLLECT_STEP_INDEX;
pub use error::{
    LockError, RepositoryError, RunnerError, SchedulerError, SchedulerResult, StepError,
    StorageError,
};
pub use leader::{DistributedLock, InMemoryLock, LockLease, PgAdvisoryLock};
pub use models::{
    Flow, NewTask, NewTaskStep, StepTemplate, StepType, StepUpdate, Task, TaskStep, TaskType,
    TaskUpdate,
};
pub use orchestration::{
    CoordinatorHandle, PostStepDispatcher, RunContext, RunContextResolver, SchedulerContext,
    SchedulerCoordinator, StepRunner, TaskExecutor, TaskOutcome, TaskRecordResolver,
    TaskScheduler,
};
pub use repository::{InMemoryTaskRepository, PgTaskRepository, TaskRepository};
pub use runner::{HttpRunnerClient, RunnerClient, RunnerDirectory, StaticRunnerDirectory};
pub use state_machine::{StepStatus, TaskStatus};
pub use storage::{FsLogStorage, InMemoryLogStorage, LogStorage};
