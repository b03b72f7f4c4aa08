//! # Task/Step Repository
//!
//! The persisted task and step rows are the single source of truth for the
//! scheduler. Every component receives a repository handle explicitly; nothing
//! reaches into global database state.
//!
//! Updates are partial (`TaskUpdate` / `StepUpdate`) so the executor never
//! overwrites fields owned by other writers, such as the approver recorded on a
//! step by the approval layer.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTaskRepository;
pub use postgres::PgTaskRepository;

use crate::error::RepositoryResult;
use crate::models::{NewTask, NewTaskStep, StepUpdate, Task, TaskStep, TaskUpdate};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a task and one step row per flow template, in a single batch
    async fn create_task(&self, new_task: NewTask) -> RepositoryResult<Task>;

    async fn get_task(&self, task_id: i64) -> RepositoryResult<Task>;

    /// All tasks in the given status, ordered by id
    async fn tasks_by_status(&self, status: TaskStatus) -> RepositoryResult<Vec<Task>>;

    /// Up to `limit` pending tasks ordered by id, skipping tasks pinned to an excluded runner
    async fn pending_tasks(
        &self,
        limit: usize,
        exclude_runners: &[String],
    ) -> RepositoryResult<Vec<Task>>;

    /// `(task_id, runner_id)` for every task currently holding a runner slot
    async fn active_task_runners(&self) -> RepositoryResult<Vec<(i64, String)>>;

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> RepositoryResult<()>;

    /// The task's steps ordered by index
    async fn task_steps(&self, task_id: i64) -> RepositoryResult<Vec<TaskStep>>;

    async fn get_step(&self, step_id: i64) -> RepositoryResult<TaskStep>;

    /// The task's highest-index step, if any
    async fn last_step(&self, task_id: i64) -> RepositoryResult<Option<TaskStep>>;

    async fn insert_step(&self, step: NewTaskStep) -> RepositoryResult<TaskStep>;

    async fn update_step(&self, step_id: i64, update: &StepUpdate) -> RepositoryResult<()>;
}

/// Build the templated step rows for a freshly created task
pub(crate) fn template_steps(task_id: i64, new_task: &NewTask) -> Vec<NewTaskStep> {
    new_task
        .flow
        .steps
        .iter()
        .enumerate()
        .map(|(index, template)| NewTaskStep {
            task_id,
            index: index as i32,
            step_type: template.step_type,
            name: template.name.clone(),
            args: template.args.clone(),
            must_approval: template.requires_approval(),
        })
        .collect()
}
