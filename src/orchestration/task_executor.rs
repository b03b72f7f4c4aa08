//! # Task Executor
//!
//! One fiber per task. The executor marks the task running, resolves the
//! run request, then walks the task's steps in index order starting at the
//! persisted `curr_step`. `curr_step` is written before each step is
//! attempted, so a recovered task resumes exactly where the previous leader
//! stopped and never re-invokes lower steps.
//!
//! Step failures are terminal for the task; there is no whole-task retry. A
//! rejected approval ends the task as `rejected`, not `failed`. Cancellation
//! returns without persisting anything terminal. Any other error that escapes
//! the run (a repository failure mid-task, for instance) is persisted as a
//! task failure before the fiber exits.

use super::{FlowOutcome, PostStepDispatcher, RunContext, SchedulerContext, StepRunner};
use crate::error::SchedulerResult;
use crate::logging::log_task_operation;
use crate::models::{Task, TaskStep, TaskUpdate};
use crate::state_machine::{task_state_machine, TaskEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How one executor run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Complete,
    Failed(String),
    Rejected,
    /// The leadership epoch ended; the task is left for the next leader
    Canceled,
}

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    ctx: Arc<SchedulerContext>,
    step_runner: StepRunner,
    post_steps: PostStepDispatcher,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            step_runner: StepRunner::new(Arc::clone(&ctx)),
            post_steps: PostStepDispatcher::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    #[instrument(skip(self, cancel))]
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        task_id: i64,
    ) -> SchedulerResult<TaskOutcome> {
        let mut task = self.ctx.repository.get_task(task_id).await?;

        match self.drive(&cancel, &mut task).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = format!("task failed: {err}");
                error!(error = %err, "Task execution aborted");
                if let Err(persist_err) = self
                    .finish(&mut task, TaskEvent::Fail(message.clone()), &message)
                    .await
                {
                    error!(error = %persist_err, "Failed to persist task failure");
                    return Err(err);
                }
                Ok(TaskOutcome::Failed(message))
            }
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
    ) -> SchedulerResult<TaskOutcome> {
        let repo = &self.ctx.repository;
        let task_id = task.task_id;

        let status = task_state_machine::determine_target_state(task.status, &TaskEvent::Start)?;
        let mut start = TaskUpdate::status(status).with_message("");
        if task.start_at.is_none() {
            start = start.with_start_at(Utc::now());
        }
        repo.update_task(task_id, &start).await?;
        start.apply(task);
        log_task_operation(
            "start",
            task_id,
            &task.runner_id,
            status.as_str(),
            Some(&format!("resume_at_step={}", task.curr_step)),
        );

        let run_ctx = match self.ctx.resolver.resolve(task).await {
            Ok(run_ctx) => run_ctx,
            Err(err) => {
                let message = format!("failed to build run request: {err}");
                self.finish(task, TaskEvent::Fail(message.clone()), &message)
                    .await?;
                return Ok(TaskOutcome::Failed(message));
            }
        };

        let steps = repo.task_steps(task_id).await?;
        let outcome = self.run_steps(cancel, task, &steps, &run_ctx).await?;

        let flow_outcome = match &outcome {
            TaskOutcome::Canceled => return Ok(outcome),
            TaskOutcome::Complete => FlowOutcome::Succeeded,
            TaskOutcome::Failed(_) => FlowOutcome::Failed,
            TaskOutcome::Rejected => FlowOutcome::Rejected,
        };
        self.post_steps
            .dispatch(cancel, task, &run_ctx, flow_outcome)
            .await;

        Ok(outcome)
    }

    async fn run_steps(
        &self,
        cancel: &CancellationToken,
        task: &mut Task,
        steps: &[TaskStep],
        run_ctx: &RunContext,
    ) -> SchedulerResult<TaskOutcome> {
        let resume_at = task.curr_step;
        let pipeline = steps
            .iter()
            .filter(|step| !step.step_type.is_post_step() && step.index >= resume_at);

        for step in pipeline {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Canceled);
            }

            let progress = TaskUpdate::curr_step(step.index);
            self.ctx
                .repository
                .update_task(task.task_id, &progress)
                .await?;
            progress.apply(task);

            let err = match self.step_runner.run_step(cancel, task, step, run_ctx).await {
                Ok(()) => continue,
                Err(err) => err,
            };

            if err.is_cancellation() {
                info!(step_index = step.index, "Task execution canceled");
                return Ok(TaskOutcome::Canceled);
            }
            if err.is_rejection() {
                self.finish(task, TaskEvent::Reject, &err.to_string())
                    .await?;
                info!(step_index = step.index, "Task aborted by approval rejection");
                return Ok(TaskOutcome::Rejected);
            }

            let message = format!("task failed: {err}");
            warn!(step_index = step.index, error = %err, "Task failed");
            self.finish(task, TaskEvent::Fail(message.clone()), &message)
                .await?;
            return Ok(TaskOutcome::Failed(message));
        }

        self.finish(task, TaskEvent::Complete, "").await?;
        Ok(TaskOutcome::Complete)
    }

    /// Persist a terminal task status, validated against the stored status
    async fn finish(&self, task: &mut Task, event: TaskEvent, message: &str) -> SchedulerResult<()> {
        let repo = &self.ctx.repository;
        let current = repo.get_task(task.task_id).await?.status;
        let status = task_state_machine::determine_target_state(current, &event)?;

        let update = TaskUpdate::status(status)
            .with_message(message)
            .with_end_at(Utc::now());
        repo.update_task(task.task_id, &update).await?;
        update.apply(task);

        log_task_operation(
            "finish",
            task.task_id,
            &task.runner_id,
            status.as_str(),
            (!message.is_empty()).then_some(message),
        );
        Ok(())
    }
}
