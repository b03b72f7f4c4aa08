//! Post-step actions run once after the main step sequence ends.
//!
//! The flow's `on_success` or `on_fail` callback is appended one index past
//! the task's highest step; effect-producing tasks (apply/destroy) then get a
//! synthetic collect step at [`COLLECT_STEP_INDEX`], or past the highest step
//! if the flow already reaches that index. Rejected flows trigger neither.
//! Everything here is best-effort: failures are logged and never change the
//! task's already-persisted outcome.

use super::{RunContext, SchedulerContext, StepRunner};
use crate::constants::COLLECT_STEP_INDEX;
use crate::error::SchedulerResult;
use crate::models::{NewTaskStep, StepTemplate, StepType, Task, TaskUpdate};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// How the main step sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Succeeded,
    Failed,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PostStepDispatcher {
    ctx: Arc<SchedulerContext>,
    step_runner: StepRunner,
}

impl PostStepDispatcher {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            step_runner: StepRunner::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    #[instrument(skip_all, fields(task_id = task.task_id, outcome = ?outcome))]
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        run_ctx: &RunContext,
        outcome: FlowOutcome,
    ) {
        let callback = match outcome {
            FlowOutcome::Succeeded => task
                .flow
                .on_success
                .as_ref()
                .map(|template| (StepType::OnSuccess, template)),
            FlowOutcome::Failed => task
                .flow
                .on_fail
                .as_ref()
                .map(|template| (StepType::OnFail, template)),
            FlowOutcome::Rejected => None,
        };

        if let Some((step_type, template)) = callback {
            if let Err(err) = self
                .run_appended(cancel, task, run_ctx, step_type, Some(template), 0)
                .await
            {
                warn!(step_type = %step_type, error = %err, "Callback step failed");
            }
        }

        if task.task_type.is_effectful() && outcome != FlowOutcome::Rejected {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self
                .run_appended(
                    cancel,
                    task,
                    run_ctx,
                    StepType::Collect,
                    None,
                    COLLECT_STEP_INDEX,
                )
                .await
            {
                warn!(error = %err, "Collect step failed");
            }
        }
    }

    /// Append a step one past the task's highest index, but never below
    /// `min_index`, and run it
    async fn run_appended(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        run_ctx: &RunContext,
        step_type: StepType,
        template: Option<&StepTemplate>,
        min_index: i32,
    ) -> SchedulerResult<()> {
        let repo = &self.ctx.repository;
        let next = repo
            .last_step(task.task_id)
            .await?
            .map_or(0, |last| last.index + 1);
        let index = next.max(min_index);

        let step = repo
            .insert_step(NewTaskStep {
                task_id: task.task_id,
                index,
                step_type,
                name: template
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| step_type.to_string()),
                args: template.map(|t| t.args.clone()).unwrap_or_default(),
                must_approval: false,
            })
            .await?;
        info!(step_index = index, step_type = %step_type, "Appended post step");

        repo.update_task(task.task_id, &TaskUpdate::curr_step(index))
            .await?;
        self.step_runner
            .run_step(cancel, task, &step, run_ctx)
            .await?;
        Ok(())
    }
}
