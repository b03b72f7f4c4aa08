//! Postgres-backed repository.
//!
//! Queries are built at runtime (`query_as` / `QueryBuilder`) against the
//! `stackrun_tasks` and `stackrun_task_steps` tables documented on the model
//! types. Statuses and types are stored as their lowercase wire strings.

use super::{template_steps, TaskRepository};
use crate::error::{RepositoryError, RepositoryResult};
use crate::models::{
    Flow, NewTask, NewTaskStep, StateStore, StepUpdate, Task, TaskStep, TaskUpdate, TaskVariables,
};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};

const TASK_COLUMNS: &str = "task_id, org_id, project_id, env_id, task_type, status, message, \
     flow, curr_step, runner_id, step_timeout_secs, auto_approve, variables, repo_address, \
     repo_token, state_store, private_key, result, start_at, end_at, created_at";

const STEP_COLUMNS: &str = "step_id, task_id, step_index, step_type, name, args, must_approval, \
     status, approver_id, message, log_path, retry_count, start_at, end_at, created_at";

#[derive(Debug, Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct TaskRow {
    task_id: i64,
    org_id: String,
    project_id: String,
    env_id: String,
    task_type: String,
    status: String,
    message: String,
    flow: Json<Flow>,
    curr_step: i32,
    runner_id: String,
    step_timeout_secs: i64,
    auto_approve: bool,
    variables: Json<TaskVariables>,
    repo_address: String,
    repo_token: Option<String>,
    state_store: Option<Json<StateStore>>,
    private_key: Option<String>,
    result: Option<Value>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            task_id: row.task_id,
            org_id: row.org_id,
            project_id: row.project_id,
            env_id: row.env_id,
            task_type: row.task_type.parse().map_err(|reason| invalid("task_type", reason))?,
            status: row.status.parse().map_err(|reason| invalid("status", reason))?,
            message: row.message,
            flow: row.flow.0,
            curr_step: row.curr_step,
            runner_id: row.runner_id,
            step_timeout_secs: row.step_timeout_secs,
            auto_approve: row.auto_approve,
            variables: row.variables.0,
            repo_address: row.repo_address,
            repo_token: row.repo_token,
            state_store: row.state_store.map(|store| store.0),
            private_key: row.private_key,
            result: row.result,
            start_at: row.start_at,
            end_at: row.end_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TaskStepRow {
    step_id: i64,
    task_id: i64,
    step_index: i32,
    step_type: String,
    name: String,
    args: Json<Vec<String>>,
    must_approval: bool,
    status: String,
    approver_id: Option<String>,
    message: String,
    log_path: String,
    retry_count: i32,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskStepRow> for TaskStep {
    type Error = RepositoryError;

    fn try_from(row: TaskStepRow) -> Result<Self, Self::Error> {
        Ok(TaskStep {
            step_id: row.step_id,
            task_id: row.task_id,
            index: row.step_index,
            step_type: row.step_type.parse().map_err(|reason| invalid("step_type", reason))?,
            name: row.name,
            args: row.args.0,
            must_approval: row.must_approval,
            status: row.status.parse().map_err(|reason| invalid("status", reason))?,
            approver_id: row.approver_id,
            message: row.message,
            log_path: row.log_path,
            retry_count: row.retry_count,
            start_at: row.start_at,
            end_at: row.end_at,
            created_at: row.created_at,
        })
    }
}

fn invalid(field: &str, reason: String) -> RepositoryError {
    RepositoryError::InvalidRow {
        field: field.to_string(),
        reason,
    }
}

fn map_insert_error(err: sqlx::Error, step: &NewTaskStep) -> RepositoryError {
    let unique_violation = err
        .as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false);

    if unique_violation {
        RepositoryError::DuplicateStepIndex {
            task_id: step.task_id,
            index: step.index,
        }
    } else {
        RepositoryError::from(err)
    }
}

fn collect_tasks(rows: Vec<TaskRow>) -> RepositoryResult<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn collect_steps(rows: Vec<TaskStepRow>) -> RepositoryResult<Vec<TaskStep>> {
    rows.into_iter().map(TaskStep::try_from).collect()
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    #[instrument(skip(self, new_task), fields(env_id = %new_task.env_id))]
    async fn create_task(&self, new_task: NewTask) -> RepositoryResult<Task> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO stackrun_tasks (org_id, project_id, env_id, task_type, status, message, \
             flow, curr_step, runner_id, step_timeout_secs, auto_approve, variables, repo_address, \
             repo_token, state_store, private_key) \
             VALUES ($1, $2, $3, $4, 'pending', '', $5, 0, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {TASK_COLUMNS}"
        );
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(&new_task.org_id)
            .bind(&new_task.project_id)
            .bind(&new_task.env_id)
            .bind(new_task.task_type.as_str())
            .bind(Json(&new_task.flow))
            .bind(&new_task.runner_id)
            .bind(new_task.step_timeout_secs)
            .bind(new_task.auto_approve)
            .bind(Json(&new_task.variables))
            .bind(&new_task.repo_address)
            .bind(&new_task.repo_token)
            .bind(new_task.state_store.as_ref().map(Json))
            .bind(&new_task.private_key)
            .fetch_one(&mut *tx)
            .await?;
        let task = Task::try_from(row)?;

        let steps = template_steps(task.task_id, &new_task);
        if !steps.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO stackrun_task_steps \
                 (task_id, step_index, step_type, name, args, must_approval, status, log_path) ",
            );
            builder.push_values(&steps, |mut values, step| {
                values
                    .push_bind(step.task_id)
                    .push_bind(step.index)
                    .push_bind(step.step_type.as_str())
                    .push_bind(step.name.clone())
                    .push_bind(Json(step.args.clone()))
                    .push_bind(step.must_approval)
                    .push_bind("pending")
                    .push_bind(step.log_path());
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(task_id = task.task_id, steps = steps.len(), "Created task with templated steps");
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> RepositoryResult<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM stackrun_tasks WHERE task_id = $1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(RepositoryError::TaskNotFound(task_id))
            .and_then(Task::try_from)
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> RepositoryResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM stackrun_tasks WHERE status = $1 ORDER BY task_id"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        collect_tasks(rows)
    }

    async fn pending_tasks(
        &self,
        limit: usize,
        exclude_runners: &[String],
    ) -> RepositoryResult<Vec<Task>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM stackrun_tasks WHERE status = 'pending'"
        ));
        if !exclude_runners.is_empty() {
            builder
                .push(" AND NOT (runner_id = ANY(")
                .push_bind(exclude_runners.to_vec())
                .push("))");
        }
        builder
            .push(" ORDER BY task_id LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        collect_tasks(rows)
    }

    async fn active_task_runners(&self) -> RepositoryResult<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT task_id, runner_id FROM stackrun_tasks \
             WHERE status IN ('running', 'approving') ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> RepositoryResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE stackrun_tasks SET ");
        let mut fields = builder.separated(", ");
        if let Some(status) = update.status {
            fields.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(message) = &update.message {
            fields.push("message = ").push_bind_unseparated(message.clone());
        }
        if let Some(curr_step) = update.curr_step {
            fields.push("curr_step = ").push_bind_unseparated(curr_step);
        }
        if let Some(start_at) = update.start_at {
            fields.push("start_at = ").push_bind_unseparated(start_at);
        }
        if let Some(end_at) = update.end_at {
            fields.push("end_at = ").push_bind_unseparated(end_at);
        }
        if let Some(result) = &update.result {
            fields.push("result = ").push_bind_unseparated(result.clone());
        }
        builder.push(" WHERE task_id = ").push_bind(task_id);

        let outcome = builder.build().execute(&self.pool).await?;
        if outcome.rows_affected() == 0 {
            return Err(RepositoryError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn task_steps(&self, task_id: i64) -> RepositoryResult<Vec<TaskStep>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM stackrun_task_steps WHERE task_id = $1 ORDER BY step_index"
        );
        let rows: Vec<TaskStepRow> = sqlx::query_as(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        collect_steps(rows)
    }

    async fn get_step(&self, step_id: i64) -> RepositoryResult<TaskStep> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM stackrun_task_steps WHERE step_id = $1");
        let row: Option<TaskStepRow> = sqlx::query_as(&sql)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(RepositoryError::StepNotFound(step_id))
            .and_then(TaskStep::try_from)
    }

    async fn last_step(&self, task_id: i64) -> RepositoryResult<Option<TaskStep>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM stackrun_task_steps WHERE task_id = $1 \
             ORDER BY step_index DESC LIMIT 1"
        );
        let row: Option<TaskStepRow> = sqlx::query_as(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskStep::try_from).transpose()
    }

    async fn insert_step(&self, step: NewTaskStep) -> RepositoryResult<TaskStep> {
        let sql = format!(
            "INSERT INTO stackrun_task_steps \
             (task_id, step_index, step_type, name, args, must_approval, status, log_path) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7) RETURNING {STEP_COLUMNS}"
        );
        let row: TaskStepRow = sqlx::query_as(&sql)
            .bind(step.task_id)
            .bind(step.index)
            .bind(step.step_type.as_str())
            .bind(&step.name)
            .bind(Json(&step.args))
            .bind(step.must_approval)
            .bind(step.log_path())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_insert_error(err, &step))?;
        TaskStep::try_from(row)
    }

    async fn update_step(&self, step_id: i64, update: &StepUpdate) -> RepositoryResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE stackrun_task_steps SET ");
        let mut fields = builder.separated(", ");
        if let Some(status) = update.status {
            fields.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(message) = &update.message {
            fields.push("message = ").push_bind_unseparated(message.clone());
        }
        if let Some(approver_id) = &update.approver_id {
            fields.push("approver_id = ").push_bind_unseparated(approver_id.clone());
        }
        if let Some(start_at) = update.start_at {
            fields.push("start_at = ").push_bind_unseparated(start_at);
        }
        if let Some(end_at) = update.end_at {
            fields.push("end_at = ").push_bind_unseparated(end_at);
        }
        if let Some(retry_count) = update.retry_count {
            fields.push("retry_count = ").push_bind_unseparated(retry_count);
        }
        builder.push(" WHERE step_id = ").push_bind(step_id);

        let outcome = builder.build().execute(&self.pool).await?;
        if outcome.rows_affected() == 0 {
            return Err(RepositoryError::StepNotFound(step_id));
        }
        Ok(())
    }
}
