//! Shared constants: reserved step indices, default tunables, and the
//! deterministic artifact paths used by the log/artifact store.

/// Index reserved for the synthetic collect step appended to apply/destroy tasks
pub const COLLECT_STEP_INDEX: i32 = 999;

/// Remote container states accepted as terminal when a runner reports `exited`
pub const RECOGNIZED_EXIT_STATES: &[&str] = &["exited", "complete", "failed", "timeout", "dead"];

pub mod defaults {
    pub const TICK_INTERVAL_MS: u64 = 1_000;
    pub const PENDING_BATCH_SIZE: usize = 64;
    pub const MAX_TASKS_PER_RUNNER: usize = 4;
    pub const APPROVAL_POLL_INTERVAL_MS: u64 = 5_000;
    pub const STATUS_RETRY_BACKOFF_MS: u64 = 10_000;
    pub const STEP_TIMEOUT_SECS: u64 = 3_600;

    pub const LOCK_KEY: &str = "stackrun-task-scheduler";
    pub const LOCK_RETRY_BACKOFF_MS: u64 = 5_000;
    pub const LOCK_HEARTBEAT_INTERVAL_MS: u64 = 3_000;

    pub const RUNNER_REQUEST_TIMEOUT_MS: u64 = 30_000;

    pub const STORAGE_ROOT_DIR: &str = "var/logs";
    pub const MAX_CONTENT_BYTES: usize = 1024 * 1024;

    pub const DATABASE_URL: &str = "postgresql://localhost/stackrun_development";
    pub const DATABASE_MAX_CONNECTIONS: u32 = 10;
}

pub mod paths {
    pub fn step_log(task_id: i64, step_index: i32) -> String {
        format!("{task_id}/step{step_index}/log.txt")
    }

    pub fn tf_state(task_id: i64) -> String {
        format!("{task_id}/tfstate.json")
    }

    pub fn tf_plan(task_id: i64) -> String {
        format!("{task_id}/tfplan.json")
    }

    pub fn state_list(task_id: i64) -> String {
        format!("{task_id}/state_list.txt")
    }
}
