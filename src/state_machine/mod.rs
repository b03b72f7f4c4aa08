//! Task and step state machines.
//!
//! Statuses are closed enums persisted as lowercase strings. Transition
//! functions are pure: callers validate an event against the current status
//! before persisting the resulting status through the repository.

pub mod events;
pub mod states;
pub mod step_state_machine;
pub mod task_state_machine;

pub use events::{StepEvent, TaskEvent};
pub use states::{StepStatus, TaskStatus};
