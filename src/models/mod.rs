pub mod task;
pub mod task_step;

pub use task::{
    Flow, NewTask, StateStore, StepTemplate, Task, TaskType, TaskUpdate, TaskVariables,
};
pub use task_step::{NewTaskStep, StepType, StepUpdate, TaskStep};
