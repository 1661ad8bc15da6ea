//! agentd-cron: time-based triggers for agent work.
//!
//! [`next_run`] turns a schedule string into the next firing instant;
//! [`SchedulerService`] keeps one timer per active scheduled task and fires
//! them without ever overlapping two scheduled actions.

pub mod next_run;
pub mod scheduler;

use agentd_storage::StorageError;
use agentd_types::ScheduleType;

pub use next_run::{Schedule, next_run_time};
pub use scheduler::SchedulerService;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    Validation(String),
    #[error("next run calculation failed for {kind} schedule {schedule:?}")]
    NextRunFailed { kind: ScheduleType, schedule: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
