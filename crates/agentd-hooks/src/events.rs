//! Hook event types.

use serde::{Deserialize, Serialize};

use agentd_types::{AgentStateSnapshot, AgentTask, ScheduledTask};

/// Events that hooks can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    /// The agent switched between idle and busy.
    AgentStateChanged { state: AgentStateSnapshot },
    /// A task was appended to the queue.
    TaskQueued { task: AgentTask },
    /// A task was handed to the dispatcher.
    TaskStarted { task: AgentTask },
    /// A task reported success.
    TaskCompleted { task: AgentTask },
    /// A task reported failure.
    TaskFailed { task: AgentTask },
    /// A scheduled task passed its guards and ran.
    ScheduleFired { task: ScheduledTask },
    /// A scheduled firing was skipped because the agent or scheduler was busy.
    ScheduleSkipped { task: ScheduledTask, reason: String },
    /// A scheduled task was moved to the error state.
    ScheduleFailed { schedule_id: String, reason: String },
}

/// Payload-free discriminant of [`HookEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStateChanged,
    TaskQueued,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    ScheduleFired,
    ScheduleSkipped,
    ScheduleFailed,
}

impl EventKind {
    /// Every queue lifecycle event.
    pub const TASKS: [EventKind; 4] = [
        EventKind::TaskQueued,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
    ];

    /// Every scheduler event.
    pub const SCHEDULES: [EventKind; 3] = [
        EventKind::ScheduleFired,
        EventKind::ScheduleSkipped,
        EventKind::ScheduleFailed,
    ];

    /// snake_case name, identical to the serialized `type` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStateChanged => "agent_state_changed",
            EventKind::TaskQueued => "task_queued",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::ScheduleFired => "schedule_fired",
            EventKind::ScheduleSkipped => "schedule_skipped",
            EventKind::ScheduleFailed => "schedule_failed",
        }
    }
}

impl HookEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HookEvent::AgentStateChanged { .. } => EventKind::AgentStateChanged,
            HookEvent::TaskQueued { .. } => EventKind::TaskQueued,
            HookEvent::TaskStarted { .. } => EventKind::TaskStarted,
            HookEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            HookEvent::TaskFailed { .. } => EventKind::TaskFailed,
            HookEvent::ScheduleFired { .. } => EventKind::ScheduleFired,
            HookEvent::ScheduleSkipped { .. } => EventKind::ScheduleSkipped,
            HookEvent::ScheduleFailed { .. } => EventKind::ScheduleFailed,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Id of the agent task or scheduled task the event is about, if any.
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            HookEvent::AgentStateChanged { .. } => None,
            HookEvent::TaskQueued { task }
            | HookEvent::TaskStarted { task }
            | HookEvent::TaskCompleted { task }
            | HookEvent::TaskFailed { task } => Some(&task.id),
            HookEvent::ScheduleFired { task } | HookEvent::ScheduleSkipped { task, .. } => {
                Some(&task.id)
            }
            HookEvent::ScheduleFailed { schedule_id, .. } => Some(schedule_id),
        }
    }
}
