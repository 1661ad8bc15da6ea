use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A string did not name any variant of a status/type enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` over the snake_case wire names.
macro_rules! wire_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ──────────────────── Agent Tasks ────────────────────

/// Lifecycle of a queued agent task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

wire_enum!(AgentTaskStatus, "agent task status", {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl AgentTaskStatus {
    /// Pending or in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// A unit of agent work waiting in (or drained from) the FIFO queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    /// Instruction handed to the agent.
    pub description: String,
    pub status: AgentTaskStatus,
    /// FIFO position, `max(sequence) + 1` at insertion time.
    pub sequence: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

// ──────────────────── Scheduled Tasks ────────────────────

/// How a scheduled task's `schedule` string is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// ISO datetime, fires once.
    Once,
    /// Every N minutes.
    Interval,
    /// `daily@HH:MM` or `weekdays@HH:MM`.
    Recurring,
    /// Every N minutes, always counted from now.
    Heartbeat,
    /// Every N seconds, advances the agent task queue instead of dispatching.
    Runloop,
}

wire_enum!(ScheduleType, "schedule type", {
    Once => "once",
    Interval => "interval",
    Recurring => "recurring",
    Heartbeat => "heartbeat",
    Runloop => "runloop",
});

impl ScheduleType {
    /// Types that are rescheduled after every firing.
    pub fn is_repeating(&self) -> bool {
        !matches!(self, Self::Once)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTaskStatus {
    Active,
    Paused,
    Completed,
    Error,
}

wire_enum!(ScheduledTaskStatus, "scheduled task status", {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Error => "error",
});

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    #[default]
    User,
    Agent,
}

wire_enum!(CreatedBy, "creator", {
    User => "user",
    Agent => "agent",
});

/// A timed trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    /// Payload delivered to the agent when the task fires.
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: ScheduleType,
    pub schedule: String,
    pub status: ScheduledTaskStatus,
    /// Unix millis of the next firing; `0` means nothing is pending.
    pub next_run_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub created_by: CreatedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

/// Partial update for a scheduled task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<ScheduleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScheduledTaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<i64>,
}

// ──────────────────── Agent State ────────────────────

/// Snapshot of the process-wide agent activity flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateSnapshot {
    pub is_idle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action_description: Option<String>,
}

impl Default for AgentStateSnapshot {
    fn default() -> Self {
        Self {
            is_idle: true,
            current_action_description: None,
        }
    }
}
