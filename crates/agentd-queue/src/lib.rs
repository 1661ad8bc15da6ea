//! agentd-queue: the serialized agent work queue.
//!
//! - [`AgentState`]: process-wide idle/busy cell with change notification
//! - [`Dispatcher`]: the external executor that actually runs agent work
//! - [`TaskManager`]: FIFO queue over `agent_tasks`, at most one task in flight

pub mod dispatch;
pub mod manager;
pub mod state;

pub use dispatch::Dispatcher;
pub use manager::{TaskError, TaskManager};
pub use state::{AgentState, AgentStateUpdate, BusyLease};
