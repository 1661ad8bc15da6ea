//! agentd-hooks: Event-driven hook system.
//!
//! Hooks observe the agent runtime (idle/busy transitions, queue progress,
//! scheduled firings) without being able to influence it.

pub mod events;
pub mod registry;

pub use events::{EventKind, HookEvent};
pub use registry::{HookHandler, HookRegistry, emit_to};
