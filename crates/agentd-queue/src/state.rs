//! Process-wide agent activity flag.
//!
//! The state lives in a `watch` channel so any number of observers can follow
//! idle/busy transitions. Writers that mark the agent busy receive a
//! [`BusyLease`]; releasing a lease only clears the flag if nobody has marked
//! the agent busy since, so one writer never clears what another one set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use agentd_types::AgentStateSnapshot;

/// Partial update applied by [`AgentState::set`]. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct AgentStateUpdate {
    pub is_idle: Option<bool>,
    pub current_action_description: Option<Option<String>>,
}

impl AgentStateUpdate {
    pub fn busy(description: impl Into<String>) -> Self {
        Self {
            is_idle: Some(false),
            current_action_description: Some(Some(description.into())),
        }
    }

    pub fn idle() -> Self {
        Self {
            is_idle: Some(true),
            current_action_description: Some(None),
        }
    }
}

/// Proof that the holder marked the agent busy.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unreleased lease keeps the agent busy"]
pub struct BusyLease(u64);

struct Inner {
    tx: watch::Sender<AgentStateSnapshot>,
    /// Lease currently responsible for the busy flag; 0 when unowned.
    holder: Mutex<u64>,
    next_lease: AtomicU64,
}

/// Shared handle to the agent's idle/busy state. Cloning shares the same cell.
#[derive(Clone)]
pub struct AgentState {
    inner: Arc<Inner>,
}

impl AgentState {
    /// A fresh state: idle, no current action.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AgentStateSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                tx,
                holder: Mutex::new(0),
                next_lease: AtomicU64::new(1),
            }),
        }
    }

    /// Copy of the current state.
    pub fn get(&self) -> AgentStateSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.tx.borrow().is_idle
    }

    /// Receiver notified on every idle/busy transition.
    pub fn subscribe(&self) -> watch::Receiver<AgentStateSnapshot> {
        self.inner.tx.subscribe()
    }

    /// Merge `update` into the state. Writes through this path are not owned
    /// by any lease.
    pub fn set(&self, update: AgentStateUpdate) {
        let mut holder = self.lock_holder();
        if update.is_idle.is_some() {
            *holder = 0;
        }
        self.apply(update);
    }

    /// Mark the agent busy only if it is idle right now.
    pub fn try_acquire(&self, description: impl Into<String>) -> Option<BusyLease> {
        let mut holder = self.lock_holder();
        if !self.inner.tx.borrow().is_idle {
            return None;
        }
        let lease = self.next_lease();
        *holder = lease.0;
        self.apply(AgentStateUpdate::busy(description));
        Some(lease)
    }

    /// Mark the agent busy, taking over from any previous holder.
    pub fn acquire(&self, description: impl Into<String>) -> BusyLease {
        let mut holder = self.lock_holder();
        let lease = self.next_lease();
        *holder = lease.0;
        self.apply(AgentStateUpdate::busy(description));
        lease
    }

    /// Return the agent to idle if `lease` is still the one holding it busy.
    pub fn release(&self, lease: BusyLease) {
        let mut holder = self.lock_holder();
        if *holder != lease.0 {
            debug!(lease = lease.0, holder = *holder, "Busy lease superseded, leaving state as is");
            return;
        }
        *holder = 0;
        self.apply(AgentStateUpdate::idle());
    }

    fn next_lease(&self) -> BusyLease {
        BusyLease(self.inner.next_lease.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_holder(&self) -> std::sync::MutexGuard<'_, u64> {
        self.inner.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribers are only woken on an idle/busy transition.
    fn apply(&self, update: AgentStateUpdate) {
        self.inner.tx.send_if_modified(|state| {
            let was_idle = state.is_idle;
            if let Some(is_idle) = update.is_idle {
                state.is_idle = is_idle;
            }
            if let Some(description) = update.current_action_description {
                state.current_action_description = description;
            }
            let transitioned = was_idle != state.is_idle;
            if transitioned {
                info!(
                    is_idle = state.is_idle,
                    action = state.current_action_description.as_deref().unwrap_or(""),
                    "Agent state changed"
                );
            }
            transitioned
        });
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
