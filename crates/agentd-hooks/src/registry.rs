//! Subscription table for [`HookEvent`]s.
//!
//! Handlers are keyed by [`EventKind`]. A handler registered with
//! [`HookRegistry::on_any`] sees every event after the kind-specific ones.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::trace;

use crate::events::{EventKind, HookEvent};

/// Async hook handler function type.
pub type HookHandler =
    Arc<dyn Fn(HookEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    by_kind: HashMap<EventKind, Vec<HookHandler>>,
    any: Vec<HookHandler>,
}

#[derive(Default)]
pub struct HookRegistry {
    subscriptions: RwLock<Subscriptions>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on(&self, kind: EventKind, handler: HookHandler) {
        self.subscriptions
            .write()
            .await
            .by_kind
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub async fn on_kinds(&self, kinds: &[EventKind], handler: HookHandler) {
        let mut subs = self.subscriptions.write().await;
        for kind in kinds {
            subs.by_kind.entry(*kind).or_default().push(handler.clone());
        }
    }

    pub async fn on_any(&self, handler: HookHandler) {
        self.subscriptions.write().await.any.push(handler);
    }

    /// Number of handlers that an event of `kind` would reach.
    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        let subs = self.subscriptions.read().await;
        subs.by_kind.get(&kind).map_or(0, Vec::len) + subs.any.len()
    }

    /// Hand `event` to every matching handler, each on its own task, so a
    /// slow hook never holds up the queue or the scheduler.
    pub async fn emit(&self, event: HookEvent) {
        let subs = self.subscriptions.read().await;
        let specific = subs.by_kind.get(&event.kind()).map(Vec::as_slice).unwrap_or(&[]);

        let mut delivered = 0usize;
        for handler in specific.iter().chain(subs.any.iter()) {
            let handler = Arc::clone(handler);
            let event = event.clone();
            tokio::spawn(async move { handler(event).await });
            delivered += 1;
        }
        trace!(event = event.type_name(), delivered, "Hook event emitted");
    }
}

/// Emit through a registry that may not be configured.
pub async fn emit_to(hooks: Option<&Arc<HookRegistry>>, event: HookEvent) {
    if let Some(hooks) = hooks {
        hooks.emit(event).await;
    }
}
