//! FIFO queue over `agent_tasks` with at most one task in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use agentd_hooks::{HookEvent, HookRegistry, emit_to};
use agentd_storage::{Storage, StorageError};
use agentd_types::{AgentTask, AgentTaskStatus};

use crate::dispatch::Dispatcher;
use crate::state::{AgentState, BusyLease};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid task: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// The in-flight pointer and the busy lease taken when it was dispatched.
#[derive(Default)]
struct InFlight {
    task_id: Option<String>,
    lease: Option<BusyLease>,
}

/// Serializes agent work: tasks run one at a time in ascending `sequence`.
pub struct TaskManager {
    store: Storage,
    agent_state: AgentState,
    dispatcher: Arc<dyn Dispatcher>,
    hooks: Option<Arc<HookRegistry>>,
    in_flight: Mutex<InFlight>,
    /// Held for the whole select-mark-dispatch sequence.
    advance_lock: tokio::sync::Mutex<()>,
}

impl TaskManager {
    /// Create a task manager. Call [`TaskManager::initialize`] before use.
    pub fn new(store: Storage, agent_state: AgentState, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            agent_state,
            dispatcher,
            hooks: None,
            in_flight: Mutex::new(InFlight::default()),
            advance_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach a hook registry for queue lifecycle events.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Recover from a previous process.
    ///
    /// A task left `in_progress` is tracked as current again but is not
    /// re-dispatched; it stays current until someone completes or fails it.
    /// Otherwise the queue is advanced so tasks added while no manager was
    /// running are picked up.
    pub async fn initialize(&self) -> Result<()> {
        match self
            .store
            .first_agent_task_with_status(AgentTaskStatus::InProgress)
            .await?
        {
            Some(task) => {
                warn!(
                    task_id = %task.id,
                    sequence = task.sequence,
                    "Resuming in-progress task from previous run without re-dispatching"
                );
                self.lock_in_flight().task_id = Some(task.id);
                Ok(())
            }
            None => self.process_next_task().await,
        }
    }

    /// Append a task to the queue and start it if nothing is running.
    pub async fn add_task(&self, description: &str) -> Result<AgentTask> {
        let description = description.trim();
        if description.is_empty() {
            return Err(TaskError::Validation("description must not be empty".into()));
        }

        let task = self.store.insert_agent_task(description).await?;
        info!(task_id = %task.id, sequence = task.sequence, "Task queued");
        emit_to(self.hooks.as_ref(), HookEvent::TaskQueued { task: task.clone() }).await;

        if let Err(e) = self.process_next_task_if_idle().await {
            error!(task_id = %task.id, "Failed to advance queue after add: {e}");
            return Err(e);
        }
        Ok(task)
    }

    /// Pending and in-progress tasks in queue order.
    pub async fn get_active_tasks(&self) -> Result<Vec<AgentTask>> {
        Ok(self.store.list_agent_tasks(true).await?)
    }

    /// Every task in queue order.
    pub async fn get_all_tasks(&self) -> Result<Vec<AgentTask>> {
        Ok(self.store.list_agent_tasks(false).await?)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<AgentTask>> {
        Ok(self.store.get_agent_task(task_id).await?)
    }

    pub fn get_current_task_id(&self) -> Option<String> {
        self.lock_in_flight().task_id.clone()
    }

    /// Whether `task_id` is the task this manager is currently running.
    pub fn confirm_task_in_progress(&self, task_id: &str) -> bool {
        self.lock_in_flight().task_id.as_deref() == Some(task_id)
    }

    /// Mark the current task completed and move on to the next one.
    ///
    /// Signals for any task other than the current one are ignored.
    pub async fn handle_task_completion(
        &self,
        task_id: &str,
        result_summary: Option<String>,
    ) -> Result<()> {
        if !self.release_current(task_id) {
            warn!(task_id, "Ignoring completion for a task that is not current");
            return Ok(());
        }

        match self
            .store
            .finish_agent_task(task_id, AgentTaskStatus::Completed, result_summary, None)
            .await?
        {
            Some(task) => {
                info!(task_id, sequence = task.sequence, "Task completed");
                emit_to(self.hooks.as_ref(), HookEvent::TaskCompleted { task }).await;
            }
            None => warn!(task_id, "Completed task was no longer in progress in storage"),
        }

        self.process_next_task().await
    }

    /// Mark the current task failed and move on to the next one.
    pub async fn handle_task_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        if !self.release_current(task_id) {
            warn!(task_id, "Ignoring failure for a task that is not current");
            return Ok(());
        }

        match self
            .store
            .finish_agent_task(
                task_id,
                AgentTaskStatus::Failed,
                None,
                Some(reason.to_string()),
            )
            .await?
        {
            Some(task) => {
                warn!(task_id, sequence = task.sequence, reason, "Task failed");
                emit_to(self.hooks.as_ref(), HookEvent::TaskFailed { task }).await;
            }
            None => warn!(task_id, "Failed task was no longer in progress in storage"),
        }

        self.process_next_task().await
    }

    /// Advance the queue unless a task is in flight or an advance is underway.
    pub async fn process_next_task_if_idle(&self) -> Result<()> {
        if self.get_current_task_id().is_some() {
            debug!("Task in flight, not advancing");
            return Ok(());
        }
        let Ok(_guard) = self.advance_lock.try_lock() else {
            debug!("Queue advance already underway");
            return Ok(());
        };
        self.advance().await
    }

    /// Advance after the current task finished; waits for a concurrent
    /// advance instead of dropping the request.
    async fn process_next_task(&self) -> Result<()> {
        let _guard = self.advance_lock.lock().await;
        self.advance().await
    }

    /// Start the earliest pending task. Caller holds `advance_lock`.
    async fn advance(&self) -> Result<()> {
        if self.get_current_task_id().is_some() {
            return Ok(());
        }

        let Some(next) = self
            .store
            .first_agent_task_with_status(AgentTaskStatus::Pending)
            .await?
        else {
            debug!("Task queue is empty");
            return Ok(());
        };

        let Some(task) = self.store.start_agent_task(&next.id).await? else {
            warn!(task_id = %next.id, "Pending task changed state before it could start");
            return Ok(());
        };

        let lease = self
            .agent_state
            .acquire(format!("Task #{}: {}", task.sequence, task.description));
        {
            let mut in_flight = self.lock_in_flight();
            in_flight.task_id = Some(task.id.clone());
            in_flight.lease = Some(lease);
        }

        info!(task_id = %task.id, sequence = task.sequence, "Dispatching task");
        emit_to(self.hooks.as_ref(), HookEvent::TaskStarted { task: task.clone() }).await;
        self.dispatcher.trigger_next_task_processing(task);
        Ok(())
    }

    /// Clear the in-flight pointer if it names `task_id`, releasing its lease.
    fn release_current(&self, task_id: &str) -> bool {
        let lease = {
            let mut in_flight = self.lock_in_flight();
            if in_flight.task_id.as_deref() != Some(task_id) {
                return false;
            }
            in_flight.task_id = None;
            in_flight.lease.take()
        };
        if let Some(lease) = lease {
            self.agent_state.release(lease);
        }
        true
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<AgentTask>>,
    }

    impl RecordingDispatcher {
        fn ids(&self) -> Vec<String> {
            self.dispatched
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn trigger_agent_processing(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn trigger_next_task_processing(&self, task: AgentTask) {
            self.dispatched.lock().unwrap().push(task);
        }
    }

    async fn manager_on(store: Storage) -> (TaskManager, Arc<RecordingDispatcher>, AgentState) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = AgentState::new();
        let manager = TaskManager::new(store, state.clone(), dispatcher.clone());
        manager.initialize().await.unwrap();
        (manager, dispatcher, state)
    }

    async fn in_progress_count(manager: &TaskManager) -> usize {
        manager
            .get_all_tasks()
            .await
            .unwrap()
            .iter()
            .filter(|t| t.status == AgentTaskStatus::InProgress)
            .count()
    }

    #[tokio::test]
    async fn test_fifo_order_and_sequences() {
        let (manager, _, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let descriptions = ["first", "second", "third", "fourth"];
        for d in descriptions {
            manager.add_task(d).await.unwrap();
        }

        let active = manager.get_active_tasks().await.unwrap();
        let got: Vec<&str> = active.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(got, descriptions);
        for pair in active.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }
    }

    #[tokio::test]
    async fn test_single_task_in_flight() {
        let (manager, dispatcher, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let first = manager.add_task("a").await.unwrap();
        manager.add_task("b").await.unwrap();
        manager.add_task("c").await.unwrap();

        assert_eq!(in_progress_count(&manager).await, 1);
        assert_eq!(dispatcher.ids(), vec![first.id.clone()]);
        assert!(manager.confirm_task_in_progress(&first.id));
        assert_eq!(manager.get_current_task_id(), Some(first.id));
    }

    #[tokio::test]
    async fn test_concurrent_adds_start_one_task() {
        let (manager, dispatcher, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let (a, b, c) = tokio::join!(
            manager.add_task("a"),
            manager.add_task("b"),
            manager.add_task("c")
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(in_progress_count(&manager).await, 1);
        assert_eq!(dispatcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_advances_queue() {
        let (manager, dispatcher, state) = manager_on(Storage::open_in_memory().unwrap()).await;
        let t1 = manager.add_task("t1").await.unwrap();
        let t2 = manager.add_task("t2").await.unwrap();
        assert!(!state.is_idle());

        manager
            .handle_task_completion(&t1.id, Some("done".into()))
            .await
            .unwrap();
        let active = manager.get_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, t2.id);
        assert_eq!(active[0].status, AgentTaskStatus::InProgress);
        assert_eq!(dispatcher.ids(), vec![t1.id.clone(), t2.id.clone()]);

        let done = manager.get_task(&t1.id).await.unwrap().unwrap();
        assert_eq!(done.status, AgentTaskStatus::Completed);
        assert_eq!(done.result_summary.as_deref(), Some("done"));

        manager.handle_task_completion(&t2.id, None).await.unwrap();
        assert!(manager.get_active_tasks().await.unwrap().is_empty());
        assert!(manager.get_current_task_id().is_none());
        assert!(state.is_idle());
    }

    #[tokio::test]
    async fn test_failure_records_reason_and_advances() {
        let (manager, _, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let t1 = manager.add_task("t1").await.unwrap();
        let t2 = manager.add_task("t2").await.unwrap();

        manager.handle_task_failure(&t1.id, "model timeout").await.unwrap();

        let failed = manager.get_task(&t1.id).await.unwrap().unwrap();
        assert_eq!(failed.status, AgentTaskStatus::Failed);
        assert_eq!(failed.fail_reason.as_deref(), Some("model timeout"));
        assert!(manager.confirm_task_in_progress(&t2.id));
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let (manager, dispatcher, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let t1 = manager.add_task("t1").await.unwrap();
        let t2 = manager.add_task("t2").await.unwrap();

        // t2 is pending, not current
        manager.handle_task_completion(&t2.id, None).await.unwrap();
        manager.handle_task_failure("unknown", "nope").await.unwrap();

        assert!(manager.confirm_task_in_progress(&t1.id));
        let t2_now = manager.get_task(&t2.id).await.unwrap().unwrap();
        assert_eq!(t2_now.status, AgentTaskStatus::Pending);
        assert_eq!(dispatcher.ids().len(), 1);

        // Duplicate completion of t1 is applied once
        manager.handle_task_completion(&t1.id, None).await.unwrap();
        manager.handle_task_completion(&t1.id, None).await.unwrap();
        assert!(manager.confirm_task_in_progress(&t2.id));
        assert_eq!(dispatcher.ids().len(), 2);
    }

    #[tokio::test]
    async fn test_tasks_visible_from_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentd.db");

        let (manager, _, _) = manager_on(Storage::open(&path).unwrap()).await;
        let t1 = manager.add_task("persisted one").await.unwrap();
        manager.add_task("persisted two").await.unwrap();
        drop(manager);

        let (fresh, dispatcher, _) = manager_on(Storage::open(&path).unwrap()).await;
        let all = fresh.get_all_tasks().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].description, "persisted one");

        // The dangling in-progress task is tracked but not dispatched again
        assert_eq!(fresh.get_current_task_id(), Some(t1.id));
        assert!(dispatcher.ids().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_drains_tasks_added_offline() {
        let store = Storage::open_in_memory().unwrap();
        let offline = store.insert_agent_task("added while down").await.unwrap();

        let (manager, dispatcher, _) = manager_on(store).await;
        assert_eq!(dispatcher.ids(), vec![offline.id.clone()]);
        assert!(manager.confirm_task_in_progress(&offline.id));
    }

    #[tokio::test]
    async fn test_process_next_when_idle_picks_up_direct_inserts() {
        let store = Storage::open_in_memory().unwrap();
        let (manager, dispatcher, _) = manager_on(store.clone()).await;
        assert!(dispatcher.ids().is_empty());

        let task = store.insert_agent_task("inserted behind the manager").await.unwrap();
        manager.process_next_task_if_idle().await.unwrap();
        assert_eq!(dispatcher.ids(), vec![task.id]);
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let (manager, _, _) = manager_on(Storage::open_in_memory().unwrap()).await;
        let err = manager.add_task("   ").await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
        assert!(manager.get_all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hooks_receive_queue_events() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let hooks = Arc::new(HookRegistry::new());
        let started = Arc::new(AtomicU32::new(0));
        let c = started.clone();
        hooks
            .on(
                agentd_hooks::EventKind::TaskStarted,
                Arc::new(move |_event| {
                    let c = c.clone();
                    Box::pin(async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        let manager = TaskManager::new(
            Storage::open_in_memory().unwrap(),
            AgentState::new(),
            Arc::new(RecordingDispatcher::default()),
        )
        .with_hooks(hooks);
        manager.initialize().await.unwrap();
        let t1 = manager.add_task("a").await.unwrap();
        manager.add_task("b").await.unwrap();
        manager.handle_task_completion(&t1.id, None).await.unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
