//! Scheduled task service: one in-memory timer per active task, mirrored
//! from the `scheduled_tasks` table.
//!
//! The row is the source of truth. Timers only decide *when* to look at a row
//! again, so every firing re-reads it before running anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use agentd_hooks::{HookEvent, HookRegistry, emit_to};
use agentd_queue::{AgentState, Dispatcher, TaskManager};
use agentd_storage::Storage;
use agentd_types::{
    CreatedBy, ScheduleType, ScheduledTask, ScheduledTaskStatus, ScheduledTaskUpdate, now_millis,
};

use crate::next_run::{Schedule, next_run_time};
use crate::{Result, SchedulerError};

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
const NEXT_RUN_FAILED: &str = "Next run calculation failed";

struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

/// Runs scheduled tasks without ever overlapping two scheduled actions.
pub struct SchedulerService {
    store: Storage,
    agent_state: AgentState,
    task_manager: Arc<TaskManager>,
    dispatcher: Arc<dyn Dispatcher>,
    hooks: Option<Arc<HookRegistry>>,
    heartbeat_period: Duration,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    next_generation: AtomicU64,
    /// Set while a scheduled action is between its guards and its cleanup.
    processing: AtomicBool,
    /// Set by `shutdown`; no timer is armed and no next run persisted while set.
    shut_down: AtomicBool,
    heartbeat: Mutex<Option<AbortHandle>>,
}

impl SchedulerService {
    pub fn new(
        store: Storage,
        agent_state: AgentState,
        task_manager: Arc<TaskManager>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            agent_state,
            task_manager,
            dispatcher,
            hooks: None,
            heartbeat_period: DEFAULT_HEARTBEAT,
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            processing: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Arm timers for upcoming tasks, run the ones missed while the process
    /// was down, then start the queue heartbeat.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.shut_down.store(false, Ordering::Release);
        let now = now_millis();

        let upcoming = self.store.list_upcoming_scheduled_tasks(now).await?;
        info!(count = upcoming.len(), "Arming scheduled tasks");
        for task in &upcoming {
            self.schedule_next_run(task);
        }

        self.check_missed_tasks(now).await?;
        self.start_heartbeat();
        Ok(())
    }

    /// Stop every timer and the heartbeat. Persisted rows are left as they are,
    /// including the rows of firings still in flight.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let timers: Vec<ArmedTimer> = self.lock_timers().drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.handle.abort();
        }
        if let Some(heartbeat) = self.lock_heartbeat().take() {
            heartbeat.abort();
        }
        info!(timers = timers.len(), "Scheduler shut down");
    }

    pub async fn add_scheduled_task(
        self: &Arc<Self>,
        description: &str,
        task_type: ScheduleType,
        schedule: &str,
        created_by: CreatedBy,
    ) -> Result<ScheduledTask> {
        let description = non_empty_description(description)?;
        let schedule = schedule.trim();
        Schedule::parse(task_type, schedule)?;

        let now = now_millis();
        let next = next_run_time(task_type, schedule, 0, now);
        if next == 0 {
            return Err(match task_type {
                ScheduleType::Once => {
                    SchedulerError::Validation(format!("scheduled time {schedule} has already passed"))
                }
                kind => SchedulerError::NextRunFailed {
                    kind,
                    schedule: schedule.to_string(),
                },
            });
        }

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            description,
            task_type,
            schedule: schedule.to_string(),
            status: ScheduledTaskStatus::Active,
            next_run_time: next,
            last_run_time: None,
            created_at: now,
            updated_at: now,
            created_by,
            fail_reason: None,
        };
        self.store.insert_scheduled_task(&task).await?;
        info!(
            schedule_id = %task.id,
            kind = %task.task_type,
            schedule = %task.schedule,
            next_run_time = task.next_run_time,
            "Scheduled task added"
        );

        self.schedule_next_run(&task);
        Ok(task)
    }

    /// Apply a partial update. Returns `None` if the id is unknown.
    ///
    /// The next run is recomputed when the schedule or type is given, or when
    /// the task is moved back to `active`; otherwise the stored (or supplied)
    /// value is kept.
    pub async fn update_scheduled_task(
        self: &Arc<Self>,
        id: &str,
        updates: ScheduledTaskUpdate,
    ) -> Result<Option<ScheduledTask>> {
        let Some(existing) = self.store.get_scheduled_task(id).await? else {
            return Ok(None);
        };

        let reactivated = updates.status == Some(ScheduledTaskStatus::Active)
            && existing.status != ScheduledTaskStatus::Active;
        let recompute = updates.schedule.is_some() || updates.task_type.is_some() || reactivated;

        let mut task = existing;
        if let Some(description) = updates.description {
            task.description = non_empty_description(&description)?;
        }
        if let Some(task_type) = updates.task_type {
            task.task_type = task_type;
        }
        if let Some(schedule) = updates.schedule {
            task.schedule = schedule.trim().to_string();
        }
        if let Some(status) = updates.status {
            task.status = status;
        }
        if let Some(next_run_time) = updates.next_run_time {
            task.next_run_time = next_run_time;
        }
        if reactivated {
            task.fail_reason = None;
        }

        if recompute {
            Schedule::parse(task.task_type, &task.schedule)?;
            let next = next_run_time(task.task_type, &task.schedule, 0, now_millis());
            if next == 0 && task.task_type != ScheduleType::Once {
                return Err(SchedulerError::NextRunFailed {
                    kind: task.task_type,
                    schedule: task.schedule,
                });
            }
            task.next_run_time = next;
        }

        let Some(saved) = self.store.save_scheduled_task(&task).await? else {
            self.clear_timer(id);
            return Ok(None);
        };
        info!(
            schedule_id = %saved.id,
            status = %saved.status,
            next_run_time = saved.next_run_time,
            "Scheduled task updated"
        );

        self.clear_timer(id);
        if saved.next_run_time > 0 {
            self.schedule_next_run(&saved);
        }
        Ok(Some(saved))
    }

    /// Remove a task and its timer. Succeeds whether or not the row existed.
    pub async fn delete_scheduled_task(&self, id: &str) -> Result<bool> {
        self.clear_timer(id);
        let existed = self.store.delete_scheduled_task(id).await?;
        if existed {
            info!(schedule_id = id, "Scheduled task deleted");
        } else {
            debug!(schedule_id = id, "Delete of unknown scheduled task");
        }
        Ok(true)
    }

    pub async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.store.get_scheduled_task(id).await?)
    }

    /// Active tasks ordered by next run time.
    pub async fn get_active_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.store.list_scheduled_tasks(true).await?)
    }

    /// All tasks ordered by next run time.
    pub async fn get_all_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.store.list_scheduled_tasks(false).await?)
    }

    /// Fire a task immediately through the normal guarded path.
    ///
    /// Returns the row as it stands afterwards, or `None` if the id is unknown.
    pub async fn run_now(self: &Arc<Self>, id: &str) -> Result<Option<ScheduledTask>> {
        let Some(task) = self.store.get_scheduled_task(id).await? else {
            return Ok(None);
        };
        info!(schedule_id = id, "Running scheduled task on request");
        self.run_scheduled_task(task).await;
        Ok(self.store.get_scheduled_task(id).await?)
    }

    /// Whether an in-memory timer is currently armed for `id`.
    pub fn is_armed(&self, id: &str) -> bool {
        self.lock_timers().contains_key(id)
    }

    /// Arm (or re-arm) the timer for `task` from its `next_run_time`.
    ///
    /// Overdue tasks fire on a fresh task rather than inline.
    pub fn schedule_next_run(self: &Arc<Self>, task: &ScheduledTask) {
        if task.status != ScheduledTaskStatus::Active || self.is_shut_down() {
            return;
        }

        let id = task.id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = task.next_run_time - now_millis();

        // The entry is inserted before the timer task can look for it.
        let mut timers = self.lock_timers();
        let this = Arc::clone(self);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            } else {
                tokio::task::yield_now().await;
            }
            this.fire(timer_id, generation).await;
        });
        let previous = timers.insert(
            id.clone(),
            ArmedTimer {
                generation,
                handle: handle.abort_handle(),
            },
        );
        drop(timers);

        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(schedule_id = %id, delay_ms = delay.max(0), "Timer armed");
    }

    async fn fire(self: Arc<Self>, id: String, generation: u64) {
        {
            let mut timers = self.lock_timers();
            if !timers.get(&id).is_some_and(|t| t.generation == generation) {
                return;
            }
            timers.remove(&id);
        }

        match self.store.get_scheduled_task(&id).await {
            Ok(Some(task)) if task.status == ScheduledTaskStatus::Active => {
                self.run_scheduled_task(task).await;
            }
            Ok(Some(task)) => {
                debug!(schedule_id = %id, status = %task.status, "Timer fired for inactive task")
            }
            Ok(None) => debug!(schedule_id = %id, "Timer fired for deleted task"),
            Err(e) => error!(schedule_id = %id, "Failed to load scheduled task: {e}"),
        }
    }

    /// Execute one firing of `task`.
    ///
    /// Skipped when another scheduled action is in progress, deferred when
    /// the agent is busy. Repeating tasks are rescheduled either way. Errors
    /// are recorded on the row, never returned.
    pub async fn run_scheduled_task(self: &Arc<Self>, mut task: ScheduledTask) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(schedule_id = %task.id, "Another scheduled task is running, skipping");
            self.skip(task, "scheduler busy").await;
            return;
        }

        let Some(lease) = self
            .agent_state
            .try_acquire(format!("Scheduled task: {}", task.description))
        else {
            self.processing.store(false, Ordering::Release);
            info!(schedule_id = %task.id, "Agent is busy, deferring scheduled task");
            self.skip(task, "agent busy").await;
            return;
        };

        let scheduled_next = task.next_run_time;
        self.execute(&mut task).await;
        if task.task_type.is_repeating() {
            self.reschedule_after_run(&task.id, scheduled_next).await;
        }

        // A runloop firing that started a queued task has already handed the
        // busy flag to the task manager; this release is then a no-op.
        self.agent_state.release(lease);
        self.processing.store(false, Ordering::Release);
    }

    async fn execute(&self, task: &mut ScheduledTask) {
        let started = now_millis();
        if let Err(e) = self.store.set_scheduled_last_run_time(&task.id, started).await {
            error!(schedule_id = %task.id, "Failed to record last run time: {e}");
        }
        task.last_run_time = Some(started);

        info!(schedule_id = %task.id, kind = %task.task_type, "Running scheduled task");
        emit_to(
            self.hooks.as_ref(),
            HookEvent::ScheduleFired { task: task.clone() },
        )
        .await;

        let outcome = match task.task_type {
            ScheduleType::Runloop => self
                .task_manager
                .process_next_task_if_idle()
                .await
                .map_err(anyhow::Error::from),
            _ => {
                self.dispatcher
                    .trigger_agent_processing(&task.description, &task.id)
                    .await
            }
        };

        match outcome {
            Err(e) => {
                error!(schedule_id = %task.id, "Scheduled task failed: {e:#}");
                self.mark_error(task, format!("{e:#}")).await;
            }
            Ok(()) if task.task_type == ScheduleType::Once => {
                match self
                    .store
                    .set_scheduled_status(&task.id, ScheduledTaskStatus::Completed, None)
                    .await
                {
                    Ok(()) => task.status = ScheduledTaskStatus::Completed,
                    Err(e) => error!(schedule_id = %task.id, "Failed to complete task: {e}"),
                }
            }
            Ok(()) => {}
        }
    }

    /// Reschedule from the row as it stands once the dispatch has returned.
    ///
    /// An update that moved the next run while the dispatch was in flight wins
    /// over the snapshot this firing started from. Rows that were deleted,
    /// paused or marked `error` meanwhile are left alone.
    async fn reschedule_after_run(self: &Arc<Self>, id: &str, scheduled_next: i64) {
        let mut current = match self.store.get_scheduled_task(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(schedule_id = id, "Scheduled task deleted during run");
                return;
            }
            Err(e) => {
                error!(schedule_id = id, "Failed to reload scheduled task: {e}");
                return;
            }
        };

        if current.status != ScheduledTaskStatus::Active || !current.task_type.is_repeating() {
            debug!(schedule_id = id, status = %current.status, "Not rescheduling");
            return;
        }
        if current.next_run_time != scheduled_next {
            debug!(
                schedule_id = id,
                next_run_time = current.next_run_time,
                "Next run changed during run, keeping it"
            );
            if current.next_run_time > 0 && !self.is_armed(id) {
                self.schedule_next_run(&current);
            }
            return;
        }
        self.reschedule(&mut current).await;
    }

    /// Compute, persist and arm the next run; mark the task `error` if there is none.
    async fn reschedule(self: &Arc<Self>, task: &mut ScheduledTask) {
        if self.is_shut_down() {
            debug!(schedule_id = %task.id, "Scheduler shut down, next run left as stored");
            return;
        }
        let next = next_run_time(
            task.task_type,
            &task.schedule,
            task.next_run_time,
            now_millis(),
        );
        if next == 0 {
            warn!(schedule_id = %task.id, schedule = %task.schedule, "{NEXT_RUN_FAILED}");
            self.mark_error(task, NEXT_RUN_FAILED.to_string()).await;
            return;
        }

        if let Err(e) = self.store.set_scheduled_next_run_time(&task.id, next).await {
            error!(schedule_id = %task.id, "Failed to persist next run time: {e}");
            return;
        }
        task.next_run_time = next;
        self.schedule_next_run(task);
    }

    async fn skip(self: &Arc<Self>, mut task: ScheduledTask, reason: &str) {
        if task.task_type.is_repeating() {
            self.reschedule(&mut task).await;
        }
        emit_to(
            self.hooks.as_ref(),
            HookEvent::ScheduleSkipped {
                task,
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn mark_error(&self, task: &mut ScheduledTask, reason: String) {
        if let Err(e) = self
            .store
            .set_scheduled_status(&task.id, ScheduledTaskStatus::Error, Some(reason.clone()))
            .await
        {
            error!(schedule_id = %task.id, "Failed to record scheduled task error: {e}");
        }
        task.status = ScheduledTaskStatus::Error;
        task.fail_reason = Some(reason.clone());
        emit_to(
            self.hooks.as_ref(),
            HookEvent::ScheduleFailed {
                schedule_id: task.id.clone(),
                reason,
            },
        )
        .await;
    }

    /// Run every active task whose next run passed while nothing was running.
    async fn check_missed_tasks(self: &Arc<Self>, now: i64) -> Result<()> {
        let missed = self.store.list_missed_scheduled_tasks(now).await?;
        if !missed.is_empty() {
            info!(count = missed.len(), "Catching up on missed scheduled tasks");
        }
        for task in missed {
            info!(
                schedule_id = %task.id,
                overdue_ms = now - task.next_run_time,
                "Running missed scheduled task"
            );
            self.run_scheduled_task(task).await;
        }
        Ok(())
    }

    /// Periodically advance the task queue while the agent is idle.
    fn start_heartbeat(self: &Arc<Self>) {
        let period = self.heartbeat_period;
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !this.agent_state.is_idle() {
                    continue;
                }
                if let Err(e) = this.task_manager.process_next_task_if_idle().await {
                    error!("Heartbeat failed to advance task queue: {e}");
                }
            }
        });

        if let Some(previous) = self.lock_heartbeat().replace(handle.abort_handle()) {
            previous.abort();
        }
        info!(period_secs = period.as_secs_f64(), "Scheduler heartbeat started");
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn clear_timer(&self, id: &str) {
        if let Some(timer) = self.lock_timers().remove(id) {
            timer.handle.abort();
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_heartbeat(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn non_empty_description(description: &str) -> Result<String> {
    let description = description.trim();
    if description.is_empty() {
        return Err(SchedulerError::Validation(
            "description must not be empty".into(),
        ));
    }
    Ok(description.to_string())
}
