//! Boundary to whatever actually runs agent work.

use async_trait::async_trait;

use agentd_types::AgentTask;

/// The external executor invoked by the task manager and the scheduler.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run a scheduled instruction. Resolves when the run is over; an error
    /// is recorded on the scheduled task.
    async fn trigger_agent_processing(
        &self,
        description: &str,
        scheduled_task_id: &str,
    ) -> anyhow::Result<()>;

    /// Hand a queued task to the executor without waiting for it.
    ///
    /// The executor reports back through `TaskManager::handle_task_completion`
    /// or `TaskManager::handle_task_failure` with the task id.
    fn trigger_next_task_processing(&self, task: AgentTask);
}
