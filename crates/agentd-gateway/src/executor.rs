//! Command executor: the process that actually performs agent work.
//!
//! [`ChannelDispatcher`] is what the task manager and scheduler hold. It turns
//! each dispatch into a [`DispatchRequest`] on an mpsc channel; the
//! [`CommandExecutor`] worker receives them, runs the configured command and
//! reports agent-task outcomes back to the [`TaskManager`] by task id.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentd_config::ExecutorConfig;
use agentd_queue::{Dispatcher, TaskManager};
use agentd_types::AgentTask;

/// Maximum characters of stdout kept as a task's result summary.
const MAX_SUMMARY_CHARS: usize = 4_000;

/// Work handed to the executor.
#[derive(Debug)]
pub enum DispatchRequest {
    /// Fire-and-forget: the outcome is reported to the task manager.
    AgentTask(AgentTask),
    /// Awaited by the scheduler through `reply`.
    Scheduled {
        description: String,
        schedule_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Sending half of the executor channel.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl ChannelDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn trigger_agent_processing(
        &self,
        description: &str,
        scheduled_task_id: &str,
    ) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchRequest::Scheduled {
                description: description.to_string(),
                schedule_id: scheduled_task_id.to_string(),
                reply,
            })
            .map_err(|_| anyhow::anyhow!("Executor is not running"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Executor dropped scheduled task {scheduled_task_id}"))?
    }

    fn trigger_next_task_processing(&self, task: AgentTask) {
        let task_id = task.id.clone();
        if self.tx.send(DispatchRequest::AgentTask(task)).is_err() {
            warn!(task_id = %task_id, "Executor is not running, task stays in progress");
        }
    }
}

pub struct CommandExecutor {
    config: ExecutorConfig,
    tasks: Arc<TaskManager>,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig, tasks: Arc<TaskManager>) -> Self {
        Self { config, tasks }
    }

    /// Receive requests until the channel closes or `cancel` fires.
    ///
    /// Each request runs on its own task so a long dispatch never holds up
    /// the completion of another.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<DispatchRequest>,
        cancel: CancellationToken,
    ) {
        match &self.config.command {
            Some(command) => info!(command = %command, "Executor started"),
            None => info!("Executor started without a command, dispatches are acknowledged only"),
        }

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move { this.handle(request).await });
        }
        info!("Executor stopped");
    }

    async fn handle(&self, request: DispatchRequest) {
        match request {
            DispatchRequest::AgentTask(task) => self.run_agent_task(task).await,
            DispatchRequest::Scheduled {
                description,
                schedule_id,
                reply,
            } => {
                info!(schedule_id = %schedule_id, "Executing scheduled task");
                let result = self
                    .run_command(&description, &schedule_id)
                    .await
                    .map(|_| ());
                if reply.send(result).is_err() {
                    debug!(schedule_id = %schedule_id, "Scheduler stopped waiting for result");
                }
            }
        }
    }

    async fn run_agent_task(&self, task: AgentTask) {
        info!(task_id = %task.id, sequence = task.sequence, "Executing agent task");
        let outcome = match self.run_command(&task.description, &task.id).await {
            Ok(summary) => self.tasks.handle_task_completion(&task.id, summary).await,
            Err(e) => {
                warn!(task_id = %task.id, "Agent task failed: {e:#}");
                self.tasks
                    .handle_task_failure(&task.id, &format!("{e:#}"))
                    .await
            }
        };
        if let Err(e) = outcome {
            error!(task_id = %task.id, "Failed to report task outcome: {e}");
        }
    }

    /// Run the configured command with `description` as its last argument.
    ///
    /// Returns the trimmed stdout, or `None` when no command is configured.
    async fn run_command(&self, description: &str, id: &str) -> anyhow::Result<Option<String>> {
        let Some(program) = &self.config.command else {
            info!(id, description, "No executor command configured, acknowledging");
            return Ok(None);
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&self.config.args)
            .arg(description)
            .env("AGENTD_TASK_ID", id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout_secs = self.config.timeout_secs;
        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => anyhow::bail!("Failed to run {program}: {e}"),
            Err(_) => anyhow::bail!("Command timed out after {timeout_secs}s"),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                anyhow::bail!("Command exited with {}", output.status);
            }
            anyhow::bail!("Command exited with {}: {}", output.status, truncate(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok((!stdout.is_empty()).then(|| truncate(stdout)))
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
    cut.push_str("…");
    cut
}
