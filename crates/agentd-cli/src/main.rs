mod rpc;

use anyhow::Context;
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use agentd_types::{AgentTask, ScheduleType, ScheduledTask, ScheduledTaskStatus};
use rpc::RpcClient;

#[derive(Parser)]
#[command(name = "agentd", about = "Agent task queue and scheduler")]
struct Cli {
    /// Gateway JSON-RPC URL (defaults to the configured host and port)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer token for authentication
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway: task queue, scheduler and JSON-RPC server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write a default config file to ~/.agentd/config.json5
    Init,
    /// Check that the gateway is reachable
    Health,
    /// Show whether the agent is idle
    State,
    /// Manage the agent task queue
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage scheduled tasks
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Append a task to the queue
    Add { description: String },
    /// List pending and in-progress tasks
    List {
        /// Include completed and failed tasks
        #[arg(short, long)]
        all: bool,
    },
    /// Mark the running task completed
    Complete {
        id: String,
        #[arg(short, long)]
        summary: Option<String>,
    },
    /// Mark the running task failed
    Fail {
        id: String,
        #[arg(short, long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Create a scheduled task
    Add {
        description: String,
        /// once | interval | recurring | heartbeat | runloop
        #[arg(short = 't', long = "type")]
        task_type: ScheduleType,
        /// ISO datetime, minutes, seconds, or daily@HH:MM / weekdays@HH:MM
        #[arg(short, long)]
        schedule: String,
    },
    /// List scheduled tasks
    List {
        /// Include paused, completed and failed tasks
        #[arg(short, long)]
        all: bool,
    },
    /// Change fields of a scheduled task
    Update {
        id: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short = 't', long = "type")]
        task_type: Option<ScheduleType>,
        #[arg(short, long)]
        schedule: Option<String>,
        /// active | paused | completed | error
        #[arg(long)]
        status: Option<ScheduledTaskStatus>,
    },
    /// Delete a scheduled task
    Delete { id: String },
    /// Run a scheduled task now
    Run { id: String },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Commands::Init = cli.command {
        return init_config();
    }

    let config = agentd_config::load_config().context("Failed to load config")?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Serve { port } => rt.block_on(async {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                }
                on_signal.cancel();
            });
            agentd_gateway::start_gateway(config, port, cancel).await
        }),
        command => {
            let client = RpcClient::new(&config, cli.url, cli.token);
            rt.block_on(run_client(&client, command))
        }
    }
}

async fn run_client(client: &RpcClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { .. } | Commands::Init => {
            anyhow::bail!("this command does not talk to the gateway")
        }
        Commands::Health => {
            let result = client.call("health", json!({})).await?;
            println!(
                "agentd gateway at {} is {} (v{})",
                client.url(),
                result["status"].as_str().unwrap_or("unknown"),
                result["version"].as_str().unwrap_or("?"),
            );
        }
        Commands::State => {
            let result = client.call("agent.state", json!({})).await?;
            if result["isIdle"].as_bool().unwrap_or(true) {
                println!("idle");
            } else {
                println!(
                    "busy: {}",
                    result["currentActionDescription"].as_str().unwrap_or("")
                );
            }
        }
        Commands::Task(cmd) => run_task_command(client, cmd).await?,
        Commands::Schedule(cmd) => run_schedule_command(client, cmd).await?,
    }
    Ok(())
}

async fn run_task_command(client: &RpcClient, cmd: TaskCommand) -> anyhow::Result<()> {
    match cmd {
        TaskCommand::Add { description } => {
            let result = client
                .call("tasks.add", json!({ "description": description }))
                .await?;
            let task: AgentTask = field(result, "task")?;
            println!("{}", format_task(&task));
        }
        TaskCommand::List { all } => {
            let method = if all { "tasks.list" } else { "tasks.active" };
            let tasks: Vec<AgentTask> = field(client.call(method, json!({})).await?, "tasks")?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                println!("{}", format_task(task));
            }
        }
        TaskCommand::Complete { id, summary } => {
            client
                .call(
                    "tasks.complete",
                    json!({ "id": id, "resultSummary": summary }),
                )
                .await?;
            println!("Completion sent for {id}");
        }
        TaskCommand::Fail { id, reason } => {
            client
                .call("tasks.fail", json!({ "id": id, "reason": reason }))
                .await?;
            println!("Failure sent for {id}");
        }
    }
    Ok(())
}

async fn run_schedule_command(client: &RpcClient, cmd: ScheduleCommand) -> anyhow::Result<()> {
    match cmd {
        ScheduleCommand::Add {
            description,
            task_type,
            schedule,
        } => {
            let result = client
                .call(
                    "schedules.add",
                    json!({
                        "description": description,
                        "type": task_type,
                        "schedule": schedule,
                    }),
                )
                .await?;
            let task: ScheduledTask = field(result, "schedule")?;
            println!("{}", format_schedule(&task));
        }
        ScheduleCommand::List { all } => {
            let method = if all { "schedules.list" } else { "schedules.active" };
            let schedules: Vec<ScheduledTask> =
                field(client.call(method, json!({})).await?, "schedules")?;
            if schedules.is_empty() {
                println!("No scheduled tasks.");
            }
            for task in &schedules {
                println!("{}", format_schedule(task));
            }
        }
        ScheduleCommand::Update {
            id,
            description,
            task_type,
            schedule,
            status,
        } => {
            let params = json!({
                "id": id,
                "description": description,
                "type": task_type,
                "schedule": schedule,
                "status": status,
            });
            let result = client.call("schedules.update", params).await?;
            match field::<Option<ScheduledTask>>(result, "schedule")? {
                Some(task) => println!("{}", format_schedule(&task)),
                None => println!("No scheduled task {id}"),
            }
        }
        ScheduleCommand::Delete { id } => {
            client.call("schedules.delete", json!({ "id": id })).await?;
            println!("Deleted {id}");
        }
        ScheduleCommand::Run { id } => {
            let result = client.call("schedules.run", json!({ "id": id })).await?;
            match field::<Option<ScheduledTask>>(result, "schedule")? {
                Some(task) => println!("{}", format_schedule(&task)),
                None => println!("No scheduled task {id}"),
            }
        }
    }
    Ok(())
}

fn init_config() -> anyhow::Result<()> {
    let path = agentd_config::config_file_path()?;
    if agentd_config::write_config_if_absent(&path, &agentd_config::AgentdConfig::default())? {
        println!("Wrote default config to {}", path.display());
    } else {
        println!("Config already exists at {}", path.display());
    }
    Ok(())
}

fn field<T: serde::de::DeserializeOwned>(mut result: Value, key: &str) -> anyhow::Result<T> {
    serde_json::from_value(result[key].take())
        .with_context(|| format!("Unexpected '{key}' in response"))
}

fn format_task(task: &AgentTask) -> String {
    let mut line = format!(
        "#{:<4} {:<12} {}  ({})",
        task.sequence, task.status, task.description, task.id
    );
    if let Some(reason) = &task.fail_reason {
        line.push_str(&format!("\n      failed: {reason}"));
    }
    line
}

fn format_schedule(task: &ScheduledTask) -> String {
    let mut line = format!(
        "{:<9} {:<10} {:<16} next: {:<19} {}  ({})",
        task.status,
        task.task_type,
        task.schedule,
        format_millis(task.next_run_time),
        task.description,
        task.id
    );
    if let Some(reason) = &task.fail_reason {
        line.push_str(&format!("\n          error: {reason}"));
    }
    line
}

fn format_millis(millis: i64) -> String {
    if millis <= 0 {
        return "-".to_string();
    }
    match Local.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}
