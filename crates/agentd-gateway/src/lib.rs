//! agentd-gateway: composition root and HTTP JSON-RPC server.
//!
//! Provides:
//! - Wiring of storage, agent state, task queue, scheduler and executor
//! - `POST /rpc` with JSON-RPC 2.0 methods: health, agent.state,
//!   tasks.list/active/get/add/complete/fail/current,
//!   schedules.list/active/get/add/update/delete/run
//! - `GET /health`
//! - Bearer token authentication
//! - Graceful shutdown on a cancellation token

pub mod executor;
pub mod handlers;
pub mod jsonrpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentd_config::AgentdConfig;
use agentd_cron::SchedulerService;
use agentd_hooks::{HookEvent, HookRegistry};
use agentd_queue::{AgentState, Dispatcher, TaskManager};
use agentd_storage::Storage;

use executor::{ChannelDispatcher, CommandExecutor};
use handlers::{AgentServices, handle_rpc};
use jsonrpc::{INVALID_REQUEST, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

/// Shared gateway state.
pub struct GatewayState {
    pub services: AgentServices,
    pub auth_token: Option<String>,
}

/// Build the agent runtime on top of `store` and start its background work:
/// the executor worker, queue recovery, scheduler timers and heartbeat.
pub async fn start_services(
    config: &AgentdConfig,
    store: Storage,
    hooks: Arc<HookRegistry>,
    cancel: CancellationToken,
) -> anyhow::Result<AgentServices> {
    let agent_state = AgentState::new();
    spawn_state_bridge(&agent_state, hooks.clone(), cancel.clone());

    let (dispatcher, rx) = ChannelDispatcher::channel();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);

    let tasks = Arc::new(
        TaskManager::new(store.clone(), agent_state.clone(), dispatcher.clone())
            .with_hooks(hooks.clone()),
    );

    let executor = Arc::new(CommandExecutor::new(config.executor.clone(), tasks.clone()));
    tokio::spawn(executor.run(rx, cancel));

    tasks.initialize().await?;

    let scheduler = Arc::new(
        SchedulerService::new(store, agent_state.clone(), tasks.clone(), dispatcher)
            .with_hooks(hooks)
            .with_heartbeat_period(Duration::from_secs(config.scheduler.heartbeat_secs.max(1))),
    );
    scheduler.initialize().await?;

    Ok(AgentServices {
        agent_state,
        tasks,
        scheduler,
    })
}

/// Start the Gateway server and serve until `cancel` fires.
pub async fn start_gateway(
    config: AgentdConfig,
    port_override: Option<u16>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.gateway.port);
    let host = config.gateway.host.clone();
    let auth_token = config.gateway.auth_token.clone();

    let db_path = config.database_path()?;
    let store = Storage::open(&db_path)?;

    let hooks = Arc::new(HookRegistry::new());
    hooks
        .on_any(Arc::new(|event: HookEvent| {
            Box::pin(async move {
                debug!(
                    event = event.type_name(),
                    subject = event.subject_id().unwrap_or("-"),
                    "Hook event"
                );
            })
        }))
        .await;

    let services = start_services(&config, store, hooks, cancel.clone()).await?;
    let scheduler = services.scheduler.clone();

    let state = Arc::new(GatewayState {
        services,
        auth_token,
    });
    let app = router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Gateway listening on {addr}");
    info!("  JSON-RPC: http://{addr}/rpc");
    info!("  Health:   http://{addr}/health");
    info!("  Database: {}", db_path.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    scheduler.shutdown();
    info!("Gateway stopped");
    Ok(())
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .with_state(state)
}

/// Forward idle/busy transitions to the hook registry.
fn spawn_state_bridge(agent_state: &AgentState, hooks: Arc<HookRegistry>, cancel: CancellationToken) {
    let mut rx = agent_state.subscribe();
    tokio::spawn(async move {
        loop {
            let changed = tokio::select! {
                _ = cancel.cancelled() => false,
                result = rx.changed() => result.is_ok(),
            };
            if !changed {
                break;
            }
            let state = rx.borrow_and_update().clone();
            hooks.emit(HookEvent::AgentStateChanged { state }).await;
        }
    });
}

/// GET /health: simple HTTP health check.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /rpc: one JSON-RPC request per call.
async fn rpc_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(&headers) {
            Some(token) if token == expected_token => {}
            _ => {
                warn!("RPC authentication failed");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    let response = process_rpc_message(&body, &state.services).await;
    axum::Json(response).into_response()
}

/// Parse and process a JSON-RPC message.
async fn process_rpc_message(text: &str, services: &AgentServices) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            return JsonRpcResponse::error(
                serde_json::Value::Null,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        return JsonRpcResponse::error(
            request.id,
            INVALID_REQUEST,
            "Invalid JSON-RPC version, expected '2.0'",
        );
    }

    debug!(method = %request.method, "RPC request");
    handle_rpc(&request.method, &request.params, request.id, services).await
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
