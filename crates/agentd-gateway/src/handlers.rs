//! JSON-RPC method handlers.

use std::sync::Arc;

use serde_json::{Value, json};

use agentd_cron::{SchedulerError, SchedulerService};
use agentd_queue::{AgentState, TaskError, TaskManager};
use agentd_types::{CreatedBy, ScheduleType, ScheduledTaskUpdate};

use crate::jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, JsonRpcResponse, METHOD_NOT_FOUND};

/// The managers exposed over RPC.
pub struct AgentServices {
    pub agent_state: AgentState,
    pub tasks: Arc<TaskManager>,
    pub scheduler: Arc<SchedulerService>,
}

/// Route a JSON-RPC request to the appropriate handler.
pub async fn handle_rpc(
    method: &str,
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    match method {
        "health" => handle_health(id),
        "agent.state" => JsonRpcResponse::success(id, json!(services.agent_state.get())),
        "tasks.list" => handle_tasks_list(id, services, false).await,
        "tasks.active" => handle_tasks_list(id, services, true).await,
        "tasks.get" => handle_tasks_get(params, id, services).await,
        "tasks.add" => handle_tasks_add(params, id, services).await,
        "tasks.complete" => handle_tasks_complete(params, id, services).await,
        "tasks.fail" => handle_tasks_fail(params, id, services).await,
        "tasks.current" => JsonRpcResponse::success(
            id,
            json!({ "taskId": services.tasks.get_current_task_id() }),
        ),
        "schedules.list" => handle_schedules_list(id, services, false).await,
        "schedules.active" => handle_schedules_list(id, services, true).await,
        "schedules.get" => handle_schedules_get(params, id, services).await,
        "schedules.add" => handle_schedules_add(params, id, services).await,
        "schedules.update" => handle_schedules_update(params, id, services).await,
        "schedules.delete" => handle_schedules_delete(params, id, services).await,
        "schedules.run" => handle_schedules_run(params, id, services).await,
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}")),
    }
}

fn handle_health(id: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn missing(id: Value, key: &str) -> JsonRpcResponse {
    JsonRpcResponse::error(id, INVALID_PARAMS, format!("Missing '{key}' parameter"))
}

fn task_error(id: Value, e: TaskError) -> JsonRpcResponse {
    match e {
        TaskError::Validation(message) => JsonRpcResponse::error(id, INVALID_PARAMS, message),
        other => JsonRpcResponse::error(id, INTERNAL_ERROR, other.to_string()),
    }
}

fn scheduler_error(id: Value, e: SchedulerError) -> JsonRpcResponse {
    match e {
        SchedulerError::Storage(_) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
        _ => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
    }
}

async fn handle_tasks_list(id: Value, services: &AgentServices, active_only: bool) -> JsonRpcResponse {
    let result = if active_only {
        services.tasks.get_active_tasks().await
    } else {
        services.tasks.get_all_tasks().await
    };
    match result {
        Ok(tasks) => JsonRpcResponse::success(id, json!({ "tasks": tasks })),
        Err(e) => task_error(id, e),
    }
}

/// tasks.get
///
/// Params:
///   - id: string (required)
async fn handle_tasks_get(params: &Value, id: Value, services: &AgentServices) -> JsonRpcResponse {
    let Some(task_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    match services.tasks.get_task(task_id).await {
        Ok(task) => JsonRpcResponse::success(id, json!({ "task": task })),
        Err(e) => task_error(id, e),
    }
}

/// tasks.add: append to the queue.
///
/// Params:
///   - description: string (required)
async fn handle_tasks_add(params: &Value, id: Value, services: &AgentServices) -> JsonRpcResponse {
    let Some(description) = str_param(params, "description") else {
        return missing(id, "description");
    };
    match services.tasks.add_task(description).await {
        Ok(task) => JsonRpcResponse::success(id, json!({ "task": task })),
        Err(e) => task_error(id, e),
    }
}

/// tasks.complete
///
/// Params:
///   - id: string (required)
///   - resultSummary: string (optional)
async fn handle_tasks_complete(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(task_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    let summary = str_param(params, "resultSummary").map(String::from);
    match services.tasks.handle_task_completion(task_id, summary).await {
        Ok(()) => JsonRpcResponse::success(id, json!({ "ok": true })),
        Err(e) => task_error(id, e),
    }
}

/// tasks.fail
///
/// Params:
///   - id: string (required)
///   - reason: string (required)
async fn handle_tasks_fail(params: &Value, id: Value, services: &AgentServices) -> JsonRpcResponse {
    let Some(task_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    let Some(reason) = str_param(params, "reason") else {
        return missing(id, "reason");
    };
    match services.tasks.handle_task_failure(task_id, reason).await {
        Ok(()) => JsonRpcResponse::success(id, json!({ "ok": true })),
        Err(e) => task_error(id, e),
    }
}

async fn handle_schedules_list(
    id: Value,
    services: &AgentServices,
    active_only: bool,
) -> JsonRpcResponse {
    let result = if active_only {
        services.scheduler.get_active_scheduled_tasks().await
    } else {
        services.scheduler.get_all_scheduled_tasks().await
    };
    match result {
        Ok(schedules) => JsonRpcResponse::success(id, json!({ "schedules": schedules })),
        Err(e) => scheduler_error(id, e),
    }
}

async fn handle_schedules_get(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(schedule_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    match services.scheduler.get_scheduled_task(schedule_id).await {
        Ok(schedule) => JsonRpcResponse::success(id, json!({ "schedule": schedule })),
        Err(e) => scheduler_error(id, e),
    }
}

/// schedules.add
///
/// Params:
///   - description: string (required)
///   - type: once | interval | recurring | heartbeat | runloop (required)
///   - schedule: string (required)
///   - createdBy: user | agent (optional, default user)
async fn handle_schedules_add(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(description) = str_param(params, "description") else {
        return missing(id, "description");
    };
    let Some(schedule) = str_param(params, "schedule") else {
        return missing(id, "schedule");
    };
    let task_type = match str_param(params, "type").map(str::parse::<ScheduleType>) {
        Some(Ok(t)) => t,
        Some(Err(e)) => return JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        None => return missing(id, "type"),
    };
    let created_by = match str_param(params, "createdBy").map(str::parse::<CreatedBy>) {
        Some(Ok(c)) => c,
        Some(Err(e)) => return JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        None => CreatedBy::default(),
    };

    match services
        .scheduler
        .add_scheduled_task(description, task_type, schedule, created_by)
        .await
    {
        Ok(schedule) => JsonRpcResponse::success(id, json!({ "schedule": schedule })),
        Err(e) => scheduler_error(id, e),
    }
}

/// schedules.update
///
/// Params:
///   - id: string (required)
///   - description, type, schedule, status, nextRunTime (optional)
async fn handle_schedules_update(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(schedule_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    let updates: ScheduledTaskUpdate = match serde_json::from_value(params.clone()) {
        Ok(u) => u,
        Err(e) => {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid update: {e}"));
        }
    };

    match services
        .scheduler
        .update_scheduled_task(schedule_id, updates)
        .await
    {
        Ok(schedule) => JsonRpcResponse::success(id, json!({ "schedule": schedule })),
        Err(e) => scheduler_error(id, e),
    }
}

async fn handle_schedules_delete(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(schedule_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    match services.scheduler.delete_scheduled_task(schedule_id).await {
        Ok(deleted) => JsonRpcResponse::success(id, json!({ "deleted": deleted })),
        Err(e) => scheduler_error(id, e),
    }
}

/// schedules.run: fire a scheduled task now.
async fn handle_schedules_run(
    params: &Value,
    id: Value,
    services: &AgentServices,
) -> JsonRpcResponse {
    let Some(schedule_id) = str_param(params, "id") else {
        return missing(id, "id");
    };
    match services.scheduler.run_now(schedule_id).await {
        Ok(schedule) => JsonRpcResponse::success(id, json!({ "schedule": schedule })),
        Err(e) => scheduler_error(id, e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use agentd_queue::Dispatcher;
    use agentd_storage::Storage;
    use agentd_types::AgentTask;
    use async_trait::async_trait;

    struct NoopDispatcher;

    #[async_trait]
    impl Dispatcher for NoopDispatcher {
        async fn trigger_agent_processing(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn trigger_next_task_processing(&self, _task: AgentTask) {}
    }

    pub(crate) async fn test_services() -> AgentServices {
        let store = Storage::open_in_memory().unwrap();
        let agent_state = AgentState::new();
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(NoopDispatcher);
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            agent_state.clone(),
            dispatcher.clone(),
        ));
        tasks.initialize().await.unwrap();
        let scheduler = Arc::new(SchedulerService::new(
            store,
            agent_state.clone(),
            tasks.clone(),
            dispatcher,
        ));
        AgentServices {
            agent_state,
            tasks,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_health() {
        let services = test_services().await;
        let resp = handle_rpc("health", &Value::Null, json!(1), &services).await;
        assert_eq!(resp.result.unwrap()["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let services = test_services().await;
        let resp = handle_rpc("tasks.explode", &json!({}), json!(1), &services).await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_lifecycle_over_rpc() {
        let services = test_services().await;

        let added = handle_rpc(
            "tasks.add",
            &json!({ "description": "write report" }),
            json!(1),
            &services,
        )
        .await;
        let task_id = added.result.unwrap()["task"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let current = handle_rpc("tasks.current", &json!({}), json!(2), &services).await;
        assert_eq!(current.result.unwrap()["taskId"], task_id.as_str());

        let state = handle_rpc("agent.state", &json!({}), json!(3), &services).await;
        assert_eq!(state.result.unwrap()["isIdle"], false);

        let done = handle_rpc(
            "tasks.complete",
            &json!({ "id": task_id, "resultSummary": "sent" }),
            json!(4),
            &services,
        )
        .await;
        assert!(done.error.is_none());

        let fetched = handle_rpc("tasks.get", &json!({ "id": task_id }), json!(5), &services).await;
        let task = &fetched.result.unwrap()["task"];
        assert_eq!(task["status"], "completed");
        assert_eq!(task["resultSummary"], "sent");

        let active = handle_rpc("tasks.active", &json!({}), json!(6), &services).await;
        assert_eq!(active.result.unwrap()["tasks"], json!([]));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let services = test_services().await;

        let resp = handle_rpc("tasks.add", &json!({}), json!(1), &services).await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);

        let resp = handle_rpc(
            "tasks.add",
            &json!({ "description": "" }),
            json!(2),
            &services,
        )
        .await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);

        let resp = handle_rpc(
            "schedules.add",
            &json!({ "description": "x", "type": "hourly", "schedule": "1" }),
            json!(3),
            &services,
        )
        .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.message.contains("hourly"));

        let resp = handle_rpc(
            "schedules.add",
            &json!({ "description": "x", "type": "interval", "schedule": "soon" }),
            json!(4),
            &services,
        )
        .await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle_over_rpc() {
        let services = test_services().await;

        let added = handle_rpc(
            "schedules.add",
            &json!({
                "description": "check inbox",
                "type": "interval",
                "schedule": "5",
                "createdBy": "agent",
            }),
            json!(1),
            &services,
        )
        .await;
        let schedule = added.result.unwrap()["schedule"].clone();
        assert_eq!(schedule["type"], "interval");
        assert_eq!(schedule["createdBy"], "agent");
        let schedule_id = schedule["id"].as_str().unwrap().to_string();

        let later = agentd_types::now_millis() + 3_600_000;
        let moved = handle_rpc(
            "schedules.update",
            &json!({ "id": schedule_id, "nextRunTime": later }),
            json!(7),
            &services,
        )
        .await;
        assert_eq!(moved.result.unwrap()["schedule"]["nextRunTime"], later);

        let updated = handle_rpc(
            "schedules.update",
            &json!({ "id": schedule_id, "status": "paused" }),
            json!(2),
            &services,
        )
        .await;
        assert_eq!(updated.result.unwrap()["schedule"]["status"], "paused");

        let active = handle_rpc("schedules.active", &json!({}), json!(3), &services).await;
        assert_eq!(active.result.unwrap()["schedules"], json!([]));

        let deleted = handle_rpc(
            "schedules.delete",
            &json!({ "id": schedule_id }),
            json!(4),
            &services,
        )
        .await;
        assert_eq!(deleted.result.unwrap()["deleted"], true);

        let again = handle_rpc(
            "schedules.delete",
            &json!({ "id": schedule_id }),
            json!(5),
            &services,
        )
        .await;
        assert_eq!(again.result.unwrap()["deleted"], true);

        let missing = handle_rpc(
            "schedules.update",
            &json!({ "id": schedule_id, "description": "gone" }),
            json!(6),
            &services,
        )
        .await;
        assert!(missing.result.unwrap()["schedule"].is_null());
    }
}
