use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use agentd_config::AgentdConfig;
use agentd_gateway::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// JSON-RPC client for a running gateway.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Explicit `url`/`token` win over the gateway section of the config.
    pub fn new(config: &AgentdConfig, url: Option<String>, token: Option<String>) -> Self {
        let url = url.unwrap_or_else(|| {
            format!("http://{}:{}/rpc", config.gateway.host, config.gateway.port)
        });
        Self {
            http: reqwest::Client::new(),
            url,
            token: token.or_else(|| config.gateway.auth_token.clone()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, json!(id));

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", self.url))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!("Gateway rejected the auth token");
        }
        let response: JsonRpcResponse = response
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse response")?;

        if let Some(err) = response.error {
            anyhow::bail!("RPC error [{}]: {}", err.code, err.message);
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}
