use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use reach_core::config::HostedAdapterConfig;
use reach_core::error::{ReachError, Result};
use reach_core::traits::ToolAdapter;
use reach_core::types::{AdapterKind, ToolCall, ToolResult};

use super::parse_reply;

/// Forwards tool calls to an HTTP endpoint.
///
/// The call is POSTed as JSON. A non-2xx status becomes a failed
/// [`ToolResult`]; transport errors surface as [`ReachError::Adapter`].
pub struct HostedAdapter {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl HostedAdapter {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("Reach/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReachError::Adapter {
                adapter: name.clone(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            name,
            endpoint: endpoint.into(),
            api_key: None,
            timeout_ms: 30_000,
            client,
        })
    }

    pub fn from_config(config: &HostedAdapterConfig) -> Result<Self> {
        let mut adapter = Self::new(&config.name, &config.endpoint)?;
        adapter.api_key = config.api_key.clone().filter(|k| !k.is_empty());
        adapter.timeout_ms = config.timeout_ms;
        Ok(adapter)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    fn adapter_error(&self, message: String) -> ReachError {
        ReachError::Adapter {
            adapter: self.name.clone(),
            message,
        }
    }
}

impl ToolAdapter for HostedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Hosted
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            debug!(adapter = %self.name, tool = %call.tool, endpoint = %self.endpoint, "Invoking hosted tool");

            let mut req = self.client.post(&self.endpoint).json(&call);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| self.adapter_error(format!("Request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolResult::failure(
                    &call,
                    format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    ),
                ));
            }

            let reply: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| self.adapter_error(format!("Invalid response body: {}", e)))?;

            Ok(parse_reply(&call, reply))
        })
    }
}
