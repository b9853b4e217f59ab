use super::error::{ToolError, ToolResult};
use super::traits::{Tool, ToolDescriptor};
use crate::types::{ToolCall, ToolResultRecord};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared, internally synchronized set of tools
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
    call_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(DashMap::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        info!(target: "tool_registry", tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Descriptors for the provider request, sorted by name.
    ///
    /// With `allowed` set, only those names are exported.
    pub fn descriptors(&self, allowed: Option<&[String]>) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .filter(|t| allowed.map_or(true, |a| a.iter().any(|n| n == t.key())))
            .map(|t| t.value().descriptor())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Call a tool by name under the registry timeout
    #[tracing::instrument(skip(self, arguments), fields(tool.name = %name))]
    pub async fn call(&self, name: &str, arguments: Value) -> ToolResult<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        debug!(target: "tool_registry", tool = %name, "Invoking tool");
        match timeout(self.call_timeout, tool.call(arguments)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target: "tool_registry", tool = %name, "Tool execution timed out");
                Err(ToolError::Timeout {
                    tool: name.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run a model-issued tool call; failures are reported in the record
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResultRecord {
        let started = Instant::now();
        let result = self.call(&call.name, call.arguments.clone()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => ToolResultRecord {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: render_output(&value),
                error: None,
                latency_ms,
            },
            Err(e) => {
                warn!(target: "tool_registry", tool = %call.name, error = %e, "Tool execution failed");
                ToolResultRecord {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: format!("Error: {e}"),
                    error: Some(e.to_string()),
                    latency_ms,
                }
            }
        }
    }
}

/// Strings pass through, everything else is pretty-printed JSON
fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
