use super::error::ToolResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a provider is told about a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

/// A callable tool exposed to the model
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call this tool
    fn name(&self) -> String;

    fn description(&self) -> String;

    /// JSON Schema for the arguments
    fn parameters(&self) -> Value;

    /// Run the tool with already-parsed arguments
    async fn call(&self, arguments: Value) -> ToolResult<Value>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name(),
            description: self.description(),
            parameters: self.parameters(),
        }
    }
}
