use super::policy::ToolChoice;
use crate::tools::ToolDescriptor;
use crate::types::{ContentPart, CostInfo, Message, ToolCall};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Everything a provider needs for one invocation
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: ToolChoice,
    /// Mark stable prefixes as cacheable where the vendor supports it
    pub cache_breakpoints: bool,
}

/// A completed provider answer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    /// Generated media, if any
    pub parts: Vec<ContentPart>,
    pub tool_calls: Vec<ToolCall>,
    pub cost: CostInfo,
    pub finish_reason: String,
    pub raw: Option<Value>,
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: "stop".into(),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: "tool_calls".into(),
            ..Default::default()
        }
    }
}

/// Incremental output of a streaming invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Delta(String),
    /// Always the last chunk of a successful stream
    Done(ProviderResponse),
}

/// Media formats the provider accepts; empty lists mean no restriction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub audio_formats: Vec<String>,
    #[serde(default)]
    pub image_formats: Vec<String>,
    #[serde(default)]
    pub video_formats: Vec<String>,
    #[serde(default)]
    pub streaming: bool,
}

impl ProviderCapabilities {
    pub fn has_format_restrictions(&self) -> bool {
        !self.audio_formats.is_empty() || !self.image_formats.is_empty() || !self.video_formats.is_empty()
    }
}

/// A language-model backend
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn predict(&self, request: &ProviderRequest) -> Result<ProviderResponse>;

    /// Streaming variant; the default emits the whole answer as one delta
    async fn predict_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>> {
        let response = self.predict(request).await?;
        let (tx, rx) = mpsc::channel(2);
        if !response.content.is_empty() {
            let _ = tx.send(Ok(StreamChunk::Delta(response.content.clone()))).await;
        }
        let _ = tx.send(Ok(StreamChunk::Done(response))).await;
        Ok(rx)
    }
}
