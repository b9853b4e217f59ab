//! Conversation data model.
//!
//! This module defines the values that flow through a turn:
//! - Message: one entry in a conversation, text or multimodal
//! - ContentPart / MediaContent: multimodal payloads and where they come from
//! - ToolCall / ToolResultRecord: tool round bookkeeping
//! - ConversationState: what the state store persists per conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Free-form metadata carried by messages, elements and conversation state
pub type Metadata = HashMap<String, Value>;

/// Source tag for messages loaded from the state store during this turn
pub const SOURCE_HISTORY: &str = "statestore";

/// Source tag for synthetic summaries produced by the context builder
pub const SOURCE_SUMMARY: &str = "context_summary";

/// Roles for messages in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single conversation message.
///
/// When `parts` is non-empty it is authoritative and `content` is ignored for
/// anything that reads message text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultRecord>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub latency_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,

    /// Where the message came from (`statestore`, `context_summary`, or unset for this turn)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: Metadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_result: None,
            timestamp: Utc::now(),
            latency_ms: 0,
            cost: None,
            source: None,
            meta: Metadata::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Build a tool-result message from a dispatch outcome
    pub fn tool(result: ToolResultRecord) -> Self {
        let mut msg = Self::new(Role::Tool, result.content.clone());
        msg.tool_result = Some(result);
        msg
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = parts;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Text view of the message: joined text parts when multimodal, else `content`
    pub fn text(&self) -> String {
        if self.parts.is_empty() {
            return self.content.clone();
        }
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_multimodal(&self) -> bool {
        self.parts.iter().any(|p| p.media().is_some())
    }

    pub fn is_from_history(&self) -> bool {
        self.source.as_deref() == Some(SOURCE_HISTORY)
    }

    /// Whether the state store should append this message on save
    pub fn is_persistable(&self) -> bool {
        !matches!(
            self.source.as_deref(),
            Some(SOURCE_HISTORY) | Some(SOURCE_SUMMARY)
        )
    }
}

/// Content category used for MIME matching and part tagging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Audio => "audio",
            ContentType::Video => "video",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of a multimodal message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { media: MediaContent },
    Audio { media: MediaContent },
    Video { media: MediaContent },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            ContentPart::Text { .. } => ContentType::Text,
            ContentPart::Image { .. } => ContentType::Image,
            ContentPart::Audio { .. } => ContentType::Audio,
            ContentPart::Video { .. } => ContentType::Video,
        }
    }

    pub fn media(&self) -> Option<&MediaContent> {
        match self {
            ContentPart::Text { .. } => None,
            ContentPart::Image { media } | ContentPart::Audio { media } | ContentPart::Video { media } => {
                Some(media)
            }
        }
    }

    pub fn media_mut(&mut self) -> Option<&mut MediaContent> {
        match self {
            ContentPart::Text { .. } => None,
            ContentPart::Image { media } | ContentPart::Audio { media } | ContentPart::Video { media } => {
                Some(media)
            }
        }
    }
}

/// Where a media payload lives. Exactly one source per value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Url(String),
    File(String),
    /// Base64 payload
    Inline(String),
    Storage(String),
}

impl MediaSource {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaSource::Url(_) => "url",
            MediaSource::File(_) => "file",
            MediaSource::Inline(_) => "inline",
            MediaSource::Storage(_) => "storage",
        }
    }

    /// Short identifier for diagnostics; inline payloads are not echoed
    pub fn describe(&self) -> String {
        match self {
            MediaSource::Url(u) => u.clone(),
            MediaSource::File(p) => p.clone(),
            MediaSource::Inline(d) => format!("inline ({} bytes base64)", d.len()),
            MediaSource::Storage(r) => r.clone(),
        }
    }
}

/// A media attachment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaContent {
    pub source: MediaSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Resolution hint for images ("low", "high", "auto")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MediaContent {
    pub fn new(source: MediaSource) -> Self {
        Self {
            source,
            mime_type: None,
            detail: None,
        }
    }

    pub fn inline(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::new(MediaSource::Inline(data.into())).with_mime(mime_type)
    }

    pub fn with_mime(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn inline_data(&self) -> Option<&str> {
        match &self.source {
            MediaSource::Inline(d) => Some(d.as_str()),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Outcome of one tool invocation, attached to the `tool` role message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: u64,
}

/// Token and cost accounting for provider calls
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub input_cost_usd: f64,
    #[serde(default)]
    pub output_cost_usd: f64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl CostInfo {
    pub fn accumulate(&mut self, other: &CostInfo) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.input_cost_usd += other.input_cost_usd;
        self.output_cost_usd += other.output_cost_usd;
        self.total_cost_usd += other.total_cost_usd;
    }
}

/// Persisted conversation: id, owner, ordered messages and free-form metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            messages: Vec::new(),
            metadata: Metadata::new(),
            updated_at: Utc::now(),
        }
    }

    /// Number of user turns recorded so far
    pub fn turn_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }
}
