use super::policy::ToolChoice;
use super::traits::{Provider, ProviderCapabilities, ProviderRequest, ProviderResponse};
use crate::types::{ContentPart, CostInfo, Message, Role, ToolCall};
use crate::{Result, TurnError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

/// Settings for an OpenAI-compatible chat-completions endpoint, env-driven by default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderClientConfig {
    pub base_url: String, // e.g., http://localhost:8000/v1
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// USD per 1k prompt tokens
    pub input_cost_per_1k: f64,
    /// USD per 1k completion tokens
    pub output_cost_per_1k: f64,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
}

impl Default for ProviderClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "qwen2.5-0.5b-instruct".to_string()),
            api_key: std::env::var("LLM_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("LLM_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(0.7),
            max_tokens: 1024,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            capabilities: ProviderCapabilities::default(),
        }
    }
}

/// Chat-completions client usable with vLLM, OpenAI and compatible servers
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    id: String,
    http: Client,
    cfg: ProviderClientConfig,
}

impl OpenAiCompatProvider {
    pub fn new(cfg: ProviderClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| TurnError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            id: format!("openai-compat:{}", cfg.model),
            http,
            cfg,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ProviderClientConfig::default())
    }

    fn request_body(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": request.system_prompt}));
        }
        messages.extend(request.messages.iter().map(message_to_wire));

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
        });
        if !request.tools.is_empty() && request.tool_choice != ToolChoice::None {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!(request.tool_choice.as_str());
        }
        body
    }

    fn cost_from_usage(&self, usage: Option<&Value>) -> CostInfo {
        let Some(usage) = usage else {
            return CostInfo::default();
        };
        let read = |v: Option<&Value>| v.and_then(Value::as_u64).unwrap_or(0);
        let input_tokens = read(usage.get("prompt_tokens"));
        let output_tokens = read(usage.get("completion_tokens"));
        let cached_tokens = read(
            usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens")),
        );
        let input_cost_usd = input_tokens as f64 / 1000.0 * self.cfg.input_cost_per_1k;
        let output_cost_usd = output_tokens as f64 / 1000.0 * self.cfg.output_cost_per_1k;
        CostInfo {
            input_tokens,
            output_tokens,
            cached_tokens,
            input_cost_usd,
            output_cost_usd,
            total_cost_usd: input_cost_usd + output_cost_usd,
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.cfg.capabilities.clone()
    }

    async fn predict(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        debug!(target: "provider", url = %url, tools = request.tools.len(), "POST chat completions");

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| TurnError::Provider(format!("Chat Completions request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target: "provider", %status, body = %text, "Chat Completions error");
            return Err(TurnError::Provider(format!(
                "Chat Completions error: status={status} body={text}"
            )));
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| TurnError::Provider(format!("Failed to parse Chat Completions JSON: {e}")))?;
        let tool_calls = parse_tool_calls(&val);
        let content = extract_text(&val).unwrap_or_default();
        if content.is_empty() && tool_calls.is_empty() {
            return Err(TurnError::Provider(
                "No tool calls and no assistant text in model output".into(),
            ));
        }
        let finish_reason = val
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .unwrap_or(if tool_calls.is_empty() { "stop" } else { "tool_calls" })
            .to_string();

        Ok(ProviderResponse {
            content,
            parts: Vec::new(),
            tool_calls,
            cost: self.cost_from_usage(val.get("usage")),
            finish_reason,
            raw: Some(val),
        })
    }
}

/// Wire form of one message
fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => {
            let call_id = msg
                .tool_result
                .as_ref()
                .map(|r| r.call_id.clone())
                .unwrap_or_default();
            json!({"role": "tool", "tool_call_id": call_id, "content": msg.text()})
        }
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments.to_string()},
                    })
                })
                .collect();
            json!({"role": "assistant", "content": msg.text(), "tool_calls": calls})
        }
        role if msg.is_multimodal() => {
            let parts: Vec<Value> = msg.parts.iter().filter_map(part_to_wire).collect();
            json!({"role": role.as_str(), "content": parts})
        }
        role => json!({"role": role.as_str(), "content": msg.text()}),
    }
}

fn part_to_wire(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
        ContentPart::Image { media } => {
            let url = match (media.inline_data(), &media.source) {
                (Some(data), _) => format!(
                    "data:{};base64,{data}",
                    media.mime_type.as_deref().unwrap_or("image/png")
                ),
                (None, crate::types::MediaSource::Url(u)) => u.clone(),
                _ => return None,
            };
            let mut image_url = json!({"url": url});
            if let Some(detail) = &media.detail {
                image_url["detail"] = json!(detail);
            }
            Some(json!({"type": "image_url", "image_url": image_url}))
        }
        ContentPart::Audio { media } => {
            let data = media.inline_data()?;
            let format = media
                .mime_type
                .as_deref()
                .and_then(|m| m.split('/').nth(1))
                .map(|f| if f == "mpeg" { "mp3" } else { f })
                .unwrap_or("wav");
            Some(json!({"type": "input_audio", "input_audio": {"data": data, "format": format}}))
        }
        ContentPart::Video { .. } => None,
    }
}

pub fn extract_text(v: &Value) -> Option<String> {
    v.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Tool calls from `choices[0].message.tool_calls`; string arguments are parsed as JSON
pub fn parse_tool_calls(v: &Value) -> Vec<ToolCall> {
    let Some(arr) = v
        .pointer("/choices/0/message/tool_calls")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    arr.iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let func = tc.get("function")?;
            let name = func.get("name").and_then(Value::as_str).unwrap_or("");
            if name.is_empty() {
                return None;
            }
            let arguments = match func.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(json!({})),
                Some(v) => v.clone(),
                None => json!({}),
            };
            let id = tc
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{i}"));
            Some(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            })
        })
        .collect()
}
