//! Runtime configuration
//!
//! Every section derives `Deserialize` with `#[serde(default)]` and takes its
//! defaults from the environment, so a TOML file only needs the keys it
//! changes. String-named strategies are parsed into enums by the `to_*`
//! helpers; unknown names are configuration errors.

use crate::context::{ContextPolicy, QuerySource, RelevanceConfig, TruncationStrategy};
use crate::media::{ExternalizerConfig, MediaLoaderConfig};
use crate::pipeline::PipelineConfig;
use crate::provider::{ProviderClientConfig, ToolChoice, ToolPolicy};
use crate::state::{InMemoryStateStore, RocksDbStateStore, StateStore};
use crate::{Result, TurnError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline: PipelineSettings,
    pub context: ContextSettings,
    pub tools: ToolSettings,
    pub provider: ProviderClientConfig,
    pub media: MediaSettings,
    pub state: StateSettings,
}

impl RuntimeConfig {
    /// Load from the TOML file named by `LOOM_TURN_CONFIG` (default `./loom_turn.toml`).
    ///
    /// A missing, unreadable or malformed file is logged and the env-driven
    /// defaults are used instead.
    pub fn load() -> Self {
        let path = env_string("LOOM_TURN_CONFIG").unwrap_or_else(|| "loom_turn.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return Self::default();
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::from_toml_str(&s) {
                Ok(cfg) => {
                    info!(target: "config", path = %path, "Loaded configuration");
                    cfg
                }
                Err(e) => {
                    warn!(target: "config", path = %path, error = %e, "Failed to parse TOML; using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(target: "config", path = %path, error = %e, "Failed to read TOML; using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TurnError::Config(format!("invalid TOML configuration: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub channel_buffer_size: usize,
    /// 0 disables the execution timeout
    pub execution_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            channel_buffer_size: env_parse("LOOM_TURN_CHANNEL_BUFFER").unwrap_or(16),
            execution_timeout_ms: env_parse("LOOM_TURN_TIMEOUT_MS").unwrap_or(120_000),
        }
    }
}

impl PipelineSettings {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            channel_buffer_size: self.channel_buffer_size,
            execution_timeout: (self.execution_timeout_ms > 0)
                .then(|| Duration::from_millis(self.execution_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceSettings {
    pub min_recent_messages: usize,
    pub similarity_threshold: f32,
    /// `last_user`, `last_n` or `custom`
    pub query_source: String,
    pub last_n_count: usize,
    pub custom_query: String,
    pub always_keep_system_role: bool,
    pub cache_embeddings: bool,
}

impl Default for RelevanceSettings {
    fn default() -> Self {
        let base = RelevanceConfig::default();
        Self {
            min_recent_messages: base.min_recent_messages,
            similarity_threshold: base.similarity_threshold,
            query_source: "last_user".into(),
            last_n_count: 3,
            custom_query: String::new(),
            always_keep_system_role: base.always_keep_system_role,
            cache_embeddings: base.cache_embeddings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// 0 means no budget
    pub token_budget: usize,
    pub reserve_for_output: usize,
    /// `fail`, `oldest`, `summarize` or `least-relevant`
    pub strategy: String,
    pub keep_system_role: bool,
    pub enable_cache_breakpoints: bool,
    /// Model name handed to the token counter
    pub model: String,
    pub relevance: RelevanceSettings,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            token_budget: env_parse("LOOM_TURN_TOKEN_BUDGET").unwrap_or(0),
            reserve_for_output: env_parse("LOOM_TURN_RESERVE_TOKENS").unwrap_or(0),
            strategy: env_string("LOOM_TURN_STRATEGY").unwrap_or_else(|| "oldest".into()),
            keep_system_role: true,
            enable_cache_breakpoints: false,
            model: env_string("LLM_MODEL").unwrap_or_default(),
            relevance: RelevanceSettings::default(),
        }
    }
}

impl ContextSettings {
    pub fn to_policy(&self) -> Result<ContextPolicy> {
        let strategy = TruncationStrategy::from_str(&self.strategy)?;
        let relevance = if strategy == TruncationStrategy::LeastRelevant {
            let r = &self.relevance;
            Some(RelevanceConfig {
                min_recent_messages: r.min_recent_messages,
                similarity_threshold: r.similarity_threshold,
                query_source: QuerySource::parse(&r.query_source, r.last_n_count, &r.custom_query)?,
                always_keep_system_role: r.always_keep_system_role,
                cache_embeddings: r.cache_embeddings,
            })
        } else {
            None
        };
        Ok(ContextPolicy {
            token_budget: self.token_budget,
            reserve_for_output: self.reserve_for_output,
            strategy,
            keep_system_role: self.keep_system_role,
            enable_cache_breakpoints: self.enable_cache_breakpoints,
            relevance,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// `auto`, `required` or `none`
    pub tool_choice: String,
    pub max_rounds: usize,
    pub max_tool_calls_per_turn: usize,
    pub blocklist: Vec<String>,
    pub call_timeout_ms: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        let base = ToolPolicy::default();
        Self {
            tool_choice: base.tool_choice.as_str().into(),
            max_rounds: env_parse("LOOM_TURN_MAX_ROUNDS").unwrap_or(base.max_rounds),
            max_tool_calls_per_turn: base.max_tool_calls_per_turn,
            blocklist: Vec::new(),
            call_timeout_ms: 30_000,
        }
    }
}

impl ToolSettings {
    pub fn to_policy(&self) -> Result<ToolPolicy> {
        Ok(ToolPolicy {
            tool_choice: ToolChoice::from_str(&self.tool_choice)?,
            max_rounds: self.max_rounds,
            max_tool_calls_per_turn: self.max_tool_calls_per_turn,
            blocklist: self.blocklist.clone(),
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    /// Directory media file paths are confined to
    pub base_dir: Option<PathBuf>,
    pub http_timeout_ms: u64,
    pub max_url_bytes: u64,
    pub max_file_bytes: u64,
    /// Root of the file-backed media store; in-memory when unset
    pub storage_dir: Option<PathBuf>,
    pub reinline_history: bool,
    pub passthrough_on_error: bool,
    pub externalize: ExternalizerConfig,
}

impl Default for MediaSettings {
    fn default() -> Self {
        let loader = MediaLoaderConfig::default();
        Self {
            base_dir: env_string("LOOM_TURN_MEDIA_DIR").map(PathBuf::from),
            http_timeout_ms: loader.http_timeout.as_millis() as u64,
            max_url_bytes: loader.max_url_bytes,
            max_file_bytes: loader.max_file_bytes,
            storage_dir: env_string("LOOM_TURN_MEDIA_STORE").map(PathBuf::from),
            reinline_history: false,
            passthrough_on_error: true,
            externalize: ExternalizerConfig::default(),
        }
    }
}

impl MediaSettings {
    pub fn loader_config(&self) -> MediaLoaderConfig {
        MediaLoaderConfig {
            base_dir: self.base_dir.clone(),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            max_url_bytes: self.max_url_bytes,
            max_file_bytes: self.max_file_bytes,
        }
    }
}

/// Which state store backs the turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    RocksDb(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// `memory` or `rocksdb`
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            backend: env_string("LOOM_TURN_STATE_BACKEND").unwrap_or_else(|| "memory".into()),
            path: env_string("LOOM_TURN_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/turn_state")),
        }
    }
}

impl StateSettings {
    pub fn backend(&self) -> Result<StateBackend> {
        match self.backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(StateBackend::Memory),
            "rocksdb" => Ok(StateBackend::RocksDb(self.path.clone())),
            other => Err(TurnError::Config(format!(
                "unknown state backend '{other}' (expected memory or rocksdb)"
            ))),
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        let store: Arc<dyn StateStore> = match self.backend()? {
            StateBackend::Memory => InMemoryStateStore::new(),
            StateBackend::RocksDb(path) => {
                info!(target: "config", path = %path.display(), "Opening RocksDB state store");
                RocksDbStateStore::open(path)?
            }
        };
        Ok(store)
    }
}
