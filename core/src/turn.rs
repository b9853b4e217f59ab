//! Turn assembly
//!
//! `TurnServices` holds the collaborators shared across turns. `TurnConfig`
//! is the immutable per-turn configuration. `TurnPipeline::build` wires fresh
//! stage instances from both, in this order:
//!
//! load → variables → prompt → template → context → media resolve →
//! media convert → provider → externalize → guardrails → assertions → save →
//! assertion verdict
//!
//! Optional stages are left out when they have nothing to do.

use crate::config::RuntimeConfig;
use crate::context::{create_counter, ContextBuilderStage, ContextPolicy, ContextWindowBuilder, EmbeddingProvider, Summarizer, TokenCounter};
use crate::media::{
    ExternalizerConfig, FileMediaStore, InMemoryMediaStore, MediaConvertConfig, MediaConvertStage, MediaConverter,
    MediaExternalizer, MediaExternalizerStage, MediaLoader, MediaLoaderConfig, MediaResolveStage, MediaStorageService,
};
use crate::pipeline::{
    keys, ExecutionResult, Pipeline, PipelineConfig, PipelineStream, PromptAssemblyStage, PromptRegistry,
    StreamElement, TemplateStage, VariableInjectionStage,
};
use crate::provider::{OpenAiCompatProvider, Provider, ProviderStage, ToolPolicy};
use crate::state::{StateStore, StateStoreLoadStage, StateStoreSaveStage};
use crate::tools::ToolRegistry;
use crate::types::{CostInfo, Message, Metadata};
use crate::validation::{AssertionConfig, AssertionStage, AssertionVerdictStage, GuardrailStage, ValidatorSpec};
use crate::{Result, TurnError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument};

/// Collaborators shared by every turn; all internally synchronized
#[derive(Clone)]
pub struct TurnServices {
    pub state_store: Arc<dyn StateStore>,
    pub provider: Arc<dyn Provider>,
    pub tools: Option<ToolRegistry>,
    pub media_storage: Option<Arc<dyn MediaStorageService>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub prompts: Option<Arc<dyn PromptRegistry>>,
    pub token_counter: Arc<dyn TokenCounter>,
}

impl TurnServices {
    pub fn new(state_store: Arc<dyn StateStore>, provider: Arc<dyn Provider>) -> Self {
        Self {
            state_store,
            provider,
            tools: None,
            media_storage: None,
            embedder: None,
            summarizer: None,
            prompts: None,
            token_counter: create_counter(""),
        }
    }

    /// Services backed by the configured state store, an OpenAI-compatible
    /// provider and a media store (file-backed when a directory is set)
    pub async fn from_config(cfg: &RuntimeConfig) -> Result<Self> {
        let state_store = cfg.state.open_store()?;
        let provider = Arc::new(OpenAiCompatProvider::new(cfg.provider.clone())?);
        let media_storage: Arc<dyn MediaStorageService> = match &cfg.media.storage_dir {
            Some(dir) => FileMediaStore::open(dir).await?,
            None => InMemoryMediaStore::new(),
        };
        Ok(Self::new(state_store, provider)
            .with_tools(ToolRegistry::new().with_timeout(cfg.tools.call_timeout()))
            .with_media_storage(media_storage)
            .with_token_counter(create_counter(&cfg.context.model)))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_media_storage(mut self, storage: Arc<dyn MediaStorageService>) -> Self {
        self.media_storage = Some(storage);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptRegistry>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }
}

/// Immutable configuration for one turn
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub conversation_id: String,
    pub user_id: String,
    pub task_type: String,
    pub variables: HashMap<String, String>,
    /// Merged into every element; carried into the saved conversation metadata
    pub metadata: Metadata,
    pub pipeline: PipelineConfig,
    pub context: ContextPolicy,
    pub tool_policy: ToolPolicy,
    pub media_loader: MediaLoaderConfig,
    pub reinline_history: bool,
    pub convert_passthrough_on_error: bool,
    pub externalizer: ExternalizerConfig,
    pub validators: Vec<ValidatorSpec>,
    pub assertions: Vec<AssertionConfig>,
}

impl TurnConfig {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            task_type: String::new(),
            variables: HashMap::new(),
            metadata: Metadata::new(),
            pipeline: PipelineConfig::default(),
            context: ContextPolicy::default(),
            tool_policy: ToolPolicy::default(),
            media_loader: MediaLoaderConfig::default(),
            reinline_history: false,
            convert_passthrough_on_error: true,
            externalizer: ExternalizerConfig::default(),
            validators: Vec::new(),
            assertions: Vec::new(),
        }
    }

    /// Per-turn configuration from runtime settings; strategy names are parsed here
    pub fn from_runtime(
        cfg: &RuntimeConfig,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            pipeline: cfg.pipeline.to_pipeline_config(),
            context: cfg.context.to_policy()?,
            tool_policy: cfg.tools.to_policy()?,
            media_loader: cfg.media.loader_config(),
            reinline_history: cfg.media.reinline_history,
            convert_passthrough_on_error: cfg.media.passthrough_on_error,
            externalizer: cfg.media.externalize.clone(),
            ..Self::new(conversation_id, user_id)
        })
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context = policy;
        self
    }

    pub fn tool_policy(mut self, policy: ToolPolicy) -> Self {
        self.tool_policy = policy;
        self
    }

    pub fn validators(mut self, validators: Vec<ValidatorSpec>) -> Self {
        self.validators = validators;
        self
    }

    pub fn assertions(mut self, assertions: Vec<AssertionConfig>) -> Self {
        self.assertions = assertions;
        self
    }
}

/// What a completed turn produced
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Final assistant message
    pub response: Option<Message>,
    /// Messages produced this turn (user input, tool rounds, answer)
    pub messages: Vec<Message>,
    /// Concatenated streamed text
    pub streamed_text: String,
    pub metadata: Metadata,
    pub cost: CostInfo,
}

impl TurnOutcome {
    fn from_result(result: ExecutionResult) -> Self {
        let cost = result
            .metadata
            .get(keys::COST)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Self {
            response: result.response,
            messages: result
                .messages
                .into_iter()
                .filter(Message::is_persistable)
                .collect(),
            streamed_text: result.text,
            metadata: result.metadata,
            cost,
        }
    }

    pub fn response_text(&self) -> String {
        self.response.as_ref().map(Message::text).unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.metadata.get(keys::FINISH_REASON).and_then(|v| v.as_str())
    }
}

/// The staged pipeline for one turn of one conversation
pub struct TurnPipeline {
    pipeline: Pipeline,
    conversation_id: String,
}

impl TurnPipeline {
    pub fn build(services: &TurnServices, config: TurnConfig) -> Result<Self> {
        let TurnConfig {
            conversation_id,
            user_id,
            task_type,
            variables,
            metadata,
            pipeline: pipeline_config,
            context,
            tool_policy,
            media_loader,
            reinline_history,
            convert_passthrough_on_error,
            externalizer,
            validators,
            assertions,
        } = config;

        let mut context_builder = ContextWindowBuilder::new(context, Arc::clone(&services.token_counter));
        if let Some(embedder) = &services.embedder {
            context_builder = context_builder.with_embedder(Arc::clone(embedder));
        }
        if let Some(summarizer) = &services.summarizer {
            context_builder = context_builder.with_summarizer(Arc::clone(summarizer));
        }
        context_builder.validate()?;

        let loader = MediaLoader::new(media_loader, services.media_storage.clone())?;

        let mut builder = Pipeline::builder()
            .config(pipeline_config)
            .stage(StateStoreLoadStage::new(
                Arc::clone(&services.state_store),
                &conversation_id,
                &user_id,
            ))
            .stage(VariableInjectionStage::new(variables, metadata))
            .stage(PromptAssemblyStage::new(services.prompts.clone(), task_type))
            .stage(TemplateStage)
            .stage(ContextBuilderStage::new(context_builder))
            .stage(MediaResolveStage::new(Arc::new(loader)).reinline_history(reinline_history));

        let capabilities = services.provider.capabilities();
        if capabilities.has_format_restrictions() {
            let convert = MediaConvertConfig {
                passthrough_on_error: convert_passthrough_on_error,
                ..MediaConvertConfig::from(&capabilities)
            };
            builder = builder.stage(MediaConvertStage::new(MediaConverter::new(convert)));
        }

        builder = builder.stage(ProviderStage::new(
            Arc::clone(&services.provider),
            services.tools.clone(),
            tool_policy,
        ));

        if let Some(storage) = &services.media_storage {
            builder = builder.stage(MediaExternalizerStage::new(MediaExternalizer::new(
                externalizer,
                Arc::clone(storage),
            )));
        }
        if !validators.is_empty() {
            builder = builder.stage(GuardrailStage::new(validators)?);
        }
        let has_assertions = !assertions.is_empty();
        if has_assertions {
            builder = builder.stage(AssertionStage::new(assertions)?);
        }
        builder = builder.stage(StateStoreSaveStage::new(
            Arc::clone(&services.state_store),
            &conversation_id,
            &user_id,
        ));
        if has_assertions {
            builder = builder.stage(AssertionVerdictStage);
        }

        Ok(Self {
            pipeline: builder.build()?,
            conversation_id,
        })
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.pipeline.stage_names()
    }

    /// Run the turn to completion
    #[instrument(name = "turn.run", skip_all, fields(conversation_id = %self.conversation_id))]
    pub async fn run(&self, user_message: Message) -> Result<TurnOutcome> {
        let result = self
            .pipeline
            .execute_sync(StreamElement::from_message(user_message))
            .await?;
        let outcome = TurnOutcome::from_result(result);
        info!(
            target: "turn",
            conversation_id = %self.conversation_id,
            messages = outcome.messages.len(),
            total_cost_usd = outcome.cost.total_cost_usd,
            "Turn complete"
        );
        Ok(outcome)
    }

    /// Run the turn and observe every element as it is produced
    pub fn stream(&self, user_message: Message) -> Result<PipelineStream> {
        let (tx, rx) = mpsc::channel(1);
        tx.try_send(StreamElement::from_message(user_message))
            .map_err(|_| TurnError::Pipeline("failed to feed turn input".into()))?;
        Ok(self.pipeline.execute(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderCapabilities, ProviderRequest, ProviderResponse};
    use crate::state::InMemoryStateStore;
    use async_trait::async_trait;

    struct Echo {
        caps: ProviderCapabilities,
    }

    #[async_trait]
    impl Provider for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            self.caps.clone()
        }

        async fn predict(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
            let last = request.messages.last().map(Message::text).unwrap_or_default();
            Ok(ProviderResponse::text(format!("echo: {last}")))
        }
    }

    fn services(caps: ProviderCapabilities) -> TurnServices {
        TurnServices::new(InMemoryStateStore::new(), Arc::new(Echo { caps }))
    }

    #[test]
    fn test_stage_order() {
        let config = TurnConfig::new("c", "u")
            .validators(vec![ValidatorSpec::MaxSentences { max_sentences: 3 }])
            .assertions(vec![AssertionConfig::new(crate::validation::AssertionKind::MinLength { min: 1 })]);
        let caps = ProviderCapabilities {
            audio_formats: vec!["audio/wav".into()],
            ..Default::default()
        };
        let svc = services(caps).with_media_storage(InMemoryMediaStore::new());
        let turn = TurnPipeline::build(&svc, config).unwrap();
        assert_eq!(
            turn.stage_names(),
            vec![
                "statestore_load",
                "variable_injection",
                "prompt_assembly",
                "template",
                "context_builder",
                "media_resolve",
                "media_convert",
                "provider",
                "media_externalizer",
                "guardrails",
                "assertions",
                "statestore_save",
                "assertion_verdict",
            ]
        );

        let minimal = TurnPipeline::build(&services(ProviderCapabilities::default()), TurnConfig::new("c", "u")).unwrap();
        assert_eq!(minimal.stage_names().len(), 8);
    }

    #[test]
    fn test_missing_collaborator_is_config_error() {
        let config = TurnConfig::new("c", "u").context_policy(
            ContextPolicy::with_budget(100, 10).strategy(crate::context::TruncationStrategy::Summarize),
        );
        let err = TurnPipeline::build(&services(ProviderCapabilities::default()), config).err().unwrap();
        assert!(matches!(err, TurnError::Config(_)));
    }

    #[tokio::test]
    async fn test_turns_accumulate_history() {
        let svc = services(ProviderCapabilities::default());
        for text in ["one", "two"] {
            let turn = TurnPipeline::build(&svc, TurnConfig::new("conv", "user")).unwrap();
            let outcome = turn.run(Message::user(text)).await.unwrap();
            assert_eq!(outcome.response_text(), format!("echo: {text}"));
            assert_eq!(outcome.messages.len(), 2);
        }
        let saved = svc.state_store.load("conv").await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 4);
        assert_eq!(saved.turn_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_then_answer() {
        let svc = services(ProviderCapabilities::default());
        let turn = TurnPipeline::build(&svc, TurnConfig::new("s", "u")).unwrap();
        let mut stream = turn.stream(Message::user("hi")).unwrap();
        let mut deltas = String::new();
        let mut answer = None;
        while let Some(elem) = stream.next().await {
            assert!(elem.error.is_none());
            if let Some(d) = elem.text_delta {
                deltas.push_str(&d);
            }
            if let Some(m) = elem.message.filter(|m| m.role == crate::types::Role::Assistant) {
                answer = Some(m);
            }
        }
        assert_eq!(deltas, "echo: hi");
        assert_eq!(answer.unwrap().content, "echo: hi");
    }
}
