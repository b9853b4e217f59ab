//! Pipeline engine
//!
//! Runs an ordered list of stages as concurrent tasks coupled through bounded
//! channels. Streaming is the only execution path; the synchronous API drains
//! the stream into an `ExecutionResult`.

use super::element::{into_turn_error, merge_metadata, StreamElement};
use super::stage::{Stage, StageInput, StageOutput};
use crate::types::{Message, Metadata, Role};
use crate::{Result, TurnError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue
    pub channel_buffer_size: usize,

    /// Wall-clock limit for one execution; `None` disables the limit
    pub execution_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 16,
            execution_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Result of a synchronous execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Last assistant message emitted
    pub response: Option<Message>,

    /// Every completed message emitted, in order
    pub messages: Vec<Message>,

    /// Concatenated text deltas
    pub text: String,

    /// Metadata merged across all elements, later elements win
    pub metadata: Metadata,
}

impl ExecutionResult {
    pub fn response_text(&self) -> String {
        self.response.as_ref().map(Message::text).unwrap_or_default()
    }
}

/// Ordered composition of stages
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start the pipeline over `input` and return the output stream.
    ///
    /// Every stage runs as its own task. Dropping the returned stream aborts
    /// all of them.
    #[instrument(name = "pipeline.execute", skip(self, input), fields(stages = self.stages.len()))]
    pub fn execute(&self, input: mpsc::Receiver<StreamElement>) -> PipelineStream {
        let mut tasks = JoinSet::new();
        let mut upstream = input;

        for stage in &self.stages {
            let (tx, rx) = mpsc::channel(self.config.channel_buffer_size);
            let stage = Arc::clone(stage);
            let stage_input = StageInput::new(upstream, tx.clone());
            let stage_output = StageOutput::new(tx.clone());

            tasks.spawn(async move {
                let name = stage.name().to_string();
                debug!(target: "pipeline", stage = %name, kind = ?stage.kind(), "Stage started");
                match stage.process(stage_input, stage_output).await {
                    Ok(()) => debug!(target: "pipeline", stage = %name, "Stage finished"),
                    Err(e) => {
                        warn!(target: "pipeline", stage = %name, error = %e, "Stage failed");
                        let _ = tx.send(StreamElement::from_error(e)).await;
                    }
                }
            });
            upstream = rx;
        }

        PipelineStream {
            rx: upstream,
            tasks,
            deadline: self.config.execution_timeout.map(|d| Instant::now() + d),
            timeout: self.config.execution_timeout,
            finished: false,
        }
    }

    /// Push one element through the whole chain and wait for the outcome.
    ///
    /// Returns the first error any stage produced, otherwise the collected result.
    pub async fn execute_sync(&self, input: StreamElement) -> Result<ExecutionResult> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(input)
            .await
            .map_err(|_| TurnError::Pipeline("failed to feed pipeline input".into()))?;
        drop(tx);

        let mut stream = self.execute(rx);
        let mut result = ExecutionResult::default();
        let mut first_error = None;

        while let Some(elem) = stream.next().await {
            if let Some(err) = elem.error {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                continue;
            }
            merge_metadata(&mut result.metadata, &elem.metadata, true);
            if let Some(delta) = elem.text_delta {
                result.text.push_str(&delta);
            }
            if let Some(msg) = elem.message {
                if msg.role == Role::Assistant {
                    result.response = Some(msg.clone());
                }
                result.messages.push(msg);
            }
        }

        match first_error {
            Some(err) => Err(into_turn_error(err)),
            None => {
                info!(
                    target: "pipeline",
                    messages = result.messages.len(),
                    "Pipeline execution complete"
                );
                Ok(result)
            }
        }
    }
}

/// Builder for `Pipeline`
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(TurnError::Config("pipeline has no stages".into()));
        }
        if self.config.channel_buffer_size == 0 {
            return Err(TurnError::Config("channel_buffer_size must be positive".into()));
        }
        Ok(Pipeline {
            stages: self.stages,
            config: self.config,
        })
    }
}

/// Output side of a running pipeline
pub struct PipelineStream {
    rx: mpsc::Receiver<StreamElement>,
    tasks: JoinSet<()>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    finished: bool,
}

impl PipelineStream {
    /// Next element in emission order, or `None` once every stage is done
    pub async fn next(&mut self) -> Option<StreamElement> {
        if self.finished {
            return None;
        }

        let next = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    self.finished = true;
                    self.tasks.abort_all();
                    let limit = self.timeout.unwrap_or_default();
                    warn!(target: "pipeline", timeout_ms = limit.as_millis() as u64, "Pipeline execution timed out");
                    return Some(StreamElement::from_error(TurnError::Timeout(format!(
                        "pipeline execution exceeded {}ms",
                        limit.as_millis()
                    ))));
                }
            },
            None => self.rx.recv().await,
        };

        if next.is_some() {
            return next;
        }

        self.finished = true;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(target: "pipeline", error = %e, "Stage task panicked");
                    return Some(StreamElement::from_error(TurnError::Pipeline(format!(
                        "stage task panicked: {e}"
                    ))));
                }
            }
        }
        None
    }

    /// Stop every stage task immediately
    pub fn cancel(&mut self) {
        self.finished = true;
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::StageKind;
    use crate::pipeline::PassthroughStage;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl Stage for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
            while let Some(mut elem) = input.recv().await {
                if let Some(msg) = elem.message.as_mut() {
                    msg.content = msg.content.to_uppercase();
                }
                output.send(elem).await?;
            }
            Ok(())
        }
    }

    /// Emits an assistant reply for each user message, preceded by deltas
    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn kind(&self) -> StageKind {
            StageKind::Generate
        }

        async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
            while let Some(elem) = input.recv().await {
                let reply = elem.message.as_ref().map(|m| m.content.clone()).unwrap_or_default();
                output.send(elem).await?;
                for word in reply.split_whitespace() {
                    output.send(StreamElement::delta(format!("{word} "))).await?;
                }
                output
                    .send(StreamElement::from_message(Message::assistant(reply)))
                    .await?;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Stage for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(&self, mut input: StageInput, _output: StageOutput) -> Result<()> {
            let _ = input.collect().await;
            Err(TurnError::Provider("upstream unavailable".into()))
        }
    }

    /// Records whether it saw a halted input
    struct Collector {
        saw_halt: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Stage for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
            let elems = input.collect().await;
            if input.is_halted() {
                self.saw_halt.store(true, std::sync::atomic::Ordering::SeqCst);
                return Ok(());
            }
            output.send_all(elems).await
        }
    }

    struct Stall;

    #[async_trait]
    impl Stage for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        async fn process(&self, _input: StageInput, _output: StageOutput) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sync_execution_collects_response_and_deltas() {
        let pipeline = Pipeline::builder()
            .stage(PassthroughStage)
            .stage(Upper)
            .stage(Echo)
            .build()
            .unwrap();
        let result = pipeline
            .execute_sync(StreamElement::from_message(Message::user("hello there")))
            .await
            .unwrap();

        assert_eq!(result.response_text(), "HELLO THERE");
        assert_eq!(result.text, "HELLO THERE ");
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_streaming_preserves_emission_order() {
        let pipeline = Pipeline::builder().stage(Echo).build().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let mut stream = pipeline.execute(rx);
        tx.send(StreamElement::from_message(Message::user("a b c")))
            .await
            .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(elem) = stream.next().await {
            if let Some(d) = elem.text_delta {
                seen.push(d);
            } else if let Some(m) = elem.message {
                seen.push(format!("{}:{}", m.role.as_str(), m.content));
            }
        }
        assert_eq!(seen, vec!["user:a b c", "a ", "b ", "c ", "assistant:a b c"]);
    }

    #[tokio::test]
    async fn test_first_error_is_returned_and_halts_downstream() {
        let saw_halt = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pipeline = Pipeline::builder()
            .stage(Failing)
            .stage(Collector {
                saw_halt: Arc::clone(&saw_halt),
            })
            .build()
            .unwrap();

        let err = pipeline
            .execute_sync(StreamElement::from_message(Message::user("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Provider(_)));
        assert!(saw_halt.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_execution_timeout_yields_timeout_error() {
        let pipeline = Pipeline::builder()
            .stage(Stall)
            .config(PipelineConfig {
                channel_buffer_size: 4,
                execution_timeout: Some(Duration::from_millis(50)),
            })
            .build()
            .unwrap();

        let err = pipeline
            .execute_sync(StreamElement::from_message(Message::user("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Timeout(_)));
    }

    #[test]
    fn test_builder_rejects_empty_pipeline() {
        assert!(matches!(
            Pipeline::builder().build(),
            Err(TurnError::Config(_))
        ));
    }
}
