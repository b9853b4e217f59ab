mod config;
use config::RunnerConfig;
use loom_turn::pipeline::StaticPromptRegistry;
use loom_turn::{Message, Role, RuntimeConfig, TurnConfig, TurnPipeline, TurnServices};
use serde_json::json;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,loom_turn=info,turn_runner=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let runtime = RuntimeConfig::load();
    let runner = RunnerConfig::load();

    // Input: command-line words, or stdin when none are given
    let args: Vec<String> = std::env::args().skip(1).collect();
    let input = if args.is_empty() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.join(" ")
    };
    if input.trim().is_empty() {
        error!(target: "turn_runner", "No input message; pass it as arguments or on stdin");
        return Ok(());
    }

    info!(
        target: "turn_runner",
        conversation_id = %runner.conversation_id,
        model = %runtime.provider.model,
        "Running turn"
    );

    let prompts = StaticPromptRegistry::new().with_prompt(
        runner.task_type.clone(),
        runner.system_prompt.clone(),
        Vec::new(),
    );
    let services = TurnServices::from_config(&runtime)
        .await?
        .with_prompts(Arc::new(prompts));
    let config = TurnConfig::from_runtime(&runtime, runner.conversation_id.clone(), runner.user_id.clone())?
        .task_type(runner.task_type.clone())
        .validators(runner.validators.clone())
        .assertions(runner.assertions.clone());
    let turn = TurnPipeline::build(&services, config)?;
    info!(target: "turn_runner", stages = ?turn.stage_names(), "Pipeline ready");

    if runner.stream {
        let mut stream = turn.stream(Message::user(input.trim()))?;
        let mut stdout = std::io::stdout();
        while let Some(elem) = stream.next().await {
            if let Some(err) = elem.error {
                error!(target: "turn_runner", error = %err, "Turn failed");
                return Err(err.to_string().into());
            }
            if let Some(delta) = elem.text_delta {
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            if let Some(msg) = elem.message.filter(|m| m.role == Role::Tool) {
                info!(target: "turn_runner", content = %msg.content, "Tool result");
            }
        }
        writeln!(stdout)?;
        return Ok(());
    }

    match turn.run(Message::user(input.trim())).await {
        Ok(outcome) => {
            println!("{}", outcome.response_text());
            let summary = json!({
                "finish_reason": outcome.finish_reason(),
                "messages": outcome.messages.len(),
                "cost": outcome.cost,
                "guardrails_passed": outcome.metadata.get("guardrails_passed"),
            });
            info!(target: "turn_runner", summary = %summary, "Turn complete");
            Ok(())
        }
        Err(e) => {
            error!(target: "turn_runner", error = %e, "Turn failed");
            Err(e.into())
        }
    }
}
