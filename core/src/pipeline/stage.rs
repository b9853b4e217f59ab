//! Stage contract and the channel handles a stage works with.

use super::element::StreamElement;
use crate::{Result, TurnError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Shape of a stage's input/output relationship, used for logging and introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// One element in, one element out
    Transform,
    /// Collects the whole input before emitting
    Accumulate,
    /// Emits more elements than it receives
    Generate,
    /// Persists and forwards
    Sink,
}

/// A single transformation step in the execution pipeline.
///
/// A stage consumes zero or more elements from `input` and produces zero or more
/// elements on `output`, preserving the order of what it forwards. Returning
/// `Err` ends the stage; the engine turns the error into a terminal element.
///
/// # Example
///
/// ```rust,ignore
/// struct Upper;
///
/// #[async_trait]
/// impl Stage for Upper {
///     fn name(&self) -> &str { "upper" }
///
///     async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
///         while let Some(mut elem) = input.recv().await {
///             if let Some(msg) = elem.message.as_mut() {
///                 msg.content = msg.content.to_uppercase();
///             }
///             output.send(elem).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn process(&self, input: StageInput, output: StageOutput) -> Result<()>;
}

/// Receiving side of a stage.
///
/// An error element ends consumption: it is forwarded downstream as-is and
/// `recv` reports end of input. Collecting stages check `is_halted` before
/// acting on what they gathered.
pub struct StageInput {
    rx: mpsc::Receiver<StreamElement>,
    downstream: mpsc::Sender<StreamElement>,
    halted: bool,
}

impl StageInput {
    pub fn new(rx: mpsc::Receiver<StreamElement>, downstream: mpsc::Sender<StreamElement>) -> Self {
        Self {
            rx,
            downstream,
            halted: false,
        }
    }

    pub async fn recv(&mut self) -> Option<StreamElement> {
        if self.halted {
            return None;
        }
        let elem = self.rx.recv().await?;
        if elem.is_error() {
            self.halted = true;
            // Downstream may already be gone if the caller stopped listening
            let _ = self.downstream.send(elem).await;
            return None;
        }
        Some(elem)
    }

    /// Drain the remaining input
    pub async fn collect(&mut self) -> Vec<StreamElement> {
        let mut out = Vec::new();
        while let Some(elem) = self.recv().await {
            out.push(elem);
        }
        out
    }

    /// Drain the remaining input, passing text deltas straight to `output`
    /// and returning every other element in order
    pub async fn collect_messages(&mut self, output: &StageOutput) -> Result<Vec<StreamElement>> {
        let mut out = Vec::new();
        while let Some(elem) = self.recv().await {
            if elem.message.is_none() && elem.text_delta.is_some() {
                output.send(elem).await?;
            } else {
                out.push(elem);
            }
        }
        Ok(out)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Sending side of a stage
#[derive(Clone)]
pub struct StageOutput {
    tx: mpsc::Sender<StreamElement>,
}

impl StageOutput {
    pub fn new(tx: mpsc::Sender<StreamElement>) -> Self {
        Self { tx }
    }

    /// Send one element, waiting while the downstream queue is full
    pub async fn send(&self, elem: StreamElement) -> Result<()> {
        self.tx
            .send(elem)
            .await
            .map_err(|_| TurnError::Pipeline("downstream stage closed".into()))
    }

    pub async fn send_all(&self, elems: impl IntoIterator<Item = StreamElement>) -> Result<()> {
        for elem in elems {
            self.send(elem).await?;
        }
        Ok(())
    }
}

/// Forward every remaining input element unchanged
pub async fn forward_all(input: &mut StageInput, output: &StageOutput) -> Result<()> {
    while let Some(elem) = input.recv().await {
        output.send(elem).await?;
    }
    Ok(())
}

/// Build a connected input/output pair around fresh channels.
///
/// Returns the sender feeding the stage, the stage handles, and the receiver
/// observing the stage output. Used to drive a single stage outside a pipeline.
pub fn stage_harness(
    capacity: usize,
) -> (
    mpsc::Sender<StreamElement>,
    StageInput,
    StageOutput,
    mpsc::Receiver<StreamElement>,
) {
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let input = StageInput::new(in_rx, out_tx.clone());
    (in_tx, input, StageOutput::new(out_tx), out_rx)
}
