use super::loader::MediaLoader;
use super::validate::validate_media;
use crate::pipeline::{Stage, StageInput, StageKind, StageOutput};
use crate::types::{MediaSource, Message};
use crate::{Result, TurnError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Loads every media part of the turn's messages into inline data before the
/// provider runs. Any validation or load failure fails the turn.
///
/// History parts are left as stored unless `reinline_history` is set, in
/// which case storage references in history are fetched back inline.
pub struct MediaResolveStage {
    loader: Arc<MediaLoader>,
    reinline_history: bool,
}

impl MediaResolveStage {
    pub fn new(loader: Arc<MediaLoader>) -> Self {
        Self {
            loader,
            reinline_history: false,
        }
    }

    pub fn reinline_history(mut self, enabled: bool) -> Self {
        self.reinline_history = enabled;
        self
    }

    async fn resolve_message(&self, message: &mut Message, history: bool) -> Result<usize> {
        let mut loaded = 0;
        for (index, part) in message.parts.iter_mut().enumerate() {
            let content_type = part.content_type();
            let Some(media) = part.media_mut() else {
                continue;
            };
            if !history {
                validate_media(media, content_type, index).map_err(TurnError::Media)?;
            }
            if matches!(media.source, MediaSource::Inline(_)) {
                continue;
            }
            if history && !matches!(media.source, MediaSource::Storage(_)) {
                continue;
            }
            *media = self
                .loader
                .load(media, content_type, index)
                .await
                .map_err(TurnError::Media)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[async_trait]
impl Stage for MediaResolveStage {
    fn name(&self) -> &str {
        "media_resolve"
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    #[instrument(name = "media.resolve", skip_all)]
    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        while let Some(mut elem) = input.recv().await {
            let history = elem.is_from_history();
            if let Some(msg) = elem.message.as_mut() {
                if msg.is_multimodal() && (!history || self.reinline_history) {
                    let loaded = self.resolve_message(msg, history).await?;
                    if loaded > 0 {
                        debug!(target: "media_loader", loaded, history, "Resolved media parts");
                    }
                }
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}
