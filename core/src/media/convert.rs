//! Format normalization for providers that only accept some media types.

use super::error::MediaError;
use super::mime::normalize;
use super::wav::{wrap_pcm_in_wav, AudioFileSource, AudioFormat, DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::pipeline::{Stage, StageInput, StageKind, StageOutput};
use crate::provider::ProviderCapabilities;
use crate::types::{ContentPart, ContentType, MediaContent, MediaSource, Message};
use crate::{Result, TurnError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MediaConvertConfig {
    pub audio_formats: Vec<String>,
    pub image_formats: Vec<String>,
    pub video_formats: Vec<String>,
    /// Keep the original part when conversion fails instead of failing the turn
    pub passthrough_on_error: bool,
}

impl Default for MediaConvertConfig {
    fn default() -> Self {
        Self {
            audio_formats: Vec::new(),
            image_formats: Vec::new(),
            video_formats: Vec::new(),
            passthrough_on_error: true,
        }
    }
}

impl From<&ProviderCapabilities> for MediaConvertConfig {
    fn from(caps: &ProviderCapabilities) -> Self {
        Self {
            audio_formats: caps.audio_formats.clone(),
            image_formats: caps.image_formats.clone(),
            video_formats: caps.video_formats.clone(),
            ..Default::default()
        }
    }
}

impl MediaConvertConfig {
    fn formats_for(&self, content_type: ContentType) -> &[String] {
        match content_type {
            ContentType::Audio => &self.audio_formats,
            ContentType::Image => &self.image_formats,
            ContentType::Video => &self.video_formats,
            ContentType::Text => &[],
        }
    }
}

/// Converts between WAV and raw 16-bit PCM
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioConverter;

impl AudioConverter {
    pub fn can_convert(&self, from: &str, to: &str) -> bool {
        let (from, to) = (normalize(from), normalize(to));
        from == to
            || matches!(
                (from.as_str(), to.as_str()),
                ("audio/wav", "audio/pcm") | ("audio/pcm", "audio/wav")
            )
    }

    /// Convert raw bytes of type `from` into type `to`
    pub fn convert_bytes(&self, data: &[u8], from: &str, to: &str) -> std::result::Result<Vec<u8>, MediaError> {
        let (from, to) = (normalize(from), normalize(to));
        let fail = |msg: String| MediaError::conversion(0, "audio", &from, msg);
        match (from.as_str(), to.as_str()) {
            ("audio/wav", "audio/pcm") => AudioFileSource::from_wav(Cursor::new(data))?.read_all(),
            ("audio/pcm", "audio/wav") => Ok(wrap_pcm_in_wav(
                data,
                DEFAULT_SAMPLE_RATE,
                DEFAULT_BIT_DEPTH,
                DEFAULT_CHANNELS,
            )),
            ("audio/wav", "audio/wav") => {
                let mut source = AudioFileSource::from_wav(Cursor::new(data))?;
                if source.format() == AudioFormat::Pcm16 {
                    return Ok(data.to_vec());
                }
                let pcm = source.read_all()?;
                Ok(wrap_pcm_in_wav(&pcm, source.sample_rate(), DEFAULT_BIT_DEPTH, source.channels()))
            }
            (a, b) if a == b => Ok(data.to_vec()),
            (a, b) => Err(fail(format!("unsupported audio conversion {a} -> {b}"))),
        }
    }
}

/// Picks a provider-accepted format for each media part and converts to it
pub struct MediaConverter {
    config: MediaConvertConfig,
    audio: AudioConverter,
}

impl MediaConverter {
    pub fn new(config: MediaConvertConfig) -> Self {
        Self {
            config,
            audio: AudioConverter,
        }
    }

    pub fn config(&self) -> &MediaConvertConfig {
        &self.config
    }

    /// Returns `Ok(None)` when the part is already acceptable or cannot be inspected
    pub fn convert_media(
        &self,
        media: &MediaContent,
        content_type: ContentType,
        index: usize,
    ) -> std::result::Result<Option<MediaContent>, MediaError> {
        let accepted = self.config.formats_for(content_type);
        let (Some(data), Some(mime)) = (media.inline_data(), media.mime_type.as_deref()) else {
            return Ok(None);
        };
        if accepted.is_empty() || accepted.iter().any(|f| normalize(f) == normalize(mime)) {
            return Ok(None);
        }

        let ct = content_type.as_str();
        let origin = media.source.describe();
        if content_type != ContentType::Audio {
            return Err(MediaError::conversion(
                index,
                ct,
                &origin,
                format!("{ct} conversion from {mime} is not supported"),
            ));
        }

        let Some(target) = accepted.iter().find(|f| self.audio.can_convert(mime, f)) else {
            return Err(MediaError::conversion(
                index,
                ct,
                &origin,
                format!("no conversion from {mime} to any of {}", accepted.join(", ")),
            ));
        };
        let bytes = STANDARD
            .decode(data)
            .map_err(|e| MediaError::conversion(index, ct, &origin, format!("invalid base64 data: {e}")))?;
        let converted = self
            .audio
            .convert_bytes(&bytes, mime, target)
            .map_err(|e| MediaError { origin: origin.clone(), ..e.at(index, ct) })?;

        Ok(Some(MediaContent {
            source: MediaSource::Inline(STANDARD.encode(converted)),
            mime_type: Some(normalize(target)),
            detail: media.detail.clone(),
        }))
    }

    /// Convert every media part of `message` in place
    pub fn convert_message(&self, message: &mut Message) -> std::result::Result<usize, MediaError> {
        let mut converted = 0;
        for (index, part) in message.parts.iter_mut().enumerate() {
            let content_type = part.content_type();
            let Some(media) = part.media_mut() else {
                continue;
            };
            match self.convert_media(media, content_type, index) {
                Ok(Some(new_media)) => {
                    *media = new_media;
                    converted += 1;
                }
                Ok(None) => {}
                Err(e) if self.config.passthrough_on_error => {
                    warn!(target: "media_convert", error = %e, "Conversion failed; passing original through");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(converted)
    }
}

/// Normalizes media in every message to the provider's accepted formats
pub struct MediaConvertStage {
    converter: MediaConverter,
}

impl MediaConvertStage {
    pub fn new(converter: MediaConverter) -> Self {
        Self { converter }
    }

    pub fn from_capabilities(caps: &ProviderCapabilities) -> Self {
        Self::new(MediaConverter::new(caps.into()))
    }
}

#[async_trait]
impl Stage for MediaConvertStage {
    fn name(&self) -> &str {
        "media_convert"
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        while let Some(mut elem) = input.recv().await {
            if let Some(msg) = elem.message.as_mut() {
                if msg.parts.iter().any(|p| !matches!(p, ContentPart::Text { .. })) {
                    let converted = self.converter.convert_message(msg).map_err(TurnError::Media)?;
                    if converted > 0 {
                        debug!(target: "media_convert", converted, role = msg.role.as_str(), "Converted media parts");
                    }
                }
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaErrorKind;
    use crate::pipeline::{Pipeline, StreamElement};

    fn pcm_media(samples: usize) -> MediaContent {
        MediaContent::inline(STANDARD.encode(vec![0u8; samples * 2]), "audio/pcm")
    }

    fn wav_only() -> MediaConverter {
        MediaConverter::new(MediaConvertConfig {
            audio_formats: vec!["audio/wav".into()],
            ..Default::default()
        })
    }

    #[test]
    fn test_pcm_to_wav_for_wav_only_provider() {
        let out = wav_only()
            .convert_media(&pcm_media(10), ContentType::Audio, 0)
            .unwrap()
            .unwrap();
        assert_eq!(out.mime_type.as_deref(), Some("audio/wav"));
        assert_eq!(STANDARD.decode(out.inline_data().unwrap()).unwrap().len(), 44 + 20);
    }

    #[test]
    fn test_accepted_or_unrestricted_is_untouched() {
        let wav = MediaContent::inline("AAAA", "audio/x-wav");
        assert!(wav_only().convert_media(&wav, ContentType::Audio, 0).unwrap().is_none());

        let open = MediaConverter::new(MediaConvertConfig::default());
        assert!(open.convert_media(&pcm_media(4), ContentType::Audio, 0).unwrap().is_none());
    }

    #[test]
    fn test_24_bit_wav_to_pcm() {
        let wav = wrap_pcm_in_wav(&[0u8; 12], 8000, 24, 1);
        let pcm = AudioConverter
            .convert_bytes(&wav, "audio/wav", "audio/pcm")
            .unwrap();
        assert_eq!(pcm.len(), 8);
    }

    #[test]
    fn test_failures_respect_passthrough() {
        let png = MediaContent::inline("AAAA", "image/png");
        let strict = MediaConverter::new(MediaConvertConfig {
            image_formats: vec!["image/jpeg".into()],
            passthrough_on_error: false,
            ..Default::default()
        });
        let err = strict.convert_media(&png, ContentType::Image, 3).unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::Conversion);
        assert_eq!(err.index, 3);

        let mut msg = Message::user("").with_parts(vec![ContentPart::Image { media: png.clone() }]);
        assert!(strict.convert_message(&mut msg).is_err());

        let lenient = MediaConverter::new(MediaConvertConfig {
            image_formats: vec!["image/jpeg".into()],
            ..Default::default()
        });
        assert_eq!(lenient.convert_message(&mut msg).unwrap(), 0);
        assert_eq!(msg.parts[0].media(), Some(&png));
    }

    #[tokio::test]
    async fn test_stage_converts_message_parts() {
        let pipeline = Pipeline::builder()
            .stage(MediaConvertStage::new(wav_only()))
            .build()
            .unwrap();
        let msg = Message::user("").with_parts(vec![
            ContentPart::text("listen"),
            ContentPart::Audio { media: pcm_media(8) },
        ]);
        let result = pipeline
            .execute_sync(StreamElement::from_message(msg))
            .await
            .unwrap();
        let media = result.messages[0].parts[1].media().unwrap();
        assert_eq!(media.mime_type.as_deref(), Some("audio/wav"));
    }
}
