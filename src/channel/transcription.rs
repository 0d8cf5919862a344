use super::{ChannelEvent, ChannelKind, SessionChannel, TranscriptionResult};
use crate::error::{Result, VoiceError};
use crate::protocol::{
    ClientEvent, NoiseReduction, ServerEvent, TranscriptionParams, TranscriptionSession,
};

/// Extra output requested from the transcription model.
const INCLUDE_LOGPROBS: &str = "item.input_audio_transcription.logprobs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionSettings {
    pub model: String,
    pub language: String,
    /// Noise reduction profile, e.g. `near_field`. Empty disables it.
    pub noise_reduction: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-transcribe".to_string(),
            language: "en".to_string(),
            noise_reduction: "near_field".to_string(),
        }
    }
}

/// Transcription-only session with voice activity detection turned off;
/// appended audio accumulates until [`SessionChannel::commit_buffer`].
pub struct TranscriptionKind {
    settings: TranscriptionSettings,
    is_transcribing: bool,
}

impl TranscriptionKind {
    pub fn new(settings: TranscriptionSettings) -> Self {
        Self {
            settings,
            is_transcribing: false,
        }
    }
}

impl ChannelKind for TranscriptionKind {
    fn name(&self) -> &'static str {
        "transcription"
    }

    fn is_acknowledgment(&self, event: &ServerEvent) -> bool {
        matches!(
            event,
            ServerEvent::ConnectionEstablished
                | ServerEvent::TranscriptionSessionCreated
                | ServerEvent::TranscriptionSessionUpdated
        )
    }

    fn handshake(&self) -> Result<ClientEvent> {
        let noise_reduction = (!self.settings.noise_reduction.is_empty()).then(|| NoiseReduction {
            kind: self.settings.noise_reduction.clone(),
        });
        Ok(ClientEvent::TranscriptionSessionUpdate {
            session: TranscriptionSession {
                input_audio_format: "pcm16".to_string(),
                input_audio_transcription: TranscriptionParams {
                    model: self.settings.model.clone(),
                    prompt: String::new(),
                    language: self.settings.language.clone(),
                },
                turn_detection: None,
                input_audio_noise_reduction: noise_reduction,
                include: vec![INCLUDE_LOGPROBS.to_string()],
            },
        })
    }

    fn audio_events(&self, audio: String) -> Vec<ClientEvent> {
        vec![ClientEvent::InputAudioBufferAppend { audio }]
    }

    fn dispatch(&mut self, event: ServerEvent) -> Vec<ChannelEvent> {
        match event {
            ServerEvent::ConnectionEstablished => {
                log::info!("[transcription] connection established");
                Vec::new()
            }
            ServerEvent::TranscriptionSessionCreated | ServerEvent::TranscriptionSessionUpdated => {
                log::info!("[transcription] session updated successfully");
                Vec::new()
            }
            ServerEvent::InputAudioBufferCommitted { item_id } => {
                log::info!(
                    "[transcription] audio buffer committed: {}",
                    item_id.unwrap_or_default()
                );
                Vec::new()
            }
            ServerEvent::SpeechStarted { .. } => {
                self.is_transcribing = true;
                vec![ChannelEvent::SpeechStarted]
            }
            ServerEvent::SpeechStopped { .. } => {
                self.is_transcribing = false;
                vec![ChannelEvent::SpeechStopped]
            }
            ServerEvent::TranscriptionDelta { delta, .. } => {
                if !delta.is_empty() {
                    log::debug!("[transcription] delta: \"{}\"", delta);
                }
                Vec::new()
            }
            ServerEvent::TranscriptionCompleted { item_id, transcript } => {
                if transcript.is_empty() {
                    log::info!("[transcription] completed but no transcript provided");
                    return Vec::new();
                }
                log::info!("[transcription] completed: \"{}\"", transcript);
                vec![ChannelEvent::Transcription(TranscriptionResult {
                    text: transcript,
                    item_id,
                })]
            }
            ServerEvent::TranscriptionFailed { error, .. } => {
                let error = error.unwrap_or_default();
                vec![ChannelEvent::Error(VoiceError::Protocol {
                    code: error.code.clone(),
                    message: format!("Transcription failed: {}", error.message_or_default()),
                })]
            }
            ServerEvent::Error { error } => vec![ChannelEvent::Error(VoiceError::Protocol {
                code: error.code.clone(),
                message: error.message_or_default().to_string(),
            })],
            other => {
                log::debug!("[transcription] unhandled {:?}", other);
                Vec::new()
            }
        }
    }

    fn reset(&mut self) {
        self.is_transcribing = false;
    }
}

impl SessionChannel<TranscriptionKind> {
    /// Ask the server to transcribe everything appended so far. False unless
    /// Ready.
    pub fn commit_buffer(&self) -> bool {
        let committed = self.send(&ClientEvent::InputAudioBufferCommit);
        if committed {
            log::info!("[transcription] audio buffer committed for transcription");
        }
        committed
    }

    /// True between the server's speech-started and speech-stopped notices.
    pub fn is_transcribing(&self) -> bool {
        self.kind().is_transcribing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transcript_is_not_a_result() {
        let mut kind = TranscriptionKind::new(TranscriptionSettings::default());
        let events = kind.dispatch(ServerEvent::TranscriptionCompleted {
            item_id: Some("item_1".into()),
            transcript: String::new(),
        });
        assert!(events.is_empty());

        let events = kind.dispatch(ServerEvent::TranscriptionCompleted {
            item_id: Some("item_2".into()),
            transcript: "hello there".into(),
        });
        match &events[..] {
            [ChannelEvent::Transcription(result)] => {
                assert_eq!(result.text, "hello there");
                assert_eq!(result.item_id.as_deref(), Some("item_2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn noise_reduction_can_be_disabled() {
        let kind = TranscriptionKind::new(TranscriptionSettings {
            noise_reduction: String::new(),
            ..TranscriptionSettings::default()
        });
        let value = serde_json::to_value(kind.handshake().unwrap()).unwrap();
        assert!(value["session"].get("input_audio_noise_reduction").is_none());
        assert_eq!(value["session"]["include"][0], INCLUDE_LOGPROBS);
    }

    #[test]
    fn reset_clears_transcribing() {
        let mut kind = TranscriptionKind::new(TranscriptionSettings::default());
        kind.dispatch(ServerEvent::SpeechStarted { item_id: None });
        assert!(kind.is_transcribing);
        kind.reset();
        assert!(!kind.is_transcribing);
    }

    #[test]
    fn failed_transcription_is_reported() {
        let mut kind = TranscriptionKind::new(TranscriptionSettings::default());
        let events = kind.dispatch(ServerEvent::TranscriptionFailed { item_id: None, error: None });
        match &events[..] {
            [ChannelEvent::Error(err)] => {
                assert_eq!(err.to_string(), "API error: Transcription failed: Unknown error")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
