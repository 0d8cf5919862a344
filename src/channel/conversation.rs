use std::sync::Arc;

use super::{ChannelEvent, ChannelKind};
use crate::error::{Result, VoiceError};
use crate::protocol::{ClientEvent, ResponseConfig, ServerEvent};
use crate::session_config::SessionConfig;

/// Instruction attached to every response request.
pub const RESPONSE_INSTRUCTIONS: &str = "Please respond with audio.";

/// Speech-to-speech conversation session.
///
/// Audio goes out as a user conversation item followed by a response request,
/// since this session runs without a commit step.
pub struct ConversationKind {
    config: Option<Arc<SessionConfig>>,
}

impl ConversationKind {
    pub fn new(config: Option<Arc<SessionConfig>>) -> Self {
        Self { config }
    }

    /// Swap in freshly fetched parameters for the next connection.
    pub fn replace_config(&mut self, config: Arc<SessionConfig>) {
        self.config = Some(config);
    }

    fn modalities(&self) -> Vec<String> {
        match &self.config {
            Some(config) if !config.modalities.is_empty() => config.modalities.clone(),
            _ => vec!["text".to_string(), "audio".to_string()],
        }
    }
}

impl ChannelKind for ConversationKind {
    fn name(&self) -> &'static str {
        "conversation"
    }

    fn is_acknowledgment(&self, event: &ServerEvent) -> bool {
        matches!(event, ServerEvent::SessionCreated | ServerEvent::SessionUpdated)
    }

    fn handshake(&self) -> Result<ClientEvent> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| VoiceError::config("No session config loaded"))?;
        Ok(ClientEvent::SessionUpdate {
            session: SessionConfig::clone(config),
        })
    }

    fn audio_events(&self, audio: String) -> Vec<ClientEvent> {
        vec![
            ClientEvent::user_audio(audio),
            ClientEvent::ResponseCreate {
                response: Some(ResponseConfig {
                    modalities: self.modalities(),
                    instructions: RESPONSE_INSTRUCTIONS.to_string(),
                }),
            },
        ]
    }

    fn dispatch(&mut self, event: ServerEvent) -> Vec<ChannelEvent> {
        match event {
            ServerEvent::SessionCreated => {
                vec![ChannelEvent::Status("Session created successfully".to_string())]
            }
            ServerEvent::SessionUpdated => {
                vec![ChannelEvent::Status("Session updated successfully".to_string())]
            }
            ServerEvent::ResponseCreated { response } => {
                vec![ChannelEvent::ResponseStarted { id: response.id }]
            }
            ServerEvent::AudioDelta { delta, .. } => vec![ChannelEvent::AudioDelta(delta)],
            ServerEvent::AudioDone => vec![ChannelEvent::AudioDone],
            ServerEvent::AudioTranscriptDelta { delta } => {
                if delta.is_empty() {
                    Vec::new()
                } else {
                    vec![ChannelEvent::TranscriptDelta(delta)]
                }
            }
            ServerEvent::AudioTranscriptDone { transcript } => {
                vec![ChannelEvent::TranscriptDone(transcript)]
            }
            ServerEvent::ResponseDone { response } => {
                vec![ChannelEvent::ResponseDone { id: response.id }]
            }
            ServerEvent::Error { error } => vec![ChannelEvent::Error(VoiceError::Protocol {
                code: error.code.clone(),
                message: error.message_or_default().to_string(),
            })],
            ServerEvent::RateLimitsUpdated { rate_limits } => rate_limits
                .and_then(|limits| limits.remaining_requests())
                .map(|remaining_requests| vec![ChannelEvent::RateLimit { remaining_requests }])
                .unwrap_or_default(),
            other => {
                log::debug!("[conversation] unhandled {:?}", other);
                Vec::new()
            }
        }
    }
}
