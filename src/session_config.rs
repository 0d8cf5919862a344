use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Remote session parameters, fetched once per connection attempt and sent
/// verbatim as the body of `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default)]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    /// `null` on the wire selects manual commits, so it is never skipped.
    #[serde(default)]
    pub turn_detection: Option<TurnDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    #[serde(rename = "semantic_vad")]
    SemanticVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eagerness: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadMode {
    /// The server decides where turns end.
    ServerAutomatic,
    /// The client commits and requests responses itself.
    Manual,
}

impl SessionConfig {
    pub fn vad_mode(&self) -> VadMode {
        match self.turn_detection {
            Some(_) => VadMode::ServerAutomatic,
            None => VadMode::Manual,
        }
    }

    pub fn transcription_model(&self) -> Option<&str> {
        self.input_audio_transcription.as_ref().map(|t| t.model.as_str())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: "You are a helpful voice assistant. Please respond with both text and audio. Always provide an audio response.".to_string(),
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputAudioTranscription {
                model: "whisper-1".to_string(),
                language: None,
            }),
            turn_detection: None,
        }
    }
}

/// Where session parameters come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<SessionConfig>;
}

/// Fetches the config document from the backend over HTTP.
pub struct HttpConfigSource {
    client: Client,
    url: String,
    access_token: Option<String>,
}

impl HttpConfigSource {
    pub fn new(url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            access_token: access_token.filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<SessionConfig> {
        log::info!("Fetching session config via HTTP: {}", self.url);

        let mut request = self.client.get(&self.url).header("Accept", "application/json");
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::config(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoiceError::config(format!(
                "Failed to fetch session config: {}",
                response.status().as_u16()
            )));
        }

        response
            .json::<SessionConfig>()
            .await
            .map_err(|e| VoiceError::config(format!("Session config parse error: {}", e)))
    }
}
