//! Realtime API message types.
//!
//! Every message is a JSON object carrying a `type` discriminator.
//!
//! Client events (sent to server):
//! - session.update - conversation session parameters
//! - transcription_session.update - transcription session parameters
//! - conversation.item.create - user audio as a conversation item
//! - input_audio_buffer.append / commit - streamed transcription audio
//! - response.create - ask for a reply
//!
//! Server events are decoded leniently: missing fields fall back to defaults
//! and unknown types decode to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

use crate::session_config::{SessionConfig, TurnDetection};

// =============================================================================
// Client Events
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "transcription_session.update")]
    TranscriptionSessionUpdate { session: TranscriptionSession },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64 PCM16 little-endian
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },
}

impl ClientEvent {
    /// A user message holding one `input_audio` part.
    pub fn user_audio(audio: String) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                item_type: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart {
                    content_type: "input_audio".to_string(),
                    audio: Some(audio),
                }],
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::TranscriptionSessionUpdate { .. } => "transcription_session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCreate { .. } => "response.create",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSession {
    pub input_audio_format: String,
    pub input_audio_transcription: TranscriptionParams,
    /// Always `null`: audio is committed by the client.
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_noise_reduction: Option<NoiseReduction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionParams {
    pub model: String,
    pub prompt: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseReduction {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
}

// =============================================================================
// Server Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent by the transcription proxy once its upstream is connected.
    #[serde(rename = "connection.established")]
    ConnectionEstablished,

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "transcription_session.created")]
    TranscriptionSessionCreated,

    #[serde(rename = "transcription_session.updated")]
    TranscriptionSessionUpdated,

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: Option<ApiError>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ApiError,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Option<RateLimits>,
    },

    /// Any message type this client does not interpret.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn message_or_default(&self) -> &str {
        if self.message.is_empty() {
            "Unknown error"
        } else {
            &self.message
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Rate limit notice. The API sends a list of named limits; older proxies
/// send a flat summary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RateLimits {
    List(Vec<RateLimit>),
    Summary { remaining_requests: u64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimit {
    pub name: String,
    #[serde(default)]
    pub limit: Option<u64>,
    pub remaining: u64,
    #[serde(default)]
    pub reset_seconds: Option<f64>,
}

impl RateLimits {
    pub fn remaining_requests(&self) -> Option<u64> {
        match self {
            RateLimits::List(limits) => limits
                .iter()
                .find(|l| l.name == "requests")
                .map(|l| l.remaining),
            RateLimits::Summary { remaining_requests } => Some(*remaining_requests),
        }
    }
}

/// Just the discriminator, for logging messages we do not decode.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Read the `type` tag without decoding the rest of the message.
pub fn message_type(text: &str) -> Option<String> {
    serde_json::from_str::<Envelope>(text).ok().map(|e| e.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ServerEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn user_audio_item_shape() {
        let value = serde_json::to_value(ClientEvent::user_audio("AAA=".into())).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_audio", "audio": "AAA=" }]
                }
            })
        );
    }

    #[test]
    fn commit_and_response_create_shapes() {
        assert_eq!(
            serde_json::to_value(ClientEvent::InputAudioBufferCommit).unwrap(),
            json!({ "type": "input_audio_buffer.commit" })
        );
        let create = ClientEvent::ResponseCreate {
            response: Some(ResponseConfig {
                modalities: vec!["text".into(), "audio".into()],
                instructions: "Please respond with audio.".into(),
            }),
        };
        let value = serde_json::to_value(&create).unwrap();
        assert_eq!(value["type"], "response.create");
        assert_eq!(value["response"]["modalities"], json!(["text", "audio"]));
        assert_eq!(create.kind(), "response.create");
    }

    #[test]
    fn transcription_update_keeps_null_turn_detection() {
        let event = ClientEvent::TranscriptionSessionUpdate {
            session: TranscriptionSession {
                input_audio_format: "pcm16".into(),
                input_audio_transcription: TranscriptionParams {
                    model: "gpt-4o-transcribe".into(),
                    prompt: String::new(),
                    language: "en".into(),
                },
                turn_detection: None,
                input_audio_noise_reduction: Some(NoiseReduction { kind: "near_field".into() }),
                include: vec!["item.input_audio_transcription.logprobs".into()],
            },
        };
        let value = serde_json::to_value(event).unwrap();
        assert!(value["session"]["turn_detection"].is_null());
        assert_eq!(value["session"]["input_audio_noise_reduction"]["type"], "near_field");
        assert_eq!(value["session"]["input_audio_transcription"]["prompt"], "");
    }

    #[test]
    fn parses_session_ack_ignoring_payload() {
        let event = parse(json!({ "type": "session.created", "session": { "id": "sess_1" } }));
        assert_eq!(event, ServerEvent::SessionCreated);
    }

    #[test]
    fn parses_audio_delta() {
        let event = parse(json!({
            "type": "response.audio.delta",
            "response_id": "resp_1",
            "item_id": "item_1",
            "delta": "AQD//w=="
        }));
        assert_eq!(
            event,
            ServerEvent::AudioDelta {
                response_id: Some("resp_1".into()),
                delta: "AQD//w==".into()
            }
        );
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let event = parse(json!({ "type": "conversation.item.input_audio_transcription.completed" }));
        assert_eq!(
            event,
            ServerEvent::TranscriptionCompleted { item_id: None, transcript: String::new() }
        );
        let event = parse(json!({ "type": "error" }));
        match event {
            ServerEvent::Error { error } => assert_eq!(error.message_or_default(), "Unknown error"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let text = r#"{"type":"response.output_item.added","item":{}}"#;
        let event: ServerEvent = serde_json::from_str(text).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
        assert_eq!(message_type(text).as_deref(), Some("response.output_item.added"));
    }

    #[test]
    fn rate_limits_in_both_shapes() {
        let list = parse(json!({
            "type": "rate_limits.updated",
            "rate_limits": [
                { "name": "requests", "limit": 1000, "remaining": 7, "reset_seconds": 0.5 },
                { "name": "tokens", "limit": 50000, "remaining": 49000, "reset_seconds": 1.2 }
            ]
        }));
        let summary = parse(json!({
            "type": "rate_limits.updated",
            "rate_limits": { "remaining_requests": 3 }
        }));
        for (event, expected) in [(list, 7), (summary, 3)] {
            match event {
                ServerEvent::RateLimitsUpdated { rate_limits: Some(limits) } => {
                    assert_eq!(limits.remaining_requests(), Some(expected))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn error_message_is_kept_verbatim() {
        let event = parse(json!({
            "type": "error",
            "error": { "type": "invalid_request_error", "code": "bad", "message": "Invalid modalities" }
        }));
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.message, "Invalid modalities");
                assert_eq!(error.code.as_deref(), Some("bad"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
