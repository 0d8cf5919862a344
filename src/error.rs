//! Error types shared by the audio engine and the session channels.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone or speaker unavailable / access denied.
    #[error("Audio device error: {message}")]
    Device { message: String },

    /// Connection refused or closed unexpectedly.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed audio container, audio payload or inbound message.
    #[error("Format error: {message}")]
    Format { message: String },

    /// Error reported by the remote service. Does not close the channel.
    #[error("API error: {message}")]
    Protocol {
        code: Option<String>,
        message: String,
    },

    /// Session configuration could not be obtained.
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
