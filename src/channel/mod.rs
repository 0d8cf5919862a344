//! channel - one duplex connection plus its handshake and dispatch table.
//!
//! `SessionChannel<K>` owns the connection lifecycle; the kind `K` decides
//! which message acknowledges the session, what handshake goes out once it
//! does, how audio is framed and how inbound messages map to
//! [`ChannelEvent`]s.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open──▶ AwaitingHandshake ──ack──▶ Ready
//!                        │                        │                   │
//!                        └──── transport error ───┴───────────────────┴──▶ Failed
//!                                         remote close / disconnect() ───▶ Closed
//! ```

pub mod conversation;
pub mod transcription;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, pcm};
use crate::error::{Result, VoiceError};
use crate::net_link::{LinkEvent, NetCommand, NetEvent, Transport};
use crate::protocol::{self, ClientEvent, ServerEvent};

pub use conversation::ConversationKind;
pub use transcription::{TranscriptionKind, TranscriptionSettings};

/// Outbound messages queued per link before `send` starts failing.
const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    AwaitingHandshake,
    Ready,
    Closed,
    Failed,
}

/// A completed transcript for one user utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionResult {
    pub text: String,
    pub item_id: Option<String>,
}

/// What a channel reports upward after interpreting transport activity.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Transport is open; waiting for the session acknowledgment.
    Opened,
    /// Session acknowledged and handshake sent.
    Ready,
    Closed { clean: bool, reason: String },
    TransportError(VoiceError),
    /// Informational line worth showing the user.
    Status(String),
    SpeechStarted,
    SpeechStopped,
    Transcription(TranscriptionResult),
    ResponseStarted { id: Option<String> },
    AudioDelta(String),
    AudioDone,
    TranscriptDelta(String),
    TranscriptDone(Option<String>),
    ResponseDone { id: Option<String> },
    RateLimit { remaining_requests: u64 },
    /// Malformed inbound message or remote-reported error. The channel stays up.
    Error(VoiceError),
}

/// Per-kind behaviour plugged into [`SessionChannel`].
pub trait ChannelKind: Send {
    fn name(&self) -> &'static str;

    /// Whether `event` acknowledges the session.
    fn is_acknowledgment(&self, event: &ServerEvent) -> bool;

    /// Configuration message sent once the session is acknowledged.
    fn handshake(&self) -> Result<ClientEvent>;

    /// Messages carrying one base64 audio payload.
    fn audio_events(&self, audio: String) -> Vec<ClientEvent>;

    /// Map one inbound message to zero or more channel events.
    fn dispatch(&mut self, event: ServerEvent) -> Vec<ChannelEvent>;

    /// Clear per-connection state.
    fn reset(&mut self) {}
}

pub struct SessionChannel<K: ChannelKind> {
    kind: K,
    url: String,
    transport: Arc<dyn Transport>,
    events_tx: mpsc::Sender<LinkEvent>,
    state: ChannelState,
    link: u64,
    commands: Option<mpsc::Sender<NetCommand>>,
    cancel: Option<CancellationToken>,
}

impl<K: ChannelKind> SessionChannel<K> {
    /// `events_tx` receives this channel's [`LinkEvent`]s; feed them back
    /// through [`handle_link_event`](Self::handle_link_event).
    pub fn new(
        kind: K,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            kind,
            url: url.into(),
            transport,
            events_tx,
            state: ChannelState::Idle,
            link: 0,
            commands: None,
            cancel: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut K {
        &mut self.kind
    }

    /// Open a connection. No-op while one is already opening or open.
    pub fn connect(&mut self) {
        match self.state {
            ChannelState::Connecting | ChannelState::AwaitingHandshake | ChannelState::Ready => {
                log::debug!("[{}] connect ignored in state {:?}", self.kind.name(), self.state);
                return;
            }
            ChannelState::Idle | ChannelState::Closed | ChannelState::Failed => {}
        }

        self.link += 1;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        self.commands = Some(cmd_tx);
        self.cancel = Some(cancel.clone());
        self.kind.reset();
        self.state = ChannelState::Connecting;

        log::info!("[{}] connecting to {} (link {})", self.kind.name(), self.url, self.link);
        self.transport
            .open(self.link, &self.url, self.events_tx.clone(), cmd_rx, cancel);
    }

    /// Apply one transport event. Events from abandoned links are dropped.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Vec<ChannelEvent> {
        if event.link != self.link || self.commands.is_none() {
            log::debug!("[{}] dropping event from stale link {}", self.kind.name(), event.link);
            return Vec::new();
        }

        match event.event {
            NetEvent::Connected => {
                if self.state != ChannelState::Connecting {
                    return Vec::new();
                }
                self.state = ChannelState::AwaitingHandshake;
                log::info!("[{}] transport open, awaiting session", self.kind.name());
                vec![ChannelEvent::Opened]
            }
            NetEvent::Text(text) => self.handle_text(&text),
            NetEvent::Closed { clean, reason } => {
                self.teardown();
                self.state = ChannelState::Closed;
                log::info!("[{}] closed by remote (clean={}): {}", self.kind.name(), clean, reason);
                vec![ChannelEvent::Closed { clean, reason }]
            }
            NetEvent::Failed(message) => {
                self.teardown();
                self.state = ChannelState::Failed;
                log::error!("[{}] transport failed: {}", self.kind.name(), message);
                vec![ChannelEvent::TransportError(VoiceError::transport(message))]
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Vec<ChannelEvent> {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("[{}] unparseable message: {}", self.kind.name(), e);
                return vec![ChannelEvent::Error(VoiceError::format(format!(
                    "Error parsing message: {}",
                    e
                )))];
            }
        };

        if event == ServerEvent::Unknown {
            log::debug!(
                "[{}] ignoring message type {}",
                self.kind.name(),
                protocol::message_type(text).unwrap_or_default()
            );
            return Vec::new();
        }

        let acknowledged =
            self.state == ChannelState::AwaitingHandshake && self.kind.is_acknowledgment(&event);

        let mut events = self.kind.dispatch(event);
        if acknowledged {
            self.state = ChannelState::Ready;
            match self.kind.handshake() {
                Ok(handshake) if self.send(&handshake) => {
                    log::info!("[{}] session ready, sent {}", self.kind.name(), handshake.kind());
                    events.push(ChannelEvent::Ready);
                }
                Ok(handshake) => {
                    events.push(ChannelEvent::Error(VoiceError::transport(format!(
                        "Failed to send {}",
                        handshake.kind()
                    ))));
                }
                Err(e) => events.push(ChannelEvent::Error(e)),
            }
        }
        events
    }

    /// Send a structured event. False unless Ready.
    pub fn send(&self, event: &ClientEvent) -> bool {
        if self.state != ChannelState::Ready {
            return false;
        }
        match serde_json::to_string(event) {
            Ok(text) => self.push(text),
            Err(e) => {
                log::error!("[{}] failed to encode {}: {}", self.kind.name(), event.kind(), e);
                false
            }
        }
    }

    /// Send a raw text message as typed by the user. False unless Ready or
    /// when the text is blank.
    pub fn send_raw(&self, text: &str) -> bool {
        if self.state != ChannelState::Ready || text.trim().is_empty() {
            return false;
        }
        self.push(text.to_string())
    }

    /// Encode `frame` for the wire and send the kind's audio messages.
    pub fn send_audio(&self, frame: &AudioFrame) -> bool {
        if self.state != ChannelState::Ready {
            return false;
        }
        if frame.is_empty() {
            log::warn!("[{}] no audio data to send", self.kind.name());
            return false;
        }
        let audio = match pcm::to_transport_bytes(frame) {
            Ok(audio) => audio,
            Err(e) => {
                log::error!("[{}] error encoding audio: {}", self.kind.name(), e);
                return false;
            }
        };
        self.kind
            .audio_events(audio)
            .iter()
            .all(|event| self.send(event))
    }

    fn push(&self, text: String) -> bool {
        let Some(commands) = self.commands.as_ref() else {
            return false;
        };
        match commands.try_send(NetCommand::SendText(text)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[{}] outbound queue rejected message: {}", self.kind.name(), e);
                false
            }
        }
    }

    /// Close the connection if open. Always ends in Closed.
    pub fn disconnect(&mut self) {
        if self.commands.is_some() {
            log::info!("[{}] disconnecting", self.kind.name());
        }
        self.teardown();
        self.state = ChannelState::Closed;
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.commands = None;
        self.kind.reset();
    }
}

impl<K: ChannelKind> Drop for SessionChannel<K> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}
