use crate::audio::{AudioFrame, CaptureEvent, CapturePipeline, PlaybackScheduler, pcm};
use crate::channel::{
    ChannelEvent, ChannelState, ConversationKind, SessionChannel, TranscriptionKind,
    TranscriptionResult,
};
use crate::error::VoiceError;
use crate::net_link::LinkEvent;
use crate::session_config::ConfigSource;
use crate::turn::ResponseTurn;
use crate::ui_bridge::{DisplayEvent, RecordAction, ReplayTarget, StatusLevel, UiCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long a finished turn keeps its audio before being retired.
pub const RETIRE_GRACE: Duration = Duration::from_secs(1);

/// Remaining-request count below which a warning is shown.
pub const RATE_LIMIT_WARNING: u64 = 10;

const DIVIDER: &str = "---";

/// Error text for the display log, without the category prefix.
fn describe(error: &VoiceError) -> String {
    match error {
        VoiceError::Device { message }
        | VoiceError::Transport { message }
        | VoiceError::Format { message }
        | VoiceError::Protocol { message, .. }
        | VoiceError::Config { message } => message.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    RetireTurn(u64),
}

/// Queues the controller writes to. The receivers are polled by the main loop.
pub struct ControllerSinks {
    pub capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    pub timer_tx: mpsc::UnboundedSender<TimerEvent>,
    pub display_tx: mpsc::UnboundedSender<DisplayEvent>,
}

/// A finished reply, kept for pairing with what the user said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub id: u64,
    pub transcript: String,
    pub latency: Option<Duration>,
}

/// One user utterance and the reply it is assumed to belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange<'a> {
    pub user: Option<&'a TranscriptionResult>,
    pub reply: Option<&'a TurnRecord>,
}

/// Pair the n-th transcription with the n-th finished reply.
///
/// Nothing ties a transcription to a turn on the wire, so a dropped or
/// failed transcription shifts every later pair by one.
pub fn pair_by_arrival_order<'a>(
    transcriptions: &'a [TranscriptionResult],
    replies: &'a [TurnRecord],
) -> Vec<Exchange<'a>> {
    let len = transcriptions.len().max(replies.len());
    (0..len)
        .map(|i| Exchange {
            user: transcriptions.get(i),
            reply: replies.get(i),
        })
        .collect()
}

pub struct ConversationController {
    conversation: SessionChannel<ConversationKind>,
    transcription: SessionChannel<TranscriptionKind>,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    config_source: Arc<dyn ConfigSource>,
    sinks: ControllerSinks,
    current_turn: Option<ResponseTurn>,
    next_turn_id: u64,
    audio_sent_at: Option<Instant>,
    messages: Vec<String>,
    transcriptions: Vec<TranscriptionResult>,
    replies: Vec<TurnRecord>,
}

impl ConversationController {
    pub fn new(
        conversation: SessionChannel<ConversationKind>,
        transcription: SessionChannel<TranscriptionKind>,
        capture: CapturePipeline,
        scheduler: PlaybackScheduler,
        config_source: Arc<dyn ConfigSource>,
        sinks: ControllerSinks,
    ) -> Self {
        Self {
            conversation,
            transcription,
            capture,
            scheduler,
            config_source,
            sinks,
            current_turn: None,
            next_turn_id: 0,
            audio_sent_at: None,
            messages: Vec::new(),
            transcriptions: Vec::new(),
            replies: Vec::new(),
        }
    }

    /// Display log, oldest first.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn transcriptions(&self) -> &[TranscriptionResult] {
        &self.transcriptions
    }

    pub fn exchanges(&self) -> Vec<Exchange<'_>> {
        pair_by_arrival_order(&self.transcriptions, &self.replies)
    }

    pub fn current_turn(&self) -> Option<&ResponseTurn> {
        self.current_turn.as_ref()
    }

    pub fn conversation(&self) -> &SessionChannel<ConversationKind> {
        &self.conversation
    }

    pub fn transcription(&self) -> &SessionChannel<TranscriptionKind> {
        &self.transcription
    }

    // ======================== Display ========================

    fn add_message(&mut self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{}", text);
        self.messages.push(text.clone());
        self.display(DisplayEvent::Log { text });
    }

    fn add_divided_message(&mut self, text: impl Into<String>) {
        self.add_message(DIVIDER);
        self.add_message(text);
    }

    fn set_status(&self, level: StatusLevel, text: &str) {
        self.display(DisplayEvent::Status {
            level,
            text: text.to_string(),
        });
    }

    fn display(&self, event: DisplayEvent) {
        if self.sinks.display_tx.send(event).is_err() {
            log::debug!("Display queue closed");
        }
    }

    /// Push the recording clock while capturing.
    pub fn tick_recording(&self) {
        if self.capture.is_capturing() {
            self.display(DisplayEvent::Recording {
                active: true,
                time: self.capture.recording_time(),
            });
        }
    }

    // ======================== Connection ========================

    /// Fetch fresh session parameters and open both channels.
    pub async fn connect(&mut self) {
        if matches!(
            self.conversation.state(),
            ChannelState::Connecting | ChannelState::AwaitingHandshake | ChannelState::Ready
        ) {
            log::debug!("Conversation already {:?}", self.conversation.state());
        } else {
            match self.config_source.fetch().await {
                Ok(config) => {
                    log::info!(
                        "Session config loaded: voice={}, vad={:?}, transcription={}",
                        config.voice,
                        config.vad_mode(),
                        config.transcription_model().unwrap_or("off")
                    );
                    self.conversation.kind_mut().replace_config(Arc::new(config));
                    self.conversation.connect();
                }
                Err(e) => {
                    self.add_message(format!("Failed to connect: {}", describe(&e)));
                    self.set_status(StatusLevel::Error, "Disconnected from server");
                }
            }
        }
        self.transcription.connect();
    }

    /// Close both channels and drop any reply in progress.
    pub fn disconnect(&mut self) {
        let was_open = self.conversation.is_ready();
        self.conversation.disconnect();
        self.transcription.disconnect();
        self.current_turn = None;
        self.scheduler.close();
        if was_open {
            self.add_message("Disconnected (normal)");
        }
        self.set_status(StatusLevel::Error, "Disconnected from server");
    }

    /// Release the microphone, both channels and the output device.
    pub fn shutdown(&mut self) {
        self.capture.stop();
        self.conversation.disconnect();
        self.transcription.disconnect();
        self.current_turn = None;
        self.scheduler.close();
    }

    // ======================== Conversation ========================

    pub fn handle_conversation_event(&mut self, event: LinkEvent) {
        for event in self.conversation.handle_link_event(event) {
            self.on_conversation_event(event);
        }
    }

    fn on_conversation_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                self.add_message("Connected to server");
                self.set_status(StatusLevel::Success, "Connected - Ready to talk!");
            }
            ChannelEvent::Ready => self.add_message("Session configured"),
            ChannelEvent::Status(line) => self.add_message(line),
            ChannelEvent::Closed { clean, reason } => {
                log::debug!("Conversation close reason: {}", reason);
                self.add_message(format!(
                    "Disconnected ({})",
                    if clean { "normal" } else { "unexpected" }
                ));
                self.set_status(StatusLevel::Error, "Disconnected from server");
            }
            ChannelEvent::TransportError(e) => {
                self.add_message(format!("Connection error: {}", describe(&e)));
                self.set_status(StatusLevel::Error, "Disconnected from server");
            }
            ChannelEvent::ResponseStarted { id } => self.begin_turn(id),
            ChannelEvent::AudioDelta(delta) => self.on_audio_delta(&delta),
            ChannelEvent::AudioDone => log::debug!("Response audio stream complete"),
            ChannelEvent::TranscriptDelta(delta) => {
                if let Some(turn) = self.current_turn.as_mut() {
                    turn.append_transcript(&delta);
                }
            }
            ChannelEvent::TranscriptDone(transcript) => self.on_transcript_done(transcript),
            ChannelEvent::ResponseDone { id } => self.finish_turn(id),
            ChannelEvent::RateLimit { remaining_requests } => {
                if remaining_requests < RATE_LIMIT_WARNING {
                    self.add_message(format!(
                        "Low rate limit: {} requests remaining",
                        remaining_requests
                    ));
                }
            }
            ChannelEvent::Error(VoiceError::Protocol { message, .. }) => {
                self.add_message(format!("API Error: {}", message));
            }
            ChannelEvent::Error(e) => self.add_message(describe(&e)),
            other => log::debug!("Conversation event not handled: {:?}", other),
        }
    }

    fn begin_turn(&mut self, response_id: Option<String>) {
        self.next_turn_id += 1;
        log::info!(
            "Turn {} started (response {})",
            self.next_turn_id,
            response_id.as_deref().unwrap_or("?")
        );
        self.current_turn = Some(ResponseTurn::new(self.next_turn_id, response_id));
        self.scheduler.reset();
        self.add_divided_message("AI is responding...");
    }

    fn on_audio_delta(&mut self, delta: &str) {
        let frame = match pcm::from_transport_bytes(delta) {
            Ok(frame) => frame,
            Err(e) => {
                self.add_message(format!("Audio streaming error: {}", describe(&e)));
                return;
            }
        };

        if self.current_turn.is_none() {
            // a turn already ran, so this is the tail of a retired one
            if self.next_turn_id > 0 {
                log::debug!("Dropping audio delta after turn retired");
                return;
            }
            log::warn!("Audio delta without response.created, starting a turn");
            self.begin_turn(None);
        }
        let audio_sent_at = self.audio_sent_at;
        let mut latency_line = None;
        if let Some(turn) = self.current_turn.as_mut() {
            if turn.record_frame(frame.clone()) {
                if let Some(sent) = audio_sent_at {
                    let latency = sent.elapsed();
                    turn.set_latency(latency);
                    latency_line = Some(format!(
                        "AI is responding. (latency: {:.1}s)",
                        latency.as_secs_f64()
                    ));
                }
            }
        }
        if let Some(line) = latency_line {
            self.add_message(line);
        }

        match self.scheduler.enqueue(&frame) {
            Ok(unit) => log::debug!(
                "Scheduled {:.3}s of audio at {:.3}",
                unit.duration,
                unit.start
            ),
            Err(e) => self.add_message(format!("Audio streaming error: {}", describe(&e))),
        }
    }

    fn on_transcript_done(&mut self, transcript: Option<String>) {
        let Some(turn) = self.current_turn.as_mut() else {
            return;
        };
        if turn.transcript().is_empty() {
            if let Some(text) = transcript.as_deref() {
                turn.append_transcript(text);
            }
        }
        if !turn.transcript().is_empty() {
            let line = format!("AI: \"{}\"", turn.transcript());
            self.add_message(line);
        }
    }

    fn finish_turn(&mut self, response_id: Option<String>) {
        let Some(turn) = self.current_turn.as_mut() else {
            log::debug!("response.done without an active turn");
            return;
        };
        if response_id.is_some() && turn.response_id.is_some() && turn.response_id != response_id {
            log::warn!(
                "response.done for {:?} while {:?} is active",
                response_id,
                turn.response_id
            );
        }
        turn.finish();
        log::info!(
            "Turn {} done in {:?}, {} frames",
            turn.id,
            turn.elapsed().unwrap_or_default(),
            turn.frames().len()
        );
        self.replies.push(TurnRecord {
            id: turn.id,
            transcript: turn.transcript().to_string(),
            latency: turn.latency(),
        });

        let id = turn.id;
        let timer_tx = self.sinks.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETIRE_GRACE).await;
            let _ = timer_tx.send(TimerEvent::RetireTurn(id));
        });
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RetireTurn(id) => {
                let matches = self
                    .current_turn
                    .as_ref()
                    .is_some_and(|turn| turn.id == id && turn.is_finished());
                if !matches {
                    log::debug!("Turn {} already superseded", id);
                    return;
                }
                if let Some(mut turn) = self.current_turn.take() {
                    turn.release();
                }
                self.scheduler.reset();
                log::debug!("Turn {} retired", id);
            }
        }
    }

    // ======================== Transcription ========================

    pub fn handle_transcription_event(&mut self, event: LinkEvent) {
        for event in self.transcription.handle_link_event(event) {
            self.on_transcription_event(event);
        }
    }

    fn on_transcription_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => log::info!("Connected to transcription service"),
            ChannelEvent::Ready => log::info!("Transcription session configured"),
            ChannelEvent::Closed { reason, .. } => {
                log::info!("Disconnected from transcription: {}", reason)
            }
            ChannelEvent::TransportError(e) => log::warn!("Transcription connection error: {}", e),
            ChannelEvent::SpeechStarted | ChannelEvent::SpeechStopped => log::debug!(
                "Speech activity, transcribing={}",
                self.transcription.is_transcribing()
            ),
            ChannelEvent::Transcription(result) => {
                let text = format!("[TRANSCRIPTION] {}", result.text);
                self.transcriptions.push(result);
                self.display(DisplayEvent::Transcription { text });

                let exchanges = self.exchanges();
                if let Some(Exchange { reply: Some(reply), .. }) = exchanges.last() {
                    log::debug!("Transcription paired with turn {}", reply.id);
                }
            }
            ChannelEvent::Error(e) => log::warn!("Transcription error: {}", e),
            other => log::debug!("Transcription event not handled: {:?}", other),
        }
    }

    // ======================== Capture ========================

    pub fn start_recording(&mut self) -> bool {
        if self.capture.is_capturing() {
            return true;
        }
        if !self.conversation.is_ready() {
            self.set_status(StatusLevel::Error, "Not connected to server");
            return false;
        }

        let complete_tx = self.sinks.capture_tx.clone();
        let chunk_tx = self.sinks.capture_tx.clone();
        let started = self.capture.start(
            Box::new(move |frame| {
                let _ = complete_tx.send(CaptureEvent::Complete(frame));
            }),
            Some(Box::new(move |frame| {
                let _ = chunk_tx.send(CaptureEvent::Chunk(frame));
            })),
        );
        if started {
            self.set_status(StatusLevel::Info, "Recording... Release to send");
            self.tick_recording();
        } else {
            self.set_status(
                StatusLevel::Error,
                "Failed to start recording. Please check microphone permissions.",
            );
        }
        started
    }

    pub fn stop_recording(&mut self) {
        if !self.capture.is_capturing() {
            return;
        }
        self.capture.stop();
        self.display(DisplayEvent::Recording {
            active: false,
            time: self.capture.recording_time(),
        });
        self.set_status(StatusLevel::Info, "Processing audio...");
    }

    pub fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(frame) => {
                if !self.transcription.send_audio(&frame) {
                    log::debug!("Transcription not ready, dropped {} samples", frame.len());
                }
            }
            CaptureEvent::Complete(frame) => self.on_recording_complete(frame),
        }
    }

    fn on_recording_complete(&mut self, frame: AudioFrame) {
        if self.conversation.send_audio(&frame) {
            self.audio_sent_at = Some(Instant::now());
            self.add_divided_message(format!("Audio sent ({:.1}s)", frame.duration_secs()));
            self.set_status(StatusLevel::Info, "Audio sent, waiting for response...");
        } else {
            log::error!("Cannot send audio in state {:?}", self.conversation.state());
            self.set_status(StatusLevel::Error, "Failed to send audio");
        }

        if !self.transcription.commit_buffer() {
            log::debug!("Transcription not ready, nothing committed");
        }
    }

    // ======================== Local actions ========================

    pub fn send_text(&mut self, text: &str) -> bool {
        let sent = self.conversation.send_raw(text);
        if sent {
            self.add_message(format!("Sent: {}", text));
        } else {
            log::warn!("Message not sent in state {:?}", self.conversation.state());
        }
        sent
    }

    pub fn replay_recording(&mut self) {
        let frame = match self.capture.last_recording().map(pcm::decode_container) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                self.add_message(format!("Audio playback error: {}", describe(&e)));
                return;
            }
            None => {
                self.add_message("No recording available");
                return;
            }
        };
        self.play(&frame);
    }

    pub fn replay_response(&mut self) {
        let artifact = match self.current_turn.as_ref().map(|turn| turn.replay_artifact()) {
            Some(Ok(Some(artifact))) => artifact,
            Some(Err(e)) => {
                self.add_message(format!("Audio playback error: {}", describe(&e)));
                return;
            }
            Some(Ok(None)) | None => {
                self.add_message("No audio response to play");
                return;
            }
        };
        self.add_message("Playing AI response...");
        match pcm::decode_container(&artifact) {
            Ok(frame) => self.play(&frame),
            Err(e) => self.add_message(format!("Audio playback error: {}", describe(&e))),
        }
    }

    fn play(&mut self, frame: &AudioFrame) {
        if let Err(e) = self.scheduler.enqueue(frame) {
            self.add_message(format!("Audio playback error: {}", describe(&e)));
        }
    }

    pub async fn handle_ui_command(&mut self, command: UiCommand) {
        log::debug!("UI command: {:?}", command);
        match command {
            UiCommand::Connect => self.connect().await,
            UiCommand::Disconnect => self.disconnect(),
            UiCommand::Record { action: RecordAction::Start } => {
                self.start_recording();
            }
            UiCommand::Record { action: RecordAction::Stop } => self.stop_recording(),
            UiCommand::Text { text } => {
                if !self.send_text(&text) {
                    self.set_status(StatusLevel::Error, "Failed to send message");
                }
            }
            UiCommand::Replay { target: ReplayTarget::Recording } => self.replay_recording(),
            UiCommand::Replay { target: ReplayTarget::Response } => self.replay_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioOutput, AudioSource, PlaybackUnit};
    use crate::channel::TranscriptionSettings;
    use crate::channel::testing::{MockTransport, link, text};
    use crate::error::Result;
    use crate::net_link::NetEvent;
    use crate::session_config::SessionConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct StaticConfig(Option<SessionConfig>);

    #[async_trait]
    impl ConfigSource for StaticConfig {
        async fn fetch(&self) -> Result<SessionConfig> {
            self.0
                .clone()
                .ok_or_else(|| VoiceError::config("Failed to fetch session config: 500"))
        }
    }

    #[derive(Clone, Default)]
    struct ManualOutput {
        now: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(f64, f64)>>>,
    }

    impl AudioOutput for ManualOutput {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn schedule(&mut self, unit: PlaybackUnit, start_at: f64) -> Result<()> {
            self.scheduled.lock().unwrap().push((start_at, unit.duration()));
            Ok(())
        }
    }

    /// Microphone that is either denied or already exhausted.
    struct FixedSource {
        deny: bool,
    }

    impl AudioSource for FixedSource {
        fn start(&mut self) -> Result<()> {
            if self.deny {
                return Err(VoiceError::device("permission denied"));
            }
            Ok(())
        }

        fn read_samples(&mut self) -> Result<Vec<f32>> {
            Ok(Vec::new())
        }

        fn stop(&mut self) {}
    }

    struct Harness {
        controller: ConversationController,
        conversation: Arc<MockTransport>,
        transcription: Arc<MockTransport>,
        output: ManualOutput,
        display_rx: mpsc::UnboundedReceiver<DisplayEvent>,
        timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
        _capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        _link_rx: mpsc::Receiver<LinkEvent>,
    }

    fn harness_with(config: Option<SessionConfig>, deny_microphone: bool) -> Harness {
        let conversation = Arc::new(MockTransport::default());
        let transcription = Arc::new(MockTransport::default());
        let (link_tx, link_rx) = mpsc::channel(16);
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = mpsc::unbounded_channel();

        let output = ManualOutput::default();
        let factory_output = output.clone();
        let scheduler = PlaybackScheduler::new(Box::new(move || {
            Ok(Box::new(factory_output.clone()) as Box<dyn AudioOutput>)
        }));

        let controller = ConversationController::new(
            SessionChannel::new(
                ConversationKind::new(None),
                "ws://localhost:8000/realtime",
                conversation.clone(),
                link_tx.clone(),
            ),
            SessionChannel::new(
                TranscriptionKind::new(TranscriptionSettings::default()),
                "ws://localhost:8000/transcription",
                transcription.clone(),
                link_tx,
            ),
            CapturePipeline::new(Box::new(FixedSource { deny: deny_microphone })),
            scheduler,
            Arc::new(StaticConfig(config)),
            ControllerSinks {
                capture_tx,
                timer_tx,
                display_tx,
            },
        );

        Harness {
            controller,
            conversation,
            transcription,
            output,
            display_rx,
            timer_rx,
            _capture_rx: capture_rx,
            _link_rx: link_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(Some(SessionConfig::default()), false)
    }

    impl Harness {
        async fn connect_both(&mut self) {
            self.controller.connect().await;
            self.conversation_says(link(1, NetEvent::Connected));
            self.conversation_says(text(1, json!({ "type": "session.created" })));
            self.controller
                .handle_transcription_event(link(1, NetEvent::Connected));
            self.controller
                .handle_transcription_event(text(1, json!({ "type": "connection.established" })));
            self.conversation.sent();
            self.transcription.sent();
        }

        fn conversation_says(&mut self, event: LinkEvent) {
            self.controller.handle_conversation_event(event);
        }

        fn statuses(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(event) = self.display_rx.try_recv() {
                if let DisplayEvent::Status { text, .. } = event {
                    out.push(text);
                }
            }
            out
        }
    }

    fn delta_of(samples: usize) -> String {
        pcm::to_transport_bytes(&AudioFrame::new(vec![500; samples])).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_logs_handshake_progress() {
        let mut h = harness();
        h.connect_both().await;

        assert!(h.controller.conversation().is_ready());
        assert!(h.controller.transcription().is_ready());
        assert_eq!(
            h.controller.messages(),
            &[
                "Connected to server",
                "Session created successfully",
                "Session configured"
            ]
        );
        assert!(h.statuses().contains(&"Connected - Ready to talk!".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn config_failure_is_reported_and_skips_conversation() {
        let mut h = harness_with(None, false);
        h.controller.connect().await;

        assert_eq!(h.conversation.open_count(), 0);
        assert_eq!(h.transcription.open_count(), 1);
        assert_eq!(
            h.controller.messages(),
            &["Failed to connect: Failed to fetch session config: 500"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_reply_is_gapless_with_latency_once() {
        let mut h = harness();
        h.connect_both().await;
        *h.output.now.lock().unwrap() = 3.0;

        h.controller
            .handle_capture_event(CaptureEvent::Complete(AudioFrame::new(vec![1; 36_000])));
        let sent = h.conversation.sent();
        assert_eq!(sent[0]["type"], "conversation.item.create");
        assert_eq!(sent[1]["type"], "response.create");
        assert_eq!(h.transcription.sent(), vec![json!({ "type": "input_audio_buffer.commit" })]);

        tokio::time::advance(Duration::from_millis(800)).await;
        h.conversation_says(text(
            1,
            json!({ "type": "response.created", "response": { "id": "resp_1" } }),
        ));
        for _ in 0..3 {
            h.conversation_says(text(
                1,
                json!({ "type": "response.audio.delta", "response_id": "resp_1", "delta": delta_of(2400) }),
            ));
        }
        h.conversation_says(text(1, json!({ "type": "response.audio_transcript.delta", "delta": "Hi " })));
        h.conversation_says(text(1, json!({ "type": "response.audio_transcript.delta", "delta": "there" })));
        h.conversation_says(text(1, json!({ "type": "response.audio_transcript.done" })));
        h.conversation_says(text(
            1,
            json!({ "type": "response.done", "response": { "id": "resp_1", "status": "completed" } }),
        ));

        let scheduled = h.output.scheduled.lock().unwrap().clone();
        assert_eq!(scheduled.len(), 3);
        for (i, (start, duration)) in scheduled.iter().enumerate() {
            assert!((start - (3.0 + i as f64 * 0.1)).abs() < 1e-9, "unit {} at {}", i, start);
            assert!((duration - 0.1).abs() < 1e-9);
        }

        let turn = h.controller.current_turn().unwrap();
        assert_eq!(turn.latency(), Some(Duration::from_millis(800)));
        assert!(turn.is_finished());

        let messages = h.controller.messages();
        assert_eq!(
            &messages[3..],
            &[
                "---",
                "Audio sent (1.5s)",
                "---",
                "AI is responding...",
                "AI is responding. (latency: 0.8s)",
                "AI: \"Hi there\"",
            ]
        );
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.starts_with("AI is responding. (latency"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_turn_is_retired_after_grace() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.created", "response": { "id": "r" } })));
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(2400) })));
        h.conversation_says(text(1, json!({ "type": "response.done", "response": { "id": "r" } })));

        h.controller.replay_response();
        assert_eq!(h.controller.messages().last().unwrap(), "Playing AI response...");

        let started = Instant::now();
        let event = h.timer_rx.recv().await.unwrap();
        assert!(started.elapsed() >= RETIRE_GRACE);
        h.controller.handle_timer(event);

        assert!(h.controller.current_turn().is_none());
        h.controller.replay_response();
        assert_eq!(h.controller.messages().last().unwrap(), "No audio response to play");
    }

    #[tokio::test(start_paused = true)]
    async fn late_delta_after_retirement_is_dropped() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.created", "response": { "id": "r" } })));
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(2400) })));
        h.conversation_says(text(1, json!({ "type": "response.done", "response": { "id": "r" } })));
        let event = h.timer_rx.recv().await.unwrap();
        h.controller.handle_timer(event);

        let messages_before = h.controller.messages().len();
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(2400) })));

        assert!(h.controller.current_turn().is_none());
        assert_eq!(h.controller.messages().len(), messages_before);
        assert_eq!(h.output.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_delta_without_created_opens_a_turn() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(240) })));

        let turn = h.controller.current_turn().unwrap();
        assert_eq!(turn.response_id, None);
        assert_eq!(turn.frames().len(), 1);
        assert_eq!(h.controller.messages().last().unwrap(), "AI is responding...");
    }

    #[tokio::test(start_paused = true)]
    async fn retirement_spares_a_newer_turn() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.created", "response": { "id": "a" } })));
        h.conversation_says(text(1, json!({ "type": "response.done", "response": { "id": "a" } })));
        h.conversation_says(text(1, json!({ "type": "response.created", "response": { "id": "b" } })));
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(240) })));

        let event = h.timer_rx.recv().await.unwrap();
        assert_eq!(event, TimerEvent::RetireTurn(1));
        h.controller.handle_timer(event);

        let turn = h.controller.current_turn().unwrap();
        assert_eq!(turn.response_id.as_deref(), Some("b"));
        assert_eq!(turn.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_audio_delta_does_not_stop_the_stream() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.created", "response": {} })));
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": "AAA" })));
        h.conversation_says(text(1, json!({ "type": "response.audio.delta", "delta": delta_of(480) })));

        assert!(h
            .controller
            .messages()
            .iter()
            .any(|m| m.starts_with("Audio streaming error:")));
        assert_eq!(h.output.scheduled.lock().unwrap().len(), 1);
        assert!(h.controller.conversation().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_and_rate_limits_become_log_lines() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "error", "error": { "message": "Invalid audio" } })));
        h.conversation_says(text(
            1,
            json!({ "type": "rate_limits.updated", "rate_limits": [{ "name": "requests", "remaining": 3 }] }),
        ));
        h.conversation_says(text(
            1,
            json!({ "type": "rate_limits.updated", "rate_limits": [{ "name": "requests", "remaining": 300 }] }),
        ));
        h.conversation_says(link(1, NetEvent::Closed { clean: false, reason: String::new() }));

        let messages = h.controller.messages();
        let tail = &messages[messages.len() - 3..];
        assert_eq!(
            tail,
            &[
                "API Error: Invalid audio".to_string(),
                "Low rate limit: 3 requests remaining".to_string(),
                "Disconnected (unexpected)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transcriptions_are_listed_and_paired_in_order() {
        let mut h = harness();
        h.connect_both().await;

        h.conversation_says(text(1, json!({ "type": "response.created", "response": { "id": "a" } })));
        h.conversation_says(text(1, json!({ "type": "response.audio_transcript.delta", "delta": "Hello!" })));
        h.conversation_says(text(1, json!({ "type": "response.done", "response": { "id": "a" } })));

        h.controller.handle_transcription_event(text(
            1,
            json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "item_id": "item_1",
                "transcript": "hi"
            }),
        ));
        h.controller.handle_transcription_event(text(
            1,
            json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "item_id": "item_2",
                "transcript": ""
            }),
        ));

        assert_eq!(h.controller.transcriptions().len(), 1);
        let exchanges = h.controller.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].user.unwrap().text, "hi");
        assert_eq!(exchanges[0].reply.unwrap().transcript, "Hello!");

        let mut shown = Vec::new();
        while let Ok(event) = h.display_rx.try_recv() {
            if let DisplayEvent::Transcription { text } = event {
                shown.push(text);
            }
        }
        assert_eq!(shown, vec!["[TRANSCRIPTION] hi".to_string()]);
    }

    #[test]
    fn pairing_pads_the_shorter_side() {
        let users = vec![
            TranscriptionResult { text: "one".into(), item_id: None },
            TranscriptionResult { text: "two".into(), item_id: None },
        ];
        let replies = vec![TurnRecord { id: 1, transcript: "uno".into(), latency: None }];

        let pairs = pair_by_arrival_order(&users, &replies);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].reply.unwrap().id, 1);
        assert!(pairs[1].reply.is_none());
        assert_eq!(pairs[1].user.unwrap().text, "two");
        assert!(pair_by_arrival_order(&[], &[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recording_requires_connection_and_microphone() {
        let mut h = harness();
        assert!(!h.controller.start_recording());
        assert_eq!(h.statuses(), vec!["Not connected to server".to_string()]);

        let mut h = harness_with(Some(SessionConfig::default()), true);
        h.connect_both().await;
        h.statuses();
        assert!(!h.controller.start_recording());
        assert_eq!(
            h.statuses(),
            vec!["Failed to start recording. Please check microphone permissions.".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_sets_status() {
        let mut h = harness();
        h.controller
            .handle_capture_event(CaptureEvent::Complete(AudioFrame::new(vec![1; 2400])));
        assert_eq!(h.statuses(), vec!["Failed to send audio".to_string()]);
        assert!(h.controller.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_stream_to_transcription_only() {
        let mut h = harness();
        h.connect_both().await;

        h.controller
            .handle_capture_event(CaptureEvent::Chunk(AudioFrame::new(vec![7; 4096])));
        assert!(h.conversation.sent().is_empty());
        let sent = h.transcription.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "input_audio_buffer.append");
    }

    #[tokio::test(start_paused = true)]
    async fn ui_commands_drive_the_controller() {
        let mut h = harness();
        h.controller.handle_ui_command(UiCommand::Connect).await;
        assert_eq!(h.conversation.open_count(), 1);
        h.conversation_says(link(1, NetEvent::Connected));
        h.conversation_says(text(1, json!({ "type": "session.updated" })));

        h.controller
            .handle_ui_command(UiCommand::Text { text: r#"{"type":"response.create"}"#.into() })
            .await;
        assert_eq!(
            h.controller.messages().last().unwrap(),
            r#"Sent: {"type":"response.create"}"#
        );

        h.controller
            .handle_ui_command(UiCommand::Replay { target: ReplayTarget::Recording })
            .await;
        assert_eq!(h.controller.messages().last().unwrap(), "No recording available");

        h.controller.handle_ui_command(UiCommand::Disconnect).await;
        assert_eq!(h.controller.messages().last().unwrap(), "Disconnected (normal)");
        assert!(h.conversation.last_cancel().is_cancelled());
        assert!(!h.controller.conversation().is_ready());
    }
}
