use std::time::Duration;

use tokio::time::Instant;

use crate::audio::{AudioFrame, SAMPLE_RATE, pcm};
use crate::error::Result;

/// One synthesized reply, from `response.created` until it is retired after
/// the post-completion grace period.
#[derive(Debug)]
pub struct ResponseTurn {
    /// Local sequence number, used to match the retirement timer.
    pub id: u64,
    pub response_id: Option<String>,
    transcript: String,
    frames: Vec<AudioFrame>,
    started_at: Instant,
    finished_at: Option<Instant>,
    first_audio_received: bool,
    latency: Option<Duration>,
}

impl ResponseTurn {
    pub fn new(id: u64, response_id: Option<String>) -> Self {
        Self {
            id,
            response_id,
            transcript: String::new(),
            frames: Vec::new(),
            started_at: Instant::now(),
            finished_at: None,
            first_audio_received: false,
            latency: None,
        }
    }

    pub fn append_transcript(&mut self, delta: &str) {
        self.transcript.push_str(delta);
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Keep a decoded frame. Returns true for the first frame of the turn.
    pub fn record_frame(&mut self, frame: AudioFrame) -> bool {
        self.frames.push(frame);
        let first = !self.first_audio_received;
        self.first_audio_received = true;
        first
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn set_latency(&mut self, latency: Duration) {
        if self.latency.is_none() {
            self.latency = Some(latency);
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn finish(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Time from `response.created` to `response.done`.
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished_at.map(|end| end.duration_since(self.started_at))
    }

    /// All received audio as one WAV artifact, or `None` if nothing arrived.
    pub fn replay_artifact(&self) -> Result<Option<Vec<u8>>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let joined = AudioFrame::concat(&self.frames);
        pcm::encode_container(&joined, SAMPLE_RATE).map(Some)
    }

    /// Drop buffered audio once the turn is over.
    pub fn release(&mut self) {
        self.frames = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_frame_is_first() {
        let mut turn = ResponseTurn::new(1, None);
        assert!(turn.record_frame(AudioFrame::new(vec![1])));
        assert!(!turn.record_frame(AudioFrame::new(vec![2])));
        assert_eq!(turn.frames().len(), 2);
    }

    #[test]
    fn latency_is_recorded_once() {
        let mut turn = ResponseTurn::new(1, None);
        turn.set_latency(Duration::from_millis(800));
        turn.set_latency(Duration::from_millis(900));
        assert_eq!(turn.latency(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn replay_artifact_concatenates_frames() {
        let mut turn = ResponseTurn::new(1, None);
        assert!(turn.replay_artifact().unwrap().is_none());

        turn.record_frame(AudioFrame::new(vec![1, 2]));
        turn.record_frame(AudioFrame::new(vec![3]));
        let wav = turn.replay_artifact().unwrap().unwrap();
        assert_eq!(pcm::decode_container(&wav).unwrap().samples(), &[1, 2, 3]);

        turn.release();
        assert!(turn.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_spans_start_to_finish() {
        let mut turn = ResponseTurn::new(1, Some("resp_1".into()));
        tokio::time::advance(Duration::from_secs(2)).await;
        turn.finish();
        assert!(turn.is_finished());
        assert_eq!(turn.elapsed(), Some(Duration::from_secs(2)));
    }
}
