//! Capture pipeline: one source, two outputs.
//!
//! While capturing, a worker thread feeds every batch from the source into
//! 1. the compressed recorder, which Opus-encodes the whole session in 100ms
//!    chunks and is turned into one WAV artifact on `stop()`;
//! 2. the optional streaming path, which hands out fixed 4096-sample PCM16
//!    frames to `on_chunk` while capture is still running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::opus_codec::{OpusDecoder, OpusEncoder};
use super::source::AudioSource;
use super::{AudioFrame, CHUNK_SAMPLES, COMPRESSED_CHUNK_MS, OPUS_FRAME_MS, SAMPLE_RATE, pcm};
use crate::error::{Result, VoiceError};

pub type CompleteCallback = Box<dyn FnMut(AudioFrame) + Send>;
pub type ChunkCallback = Box<dyn FnMut(AudioFrame) + Send>;

const OPUS_BITRATE: i32 = 32_000;

/// Capture output routed to the controller's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One streaming frame, in capture order.
    Chunk(AudioFrame),
    /// The whole recording, produced once per `stop()`.
    Complete(AudioFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

pub struct CapturePipeline {
    source: Option<Box<dyn AudioSource>>,
    state: CaptureState,
    compress: bool,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<WorkerOutput>>,
    on_complete: Option<CompleteCallback>,
    started_at: Option<Instant>,
    elapsed: Duration,
    last_recording: Option<Vec<u8>>,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn AudioSource>) -> Self {
        Self {
            source: Some(source),
            state: CaptureState::Idle,
            compress: true,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            on_complete: None,
            started_at: None,
            elapsed: Duration::ZERO,
            last_recording: None,
        }
    }

    /// Skip the compressed recorder; `on_complete` then receives the
    /// concatenated streaming frames.
    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    /// Start capturing. Returns `false` if already capturing or the device
    /// cannot be acquired; errors never escape this call.
    pub fn start(&mut self, on_complete: CompleteCallback, on_chunk: Option<ChunkCallback>) -> bool {
        if self.state == CaptureState::Capturing {
            log::warn!("Capture already running");
            return false;
        }

        let Some(mut source) = self.source.take() else {
            log::error!("Capture source lost after a worker failure");
            return false;
        };

        if let Err(e) = source.start() {
            log::error!("Failed to start capture: {}", e);
            source.stop();
            self.source = Some(source);
            return false;
        }

        let recorder = if self.compress {
            match CompressedRecorder::new() {
                Ok(recorder) => Some(recorder),
                Err(e) => {
                    log::warn!("Compressed recording disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let spawned = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(source, recorder, on_chunk, running));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.on_complete = Some(on_complete);
                self.state = CaptureState::Capturing;
                self.started_at = Some(Instant::now());
                self.elapsed = Duration::ZERO;
                log::info!("Capture started");
                true
            }
            Err(e) => {
                // the source was moved into the closure and is gone with it
                log::error!("Failed to spawn capture thread: {}", e);
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop capturing and deliver the full recording. No-op when idle.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Idle {
            return;
        }
        self.state = CaptureState::Idle;
        self.running.store(false, Ordering::SeqCst);
        if let Some(started) = self.started_at.take() {
            self.elapsed = started.elapsed();
        }

        let Some(handle) = self.worker.take() else {
            return;
        };
        let output = match handle.join() {
            Ok(output) => output,
            Err(_) => {
                log::error!("Capture thread panicked, recording lost");
                return;
            }
        };
        self.source = Some(output.source);

        let mut on_complete = self.on_complete.take();
        match self.finalize(output.recording, output.streamed, output.total_samples) {
            Some(frame) => {
                log::info!(
                    "Capture stopped: {} samples, {:.2}s",
                    frame.len(),
                    frame.duration_secs()
                );
                if let Some(cb) = on_complete.as_mut() {
                    cb(frame);
                }
            }
            None => log::warn!("Capture stopped with no audio"),
        }
    }

    fn finalize(
        &mut self,
        recording: Option<CompressedRecording>,
        streamed: Vec<AudioFrame>,
        total_samples: usize,
    ) -> Option<AudioFrame> {
        if let Some(recording) = recording.filter(|r| !r.is_empty()) {
            match recording
                .decode(total_samples)
                .and_then(|frame| pcm::encode_container(&frame, SAMPLE_RATE))
                .and_then(|artifact| {
                    let frame = pcm::decode_container(&artifact)?;
                    Ok((artifact, frame))
                }) {
                Ok((artifact, frame)) if !frame.is_empty() => {
                    self.last_recording = Some(artifact);
                    return Some(frame);
                }
                Ok(_) => log::warn!("Compressed recording decoded to no audio"),
                Err(e) => log::warn!("Compressed recording unusable: {}", e),
            }
        }

        if streamed.is_empty() {
            return None;
        }
        log::info!("Using {} streamed frames as the recording", streamed.len());
        let frame = AudioFrame::concat(&streamed);
        self.last_recording = pcm::encode_container(&frame, SAMPLE_RATE).ok();
        Some(frame)
    }

    /// WAV bytes of the most recent completed recording.
    pub fn last_recording(&self) -> Option<&[u8]> {
        self.last_recording.as_deref()
    }

    /// Wall-clock recording time as `mm:ss`.
    pub fn recording_time(&self) -> String {
        let elapsed = match self.started_at {
            Some(started) => started.elapsed(),
            None => self.elapsed,
        };
        format_elapsed(elapsed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if let Ok(mut output) = handle.join() {
                output.source.stop();
            }
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

// ======================== Worker ========================

struct WorkerOutput {
    source: Box<dyn AudioSource>,
    recording: Option<CompressedRecording>,
    streamed: Vec<AudioFrame>,
    total_samples: usize,
}

fn capture_thread(
    mut source: Box<dyn AudioSource>,
    mut recorder: Option<CompressedRecorder>,
    mut on_chunk: Option<ChunkCallback>,
    running: Arc<AtomicBool>,
) -> WorkerOutput {
    let mut pending: Vec<i16> = Vec::with_capacity(CHUNK_SAMPLES * 2);
    let mut streamed = Vec::new();
    let mut total_samples = 0usize;

    while running.load(Ordering::Relaxed) {
        let batch = match source.read_samples() {
            Ok(batch) if batch.is_empty() => {
                log::info!("Capture source exhausted");
                break;
            }
            Ok(batch) => batch,
            Err(e) => {
                log::error!("Capture read failed: {}", e);
                break;
            }
        };

        let frame = pcm::encode(&batch);
        total_samples += frame.len();

        if let Some(rec) = recorder.as_mut() {
            if let Err(e) = rec.push(frame.samples()) {
                log::warn!("Opus encode failed, dropping compressed path: {}", e);
                recorder = None;
            }
        }

        if on_chunk.is_some() {
            pending.extend_from_slice(frame.samples());
            while pending.len() >= CHUNK_SAMPLES {
                let chunk = AudioFrame::new(pending.drain(..CHUNK_SAMPLES).collect());
                deliver(&mut on_chunk, &mut streamed, chunk);
            }
        }
    }

    if !pending.is_empty() {
        let chunk = AudioFrame::new(std::mem::take(&mut pending));
        deliver(&mut on_chunk, &mut streamed, chunk);
    }

    source.stop();
    log::info!("Capture thread exiting");

    let recording = recorder.and_then(|rec| match rec.finish() {
        Ok(recording) => Some(recording),
        Err(e) => {
            log::warn!("Failed to flush compressed recording: {}", e);
            None
        }
    });

    WorkerOutput {
        source,
        recording,
        streamed,
        total_samples,
    }
}

fn deliver(on_chunk: &mut Option<ChunkCallback>, streamed: &mut Vec<AudioFrame>, chunk: AudioFrame) {
    if let Some(cb) = on_chunk.as_mut() {
        streamed.push(chunk.clone());
        cb(chunk);
    }
}

// ======================== Compressed path ========================

/// Opus packets grouped into fixed-duration chunks.
struct CompressedRecorder {
    encoder: OpusEncoder,
    pending: Vec<i16>,
    current: Vec<Vec<u8>>,
    chunks: Vec<Vec<Vec<u8>>>,
    packets_per_chunk: usize,
    lookahead: usize,
}

struct CompressedRecording {
    chunks: Vec<Vec<Vec<u8>>>,
    lookahead: usize,
}

impl CompressedRecorder {
    fn new() -> anyhow::Result<Self> {
        let mut encoder = OpusEncoder::new(OPUS_BITRATE)?;
        let lookahead = encoder.lookahead()?;
        Ok(Self {
            pending: Vec::with_capacity(encoder.frame_samples() * 2),
            encoder,
            current: Vec::new(),
            chunks: Vec::new(),
            packets_per_chunk: (COMPRESSED_CHUNK_MS / OPUS_FRAME_MS) as usize,
            lookahead,
        })
    }

    fn push(&mut self, samples: &[i16]) -> anyhow::Result<()> {
        self.pending.extend_from_slice(samples);
        let frame_samples = self.encoder.frame_samples();
        while self.pending.len() >= frame_samples {
            let packet = self.encoder.encode(&self.pending[..frame_samples])?;
            self.pending.drain(..frame_samples);
            self.push_packet(packet);
        }
        Ok(())
    }

    fn push_packet(&mut self, packet: Vec<u8>) {
        self.current.push(packet);
        if self.current.len() == self.packets_per_chunk {
            self.chunks.push(std::mem::take(&mut self.current));
        }
    }

    /// Flush the encoder delay, pad the last partial frame with silence and
    /// close the open chunk.
    fn finish(mut self) -> anyhow::Result<CompressedRecording> {
        let flush = vec![0i16; self.lookahead];
        self.push(&flush)?;
        if !self.pending.is_empty() {
            let frame_samples = self.encoder.frame_samples();
            self.pending.resize(frame_samples, 0);
            let packet = self.encoder.encode(&self.pending)?;
            self.push_packet(packet);
        }
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
        Ok(CompressedRecording {
            chunks: self.chunks,
            lookahead: self.lookahead,
        })
    }
}

impl CompressedRecording {
    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Decode every packet, drop the encoder delay and trim the padding.
    fn decode(&self, total_samples: usize) -> Result<AudioFrame> {
        let mut decoder = OpusDecoder::new()
            .map_err(|e| VoiceError::format(format!("Opus decoder unavailable: {}", e)))?;
        let mut samples = Vec::with_capacity(total_samples);
        for packet in self.chunks.iter().flatten() {
            let pcm = decoder
                .decode(packet)
                .map_err(|e| VoiceError::format(format!("Opus decode failed: {}", e)))?;
            samples.extend_from_slice(&pcm);
        }
        Ok(AudioFrame::new(align_decoded(samples, self.lookahead, total_samples)))
    }
}

/// Shift decoded audio back by the encoder delay and cut it to the captured
/// length.
fn align_decoded(mut samples: Vec<i16>, lookahead: usize, total_samples: usize) -> Vec<i16> {
    samples.drain(..lookahead.min(samples.len()));
    samples.truncate(total_samples);
    samples
}
