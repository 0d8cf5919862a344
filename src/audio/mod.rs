//! audio - PCM codec, microphone capture and gapless playback
//!
//! Capture and device playback run on dedicated OS threads; everything else
//! is driven from the controller's event loop.

#[cfg(feature = "device")]
mod alsa_device;
pub mod capture;
mod opus_codec;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod source;
#[cfg(feature = "device")]
mod speex;

pub use capture::{CaptureEvent, CapturePipeline};
pub use output::{AudioOutput, ClockOutput};
pub use pcm::AudioFrame;
pub use playback::{PlaybackScheduler, PlaybackUnit, ScheduledUnit};
pub use source::{AudioSource, WavFileSource};

#[cfg(feature = "device")]
pub use output::AlsaOutput;
#[cfg(feature = "device")]
pub use source::AlsaSource;

/// Stream sample rate used end to end (capture, wire, playback).
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per uncompressed streaming frame handed to `on_chunk`.
pub const CHUNK_SAMPLES: usize = 4096;

/// Cadence of compressed chunks appended to the recording buffer.
pub const COMPRESSED_CHUNK_MS: u32 = 100;

/// Opus frame duration used by the compressed path.
pub const OPUS_FRAME_MS: u32 = 20;

/// Upper bound of samples converted per step in the transport encoder.
pub const TRANSPORT_CHUNK_SAMPLES: usize = 8192;

/// Size of the canonical RIFF/WAVE PCM header.
pub const WAV_HEADER_LEN: usize = 44;
