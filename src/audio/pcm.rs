//! PCM16 codec: float → fixed-point conversion, the WAV container used for
//! local artifacts, and the base64 text encoding used on the wire.

use std::io::{Cursor, Write};

use base64::prelude::*;
use base64::write::EncoderStringWriter;

use super::{SAMPLE_RATE, TRANSPORT_CHUNK_SAMPLES};
use crate::error::{Result, VoiceError};

/// Mono, 16-bit, 24 kHz linear audio buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds at the fixed stream rate.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Join frames back to back, preserving order.
    pub fn concat<'a>(frames: impl IntoIterator<Item = &'a AudioFrame>) -> AudioFrame {
        let mut samples = Vec::new();
        for frame in frames {
            samples.extend_from_slice(&frame.samples);
        }
        AudioFrame { samples }
    }
}

/// Convert float samples (-1.0 ..= 1.0) to PCM16.
///
/// Negative values scale by 32768 and non-negative by 32767 so both extremes
/// land exactly on the i16 limits.
pub fn encode(samples: &[f32]) -> AudioFrame {
    let mut out = Vec::with_capacity(samples.len());
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.push(value as i16);
    }
    AudioFrame { samples: out }
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Build a 44-byte-header WAV (PCM, mono, 16-bit) around the frame.
pub fn encode_container(frame: &AudioFrame, sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(super::WAV_HEADER_LEN + frame.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| VoiceError::format(format!("Failed to write WAV header: {}", e)))?;
        for &sample in frame.samples() {
            writer
                .write_sample(sample)
                .map_err(|e| VoiceError::format(format!("Failed to write WAV sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::format(format!("Failed to finalize WAV: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Parse a PCM16 mono WAV back into a frame.
///
/// Rejects non-PCM, multi-channel or non-16-bit data, and data chunks that
/// declare more bytes than are present.
pub fn decode_container(bytes: &[u8]) -> Result<AudioFrame> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::format(format!("Failed to parse WAV header: {}", e)))?;

    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(VoiceError::format(format!(
            "Unsupported WAV format: {:?} {}-bit, expected 16-bit PCM",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    if spec.channels != 1 {
        return Err(VoiceError::format(format!(
            "Unsupported WAV channel count: {}, expected mono",
            spec.channels
        )));
    }

    let declared = reader.len() as usize;
    let samples = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| VoiceError::format(format!("Truncated WAV data: {}", e)))?;

    if samples.len() != declared {
        return Err(VoiceError::format(format!(
            "WAV data chunk declares {} samples, found {}",
            declared,
            samples.len()
        )));
    }

    Ok(AudioFrame { samples })
}

/// Encode a frame as base64 text of its little-endian bytes.
pub fn to_transport_bytes(frame: &AudioFrame) -> Result<String> {
    let mut encoder = EncoderStringWriter::new(&BASE64_STANDARD);
    let mut bytes = Vec::with_capacity(TRANSPORT_CHUNK_SAMPLES.min(frame.len()) * 2);

    for chunk in frame.samples().chunks(TRANSPORT_CHUNK_SAMPLES) {
        bytes.clear();
        for sample in chunk {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        encoder.write_all(&bytes)?;
    }

    Ok(encoder.into_inner())
}

/// Decode base64 text produced by [`to_transport_bytes`] (or the remote peer).
pub fn from_transport_bytes(text: &str) -> Result<AudioFrame> {
    let bytes = BASE64_STANDARD
        .decode(text)
        .map_err(|e| VoiceError::format(format!("Invalid base64 audio: {}", e)))?;

    if bytes.is_empty() {
        return Err(VoiceError::format("Empty audio payload"));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::format(format!(
            "Audio payload has odd byte length {}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok(AudioFrame { samples })
}
