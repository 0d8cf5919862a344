//! Opus encoder/decoder for the compressed recording path.
//!
//! Both ends run at the stream rate, mono, so no resampling or channel
//! conversion is needed here.

use anyhow::Result;

use super::{OPUS_FRAME_MS, SAMPLE_RATE};

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    frame_samples: usize,
}

impl OpusEncoder {
    /// Create a mono encoder at the stream rate.
    ///
    /// * `bitrate` - Bitrate in bits/s (e.g. 32000)
    pub fn new(bitrate: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;

        Ok(Self {
            encoder,
            frame_samples: (SAMPLE_RATE * OPUS_FRAME_MS / 1000) as usize,
        })
    }

    /// Number of PCM samples consumed by one `encode` call.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Encoder delay in samples. Decoded audio lags the input by this much.
    pub fn lookahead(&mut self) -> Result<usize> {
        Ok(self.encoder.get_lookahead()?.max(0) as usize)
    }

    /// Encode exactly one frame of PCM to an Opus packet.
    ///
    /// Input length must equal `frame_samples()`.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != self.frame_samples {
            anyhow::bail!(
                "Opus frame must be {} samples, got {}",
                self.frame_samples,
                pcm.len()
            );
        }
        let mut opus_buf = vec![0u8; 4000];
        let encoded_len = self.encoder.encode(pcm, &mut opus_buf)?;
        opus_buf.truncate(encoded_len);
        Ok(opus_buf)
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?;
        Ok(Self { decoder })
    }

    /// Decode one Opus packet to PCM.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        // max 120ms @ 24kHz = 2880 samples
        let mut pcm_buf = vec![0i16; 2880];
        let decoded = self.decoder.decode(opus_data, &mut pcm_buf, false)?;
        pcm_buf.truncate(decoded);
        Ok(pcm_buf)
    }
}
