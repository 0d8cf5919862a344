//! Microphone sources feeding the capture pipeline.
//!
//! A source yields mono float samples at [`SAMPLE_RATE`]. `AlsaSource` reads
//! the sound card; `WavFileSource` replays a file and stands in for the
//! microphone on builds without the `device` feature.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::audio::SAMPLE_RATE;
use crate::error::{Result, VoiceError};

/// Trait for audio source devices, so the pipeline can run against a real
/// microphone, a file or a test mock.
pub trait AudioSource: Send {
    /// Acquire the device. Fails with [`VoiceError::Device`] when the
    /// microphone is missing or access is denied.
    fn start(&mut self) -> Result<()>;

    /// Block for the next batch of samples in `[-1.0, 1.0]`.
    ///
    /// An empty batch means the source is exhausted.
    fn read_samples(&mut self) -> Result<Vec<f32>>;

    /// Release the device. Safe to call when not started.
    fn stop(&mut self);
}

// ======================== ALSA ========================

#[cfg(feature = "device")]
pub use alsa_source::AlsaSource;

#[cfg(feature = "device")]
mod alsa_source {
    use alsa::pcm::PCM;

    use super::*;
    use crate::audio::alsa_device;
    use crate::audio::speex::{Preprocessor, Resampler};

    // 20ms @ 24kHz
    const CAPTURE_PERIOD: usize = 480;

    /// Live microphone via ALSA, with SpeexDSP denoise and AGC applied per
    /// period. Periods are resampled to [`SAMPLE_RATE`] when the card
    /// negotiated another rate.
    pub struct AlsaSource {
        device: String,
        pcm: Option<PCM>,
        preprocessor: Option<Preprocessor>,
        resampler: Option<Resampler>,
        read_buf: Vec<i16>,
    }

    impl AlsaSource {
        pub fn new(device: impl Into<String>) -> Self {
            Self {
                device: device.into(),
                pcm: None,
                preprocessor: None,
                resampler: None,
                read_buf: Vec::new(),
            }
        }
    }

    impl AudioSource for AlsaSource {
        fn start(&mut self) -> Result<()> {
            let (pcm, params) = alsa_device::open_capture(&self.device, SAMPLE_RATE, CAPTURE_PERIOD)
                .map_err(|e| VoiceError::device(format!("{:#}", e)))?;
            let period = params.period_size;

            self.resampler = if params.sample_rate != SAMPLE_RATE {
                let resampler = Resampler::new(params.sample_rate, SAMPLE_RATE)
                    .map_err(|e| VoiceError::device(format!("{:#}", e)))?;
                Some(resampler)
            } else {
                None
            };
            self.preprocessor = match Preprocessor::for_voice(period, params.sample_rate) {
                Ok(pp) => Some(pp),
                Err(e) => {
                    log::warn!("Speex preprocessor unavailable, capturing raw audio: {}", e);
                    None
                }
            };
            self.read_buf = vec![0i16; period];
            pcm.prepare()
                .map_err(|e| VoiceError::device(format!("Failed to prepare capture: {}", e)))?;
            self.pcm = Some(pcm);
            Ok(())
        }

        fn read_samples(&mut self) -> Result<Vec<f32>> {
            let Some(pcm) = self.pcm.as_ref() else {
                return Err(VoiceError::device("Capture device not started"));
            };
            let io = pcm
                .io_i16()
                .map_err(|e| VoiceError::device(format!("Capture I/O unavailable: {}", e)))?;

            let mut retries = 0u32;
            let frames = loop {
                match io.readi(&mut self.read_buf) {
                    Ok(frames) => break frames,
                    Err(e) => {
                        log::warn!("ALSA capture error: {}, recovering...", e);
                        retries += 1;
                        if retries >= 3 {
                            return Err(VoiceError::device(format!(
                                "Capture keeps failing after {} recoveries: {}",
                                retries, e
                            )));
                        }
                        pcm.prepare().map_err(|e2| {
                            VoiceError::device(format!("Failed to recover PCM capture: {}", e2))
                        })?;
                    }
                }
            };

            let period = &mut self.read_buf[..frames];
            if let Some(pp) = self.preprocessor.as_mut() {
                pp.process(period);
            }
            let to_float = |s: &i16| *s as f32 / 32768.0;
            match self.resampler.as_mut() {
                Some(resampler) => {
                    let resampled = resampler
                        .process(period)
                        .map_err(|e| VoiceError::device(format!("{:#}", e)))?;
                    Ok(resampled.iter().map(to_float).collect())
                }
                None => Ok(period.iter().map(to_float).collect()),
            }
        }

        fn stop(&mut self) {
            if let Some(pcm) = self.pcm.take() {
                let _ = PCM::drop(&pcm);
                log::info!("Capture device '{}' released", self.device);
            }
            self.preprocessor = None;
            self.resampler = None;
        }
    }
}

// ======================== WAV file ========================

/// Replays a 16-bit PCM WAV file as if it were a microphone.
///
/// The file must already be mono at the stream rate. When `paced` is set the
/// source sleeps for each batch's duration so wall-clock recording time
/// matches the audio.
pub struct WavFileSource {
    samples: Vec<i16>,
    position: usize,
    chunk_size: usize,
    paced: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            VoiceError::device(format!("Cannot open input '{}': {}", path.display(), e))
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let reader = hound::WavReader::new(reader)
            .map_err(|e| VoiceError::device(format!("Failed to parse WAV input: {}", e)))?;

        let spec = reader.spec();
        if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
            return Err(VoiceError::device(format!(
                "WAV input must be 16-bit mono {} Hz, got {}-bit {}ch {} Hz",
                SAMPLE_RATE, spec.bits_per_sample, spec.channels, spec.sample_rate
            )));
        }

        let samples = reader
            .into_samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoiceError::device(format!("Failed to read WAV samples: {}", e)))?;

        Ok(Self {
            samples,
            position: 0,
            // 100ms batches
            chunk_size: (SAMPLE_RATE / 10) as usize,
            paced: true,
        })
    }

    /// Deliver batches as fast as they are read.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl AudioSource for WavFileSource {
    fn start(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<f32>> {
        if self.position >= self.samples.len() {
            return Ok(Vec::new());
        }

        let end = std::cmp::min(self.position + self.chunk_size, self.samples.len());
        let batch: Vec<f32> = self.samples[self.position..end]
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect();
        self.position = end;

        if self.paced {
            std::thread::sleep(Duration::from_secs_f64(
                batch.len() as f64 / SAMPLE_RATE as f64,
            ));
        }
        Ok(batch)
    }

    fn stop(&mut self) {}
}
