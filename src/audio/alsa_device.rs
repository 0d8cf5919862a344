//! ALSA PCM device wrappers for audio capture and playback.
//!
//! Devices are opened mono and asked for the stream rate. The hardware may
//! settle on another rate; callers resample using the negotiated value.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, period_size: usize) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, period_size, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(device: &str, sample_rate: u32, period_size: usize) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, period_size, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    period_size: usize,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        log::warn!(
            "ALSA {}: device '{}' runs at {} Hz instead of {} Hz, resampling",
            dir_name,
            device,
            params.sample_rate,
            sample_rate
        );
    }
    log::info!(
        "ALSA {}: device={}, rate={}, channels=1, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
    );

    Ok((pcm, params))
}
