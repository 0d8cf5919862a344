//! Gapless playback scheduling.
//!
//! The scheduler keeps a "next play time" cursor on the output clock. Each
//! unit starts at `max(now, cursor)` and pushes the cursor forward by its own
//! duration, so consecutive units abut regardless of when their deltas
//! arrived.

use super::output::AudioOutput;
use super::{AudioFrame, SAMPLE_RATE};
use crate::error::{Result, VoiceError};

pub type OutputFactory = Box<dyn FnMut() -> Result<Box<dyn AudioOutput>> + Send>;

/// A frame prepared for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    samples: Vec<i16>,
    duration: f64,
}

impl PlaybackUnit {
    pub fn from_frame(frame: &AudioFrame) -> Result<Self> {
        if frame.is_empty() {
            return Err(VoiceError::format("Cannot play an empty audio frame"));
        }
        Ok(Self {
            samples: frame.samples().to_vec(),
            duration: frame.len() as f64 / SAMPLE_RATE as f64,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }
}

/// Where a unit landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub start: f64,
    pub duration: f64,
}

impl ScheduledUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    factory: OutputFactory,
    output: Option<Box<dyn AudioOutput>>,
    next_play_time: Option<f64>,
}

impl PlaybackScheduler {
    /// The output is opened through `factory` on first use, not here.
    pub fn new(factory: OutputFactory) -> Self {
        Self {
            factory,
            output: None,
            next_play_time: None,
        }
    }

    fn output(&mut self) -> Result<&mut Box<dyn AudioOutput>> {
        if self.output.is_none() {
            let output = (self.factory)()?;
            log::info!("Audio output opened");
            self.output = Some(output);
        }
        self.output
            .as_mut()
            .ok_or_else(|| VoiceError::device("Audio output unavailable"))
    }

    /// Schedule `frame` right after everything already queued.
    ///
    /// A frame that fails to convert leaves the cursor untouched. A frame the
    /// output rejects still advances it, keeping later frames on time.
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<ScheduledUnit> {
        let unit = PlaybackUnit::from_frame(frame)?;
        let cursor = self.next_play_time;
        let output = self.output()?;

        let now = output.current_time();
        let start = match cursor {
            Some(cursor) => cursor.max(now),
            None => now,
        };
        let scheduled = ScheduledUnit {
            start,
            duration: unit.duration(),
        };

        let result = output.schedule(unit, start);
        self.next_play_time = Some(scheduled.end());
        result.map(|_| scheduled)
    }

    /// Forget the cursor; the next unit starts at the output's current time.
    pub fn reset(&mut self) {
        self.next_play_time = None;
    }

    pub fn next_play_time(&self) -> Option<f64> {
        self.next_play_time
    }

    /// Release the output device. It is reopened lazily on the next enqueue.
    pub fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.close();
            log::info!("Audio output closed");
        }
        self.next_play_time = None;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
