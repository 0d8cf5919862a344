//! Audio output contexts: a clock plus somewhere to put scheduled audio.

use tokio::time::Instant;

use super::playback::PlaybackUnit;
use crate::error::Result;

/// An output clock that accepts units scheduled at absolute times on it.
pub trait AudioOutput: Send {
    /// Seconds elapsed on this output's clock.
    fn current_time(&self) -> f64;

    /// Queue `unit` to start playing at `start_at` (output-clock seconds).
    fn schedule(&mut self, unit: PlaybackUnit, start_at: f64) -> Result<()>;

    /// Release the device. Further scheduling is an error.
    fn close(&mut self) {}
}

/// Wall-clock output that discards audio. Used on builds without a sound
/// card; the scheduling timeline is still logged.
pub struct ClockOutput {
    origin: Instant,
}

impl ClockOutput {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for ClockOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for ClockOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, unit: PlaybackUnit, start_at: f64) -> Result<()> {
        log::debug!(
            "Scheduled {:.3}s of audio at t={:.3}",
            unit.duration(),
            start_at
        );
        Ok(())
    }
}

#[cfg(feature = "device")]
pub use alsa_output::AlsaOutput;

#[cfg(feature = "device")]
mod alsa_output {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;

    use alsa::pcm::PCM;
    use tokio::sync::mpsc;

    use super::*;
    use crate::audio::speex::Resampler;
    use crate::audio::{SAMPLE_RATE, alsa_device};
    use crate::error::VoiceError;

    const PLAYBACK_PERIOD: usize = 1024;

    type UnitRx = mpsc::UnboundedReceiver<(PlaybackUnit, f64)>;

    /// ALSA playback driven by a dedicated writer thread.
    ///
    /// The writer keeps its own position on the output clock and pads with
    /// silence up to each unit's start time, so units scheduled back to back
    /// are written back to back.
    pub struct AlsaOutput {
        origin: Instant,
        running: Arc<AtomicBool>,
        tx: Option<mpsc::UnboundedSender<(PlaybackUnit, f64)>>,
        worker: Option<JoinHandle<()>>,
    }

    impl AlsaOutput {
        /// Open and configure `device`, then hand it to a fresh writer thread.
        pub fn open(device: &str) -> Result<Self> {
            let (pcm, params) = alsa_device::open_playback(device, SAMPLE_RATE, PLAYBACK_PERIOD)
                .map_err(|e| VoiceError::device(format!("{:#}", e)))?;
            pcm.prepare()
                .map_err(|e| VoiceError::device(format!("Failed to prepare playback: {}", e)))?;
            let writer = UnitWriter::new(params.sample_rate, params.period_size)
                .map_err(|e| VoiceError::device(format!("{:#}", e)))?;

            let origin = Instant::now();
            let running = Arc::new(AtomicBool::new(true));
            let (tx, rx) = mpsc::unbounded_channel();

            let running_clone = running.clone();
            let worker = std::thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || play_thread(pcm, writer, rx, running_clone, origin))
                .map_err(|e| VoiceError::device(format!("Failed to spawn playback thread: {}", e)))?;

            Ok(Self {
                origin,
                running,
                tx: Some(tx),
                worker: Some(worker),
            })
        }
    }

    impl AudioOutput for AlsaOutput {
        fn current_time(&self) -> f64 {
            self.origin.elapsed().as_secs_f64()
        }

        fn schedule(&mut self, unit: PlaybackUnit, start_at: f64) -> Result<()> {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| VoiceError::device("Playback device closed"))?;
            tx.send((unit, start_at))
                .map_err(|_| VoiceError::device("Playback thread exited"))
        }

        /// Stop immediately: queued units are discarded and the device is
        /// dropped rather than drained. Never blocks an async caller.
        fn close(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            self.tx.take();
            let Some(handle) = self.worker.take() else {
                return;
            };
            let join = move || {
                let _ = handle.join();
                log::info!("Playback device released");
            };
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn_blocking(join);
                }
                Err(_) => join(),
            }
        }
    }

    impl Drop for AlsaOutput {
        fn drop(&mut self) {
            self.close();
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum WriterExit {
        /// Sender dropped and every queued unit was written.
        Closed,
        /// Stop flag cleared; the rest of the queue was abandoned.
        Stopped,
    }

    /// Turns scheduled units into a continuous sample stream at the device
    /// rate. Writes in `chunk`-sized pieces so a stop lands within one period.
    struct UnitWriter {
        device_rate: u32,
        chunk: usize,
        resampler: Option<Resampler>,
        // output-clock time at which the device queue runs dry
        written_until: f64,
    }

    impl UnitWriter {
        fn new(device_rate: u32, chunk: usize) -> anyhow::Result<Self> {
            let resampler = if device_rate != SAMPLE_RATE {
                Some(Resampler::new(SAMPLE_RATE, device_rate)?)
            } else {
                None
            };
            Ok(Self {
                device_rate,
                chunk: chunk.max(1),
                resampler,
                written_until: 0.0,
            })
        }

        fn run(
            &mut self,
            rx: &mut UnitRx,
            running: &AtomicBool,
            now: impl Fn() -> f64,
            mut write: impl FnMut(&[i16]),
        ) -> WriterExit {
            while let Some((unit, start_at)) = rx.blocking_recv() {
                if !running.load(Ordering::SeqCst) {
                    return WriterExit::Stopped;
                }

                let now = now();
                if self.written_until < now {
                    self.written_until = now;
                }

                let gap = start_at - self.written_until;
                if gap > 0.0 {
                    let silence = vec![0i16; (gap * self.device_rate as f64).round() as usize];
                    if !write_chunks(&silence, self.chunk, running, &mut write) {
                        return WriterExit::Stopped;
                    }
                    self.written_until = start_at;
                }

                let resampled;
                let samples = match self.resampler.as_mut() {
                    Some(resampler) => match resampler.process(unit.samples()) {
                        Ok(out) => {
                            resampled = out;
                            &resampled[..]
                        }
                        Err(e) => {
                            log::error!("Dropping playback unit: {:#}", e);
                            continue;
                        }
                    },
                    None => unit.samples(),
                };
                if !write_chunks(samples, self.chunk, running, &mut write) {
                    return WriterExit::Stopped;
                }
                self.written_until += unit.duration();
            }

            if running.load(Ordering::SeqCst) {
                WriterExit::Closed
            } else {
                WriterExit::Stopped
            }
        }
    }

    /// Returns false if the stop flag was cleared before all of `data` went out.
    fn write_chunks(
        data: &[i16],
        chunk: usize,
        running: &AtomicBool,
        write: &mut impl FnMut(&[i16]),
    ) -> bool {
        for piece in data.chunks(chunk) {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            write(piece);
        }
        true
    }

    fn play_thread(
        pcm: PCM,
        mut writer: UnitWriter,
        mut rx: UnitRx,
        running: Arc<AtomicBool>,
        origin: Instant,
    ) {
        let io = match pcm.io_i16() {
            Ok(io) => io,
            Err(e) => {
                log::error!("Playback I/O unavailable: {}", e);
                return;
            }
        };

        let exit = writer.run(
            &mut rx,
            &running,
            || origin.elapsed().as_secs_f64(),
            |data| write_all(&pcm, &io, data),
        );
        match exit {
            WriterExit::Stopped => {
                let _ = PCM::drop(&pcm);
            }
            WriterExit::Closed => {
                let _ = pcm.drain();
            }
        }
        log::info!("Playback thread exiting ({:?})", exit);
    }

    /// Write with retry to ride out short writes and XRUNs.
    fn write_all(pcm: &PCM, io: &alsa::pcm::IO<i16>, data: &[i16]) {
        let total = data.len();
        let mut written = 0;
        let mut retry_count = 0u32;

        while written < total {
            match io.writei(&data[written..]) {
                Ok(n) => {
                    written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total - written
                        );
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::audio::AudioFrame;
        use std::cell::Cell;

        fn unit(len: usize, value: i16) -> PlaybackUnit {
            PlaybackUnit::from_frame(&AudioFrame::new(vec![value; len])).unwrap()
        }

        #[test]
        fn stop_flag_abandons_the_queue_mid_unit() {
            let mut writer = UnitWriter::new(SAMPLE_RATE, 100).unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            tx.send((unit(1000, 500), 0.0)).unwrap();
            tx.send((unit(1000, 500), 0.05)).unwrap();

            let running = AtomicBool::new(true);
            let chunks = Cell::new(0);
            let exit = writer.run(&mut rx, &running, || 0.0, |_| {
                chunks.set(chunks.get() + 1);
                if chunks.get() == 3 {
                    running.store(false, Ordering::SeqCst);
                }
            });

            assert_eq!(exit, WriterExit::Stopped);
            assert_eq!(chunks.get(), 3);
            // the sender is still alive; the writer did not wait on it
            drop(tx);
        }

        #[test]
        fn stopped_before_dequeue_writes_nothing() {
            let mut writer = UnitWriter::new(SAMPLE_RATE, 100).unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            tx.send((unit(2400, 500), 0.0)).unwrap();
            drop(tx);

            let running = AtomicBool::new(false);
            let mut written = 0usize;
            let exit = writer.run(&mut rx, &running, || 0.0, |data| written += data.len());
            assert_eq!(exit, WriterExit::Stopped);
            assert_eq!(written, 0);
        }

        #[test]
        fn closed_sender_flushes_units_with_silence_gap() {
            let mut writer = UnitWriter::new(SAMPLE_RATE, PLAYBACK_PERIOD).unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            // 0.1s unit, then another starting 0.1s after it ends
            tx.send((unit(2400, 700), 0.0)).unwrap();
            tx.send((unit(2400, 700), 0.2)).unwrap();
            drop(tx);

            let running = AtomicBool::new(true);
            let mut out = Vec::new();
            let exit = writer.run(&mut rx, &running, || 0.0, |data| out.extend_from_slice(data));

            assert_eq!(exit, WriterExit::Closed);
            assert_eq!(out.len(), 7200);
            assert!(out[..2400].iter().all(|&s| s == 700));
            assert!(out[2400..4800].iter().all(|&s| s == 0));
            assert!(out[4800..].iter().all(|&s| s == 700));
            assert!((writer.written_until - 0.3).abs() < 1e-9);
        }

        #[test]
        fn units_start_no_earlier_than_now() {
            let mut writer = UnitWriter::new(SAMPLE_RATE, PLAYBACK_PERIOD).unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            // scheduled in the past: written immediately, no silence
            tx.send((unit(240, 700), 0.5)).unwrap();
            drop(tx);

            let running = AtomicBool::new(true);
            let mut out = Vec::new();
            writer.run(&mut rx, &running, || 1.0, |data| out.extend_from_slice(data));
            assert_eq!(out.len(), 240);
            assert!((writer.written_until - 1.01).abs() < 1e-9);
        }
    }
}
