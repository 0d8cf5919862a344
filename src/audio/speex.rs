//! Safe wrappers around SpeexDSP's preprocessor (denoise/AGC) and resampler,
//! used when talking to ALSA devices.

use std::ffi::{c_int, c_void};

// ======================== FFI declarations ========================

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

// Resampler constants
const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
}

/// Noise suppression + AGC over fixed-size mono frames.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used from the capture thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state, frame_size })
    }

    /// Voice-capture defaults: denoise at -25 dB with AGC enabled.
    pub fn for_voice(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let mut pp = Self::new(frame_size, sample_rate)?;
        pp.set_int(SPEEX_PREPROCESS_SET_DENOISE, 1);
        pp.set_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, -25);
        pp.set_int(SPEEX_PREPROCESS_SET_AGC, 1);
        pp.set_agc_level(24000.0);
        Ok(pp)
    }

    fn set_int(&mut self, request: c_int, value: c_int) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }

    fn set_agc_level(&mut self, level: f32) {
        let mut val: f32 = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_AGC_LEVEL,
                &mut val as *mut f32 as *mut c_void,
            );
        }
    }

    /// Run the preprocessor in place. Short frames (device tail) are skipped
    /// since speex reads exactly `frame_size` samples.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.len() != self.frame_size {
            return;
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Resampler ========================

/// Mono 16-bit resampler between the device rate and the stream rate.
pub struct Resampler {
    state: *mut SpeexResamplerState,
    in_rate: u32,
    out_rate: u32,
}

unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(1, in_rate, out_rate, SPEEX_RESAMPLER_QUALITY_DEFAULT, &mut err)
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self {
            state,
            in_rate,
            out_rate,
        })
    }

    /// Resample a block of samples, consuming all of `input`.
    pub fn process(&mut self, input: &[i16]) -> anyhow::Result<Vec<i16>> {
        let capacity = input.len() * self.out_rate as usize / self.in_rate as usize + 64;
        let mut output = vec![0i16; capacity];
        let mut consumed = 0usize;
        let mut produced = 0usize;

        while consumed < input.len() {
            let mut in_len = (input.len() - consumed) as u32;
            let mut out_len = (output.len() - produced) as u32;
            let err = unsafe {
                speex_resampler_process_int(
                    self.state,
                    0,
                    input[consumed..].as_ptr(),
                    &mut in_len,
                    output[produced..].as_mut_ptr(),
                    &mut out_len,
                )
            };
            if err != RESAMPLER_ERR_SUCCESS {
                anyhow::bail!("Speex resampler error: {}", err);
            }
            consumed += in_len as usize;
            produced += out_len as usize;
            if in_len == 0 || produced == output.len() {
                output.resize(output.len() * 2, 0);
            }
        }

        output.truncate(produced);
        Ok(output)
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
