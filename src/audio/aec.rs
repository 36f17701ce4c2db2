//! Acoustic echo cancellation using FDAF adaptive filtering.
//!
//! Removes speaker output (echo) from the microphone signal so barge-in
//! detection sees only the user's voice. The playback stage pushes every
//! clip it plays into a shared [`ReferenceBuffer`]; the echo-cancelled
//! capture strategy drains matching frames and subtracts them.

use crate::config::AecConfig;
use crate::error::{DialogueError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Seconds of reference audio retained at the capture rate.
const REFERENCE_SECONDS: usize = 2;

/// Shared ring buffer holding resampled reference audio from playback.
///
/// Clones share the underlying ring.
#[derive(Clone)]
pub struct ReferenceBuffer {
    inner: Arc<Mutex<VecDeque<f32>>>,
    capture_rate: u32,
}

impl ReferenceBuffer {
    /// Create a buffer draining at `capture_rate` (the microphone rate).
    pub fn new(capture_rate: u32) -> Self {
        let capacity = capture_rate as usize * REFERENCE_SECONDS;
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capture_rate,
        }
    }

    /// Clone a push handle for the playback stage.
    pub fn handle(&self) -> ReferenceHandle {
        ReferenceHandle {
            inner: Arc::clone(&self.inner),
            capture_rate: self.capture_rate,
        }
    }

    /// Drain exactly `n` samples, zero-filling when underrun.
    pub fn drain_frame(&self, n: usize) -> Vec<f32> {
        let Ok(mut buf) = self.inner.lock() else {
            return vec![0.0; n];
        };
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(buf.pop_front().unwrap_or(0.0));
        }
        out
    }
}

/// Clonable push handle used by the playback stage.
#[derive(Clone)]
pub struct ReferenceHandle {
    inner: Arc<Mutex<VecDeque<f32>>>,
    capture_rate: u32,
}

impl ReferenceHandle {
    /// Push playback samples, resampling from `sample_rate` to the
    /// capture rate and capping the buffer at its capacity.
    pub fn push(&self, samples: &[f32], sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        let resampled = if sample_rate != self.capture_rate {
            resample_linear(samples, sample_rate, self.capture_rate)
        } else {
            samples.to_vec()
        };
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        let cap = self.capture_rate as usize * REFERENCE_SECONDS;
        let data = if resampled.len() > cap {
            &resampled[resampled.len() - cap..]
        } else {
            &resampled[..]
        };
        let overflow = (buf.len() + data.len()).saturating_sub(cap);
        for _ in 0..overflow {
            buf.pop_front();
        }
        buf.extend(data.iter());
    }

    /// Drop all buffered reference audio (e.g. when playback is cut).
    pub fn clear(&self) {
        if let Ok(mut buf) = self.inner.lock() {
            buf.clear();
        }
    }
}

/// Frame-by-frame echo canceller wrapping [`fdaf_aec::FdafAec`].
pub struct AecProcessor {
    filter: fdaf_aec::FdafAec,
    reference: ReferenceBuffer,
    frame_size: usize,
}

impl AecProcessor {
    /// Create a processor draining reference audio from `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if `fft_size` is not a non-zero power of two.
    pub fn new(config: &AecConfig, reference: ReferenceBuffer) -> Result<Self> {
        if config.fft_size == 0 || !config.fft_size.is_power_of_two() {
            return Err(DialogueError::Device(format!(
                "AEC fft_size must be a non-zero power of two, got {}",
                config.fft_size
            )));
        }
        Ok(Self {
            filter: fdaf_aec::FdafAec::new(config.fft_size, config.step_size),
            reference,
            frame_size: config.fft_size / 2,
        })
    }

    /// Subtract the echo estimate from one microphone chunk.
    ///
    /// Sub-frame remainders pass through unprocessed.
    pub fn process(&mut self, mic: &[f32]) -> Vec<f32> {
        if mic.is_empty() {
            return Vec::new();
        }
        let mut output = Vec::with_capacity(mic.len());
        let mut offset = 0;
        while offset + self.frame_size <= mic.len() {
            let mic_frame = &mic[offset..offset + self.frame_size];
            let ref_frame = self.reference.drain_frame(self.frame_size);
            let cleaned = self.filter.process(&ref_frame, mic_frame);
            output.extend_from_slice(&cleaned);
            offset += self.frame_size;
        }
        if offset < mic.len() {
            output.extend_from_slice(&mic[offset..]);
        }
        output
    }
}

/// Linear-interpolation resampler; speech energy sits below 8kHz so no
/// anti-alias filter is needed for the rates involved here.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_drains_in_order_and_zero_fills() {
        let buf = ReferenceBuffer::new(16_000);
        buf.handle().push(&[1.0, 2.0, 3.0], 16_000);
        assert_eq!(buf.drain_frame(2), vec![1.0, 2.0]);
        assert_eq!(buf.drain_frame(2), vec![3.0, 0.0]);
    }

    #[test]
    fn reference_resamples_higher_rate_input() {
        let buf = ReferenceBuffer::new(16_000);
        // 24kHz input shrinks by 2/3.
        buf.handle().push(&vec![0.5; 24_000], 24_000);
        let frame = buf.drain_frame(16_000);
        assert!(frame[..15_000].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn reference_capacity_is_bounded() {
        let buf = ReferenceBuffer::new(1_000);
        let handle = buf.handle();
        handle.push(&vec![1.0; 5_000], 1_000);
        // Capacity is 2s = 2000 samples; older audio was discarded.
        let Ok(inner) = buf.inner.lock() else {
            panic!("lock")
        };
        assert_eq!(inner.len(), 2_000);
    }

    #[test]
    fn clear_empties_buffer() {
        let buf = ReferenceBuffer::new(16_000);
        let handle = buf.handle();
        handle.push(&[1.0; 100], 16_000);
        handle.clear();
        assert_eq!(buf.drain_frame(4), vec![0.0; 4]);
    }

    #[test]
    fn processor_rejects_bad_fft_size() {
        let config = AecConfig {
            enabled: true,
            fft_size: 1000,
            step_size: 0.05,
        };
        assert!(AecProcessor::new(&config, ReferenceBuffer::new(16_000)).is_err());
    }

    #[test]
    fn processor_preserves_chunk_length() {
        let config = AecConfig::default();
        let mut processor =
            AecProcessor::new(&config, ReferenceBuffer::new(16_000)).expect("processor");
        let out = processor.process(&vec![0.1; 1_300]);
        assert_eq!(out.len(), 1_300);
    }
}
