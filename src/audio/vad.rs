//! Energy-based voice activity detection.
//!
//! Scores 512-sample windows into a [0, 1) speech score and reports a
//! frame as voice-active when any window crosses the configured
//! threshold. Used by the monitor when capture runs without the
//! echo-canceller (which otherwise supplies the flag itself).

/// Window-scored energy VAD.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Speech score threshold in [0, 1).
    threshold: f32,
    /// Window size in samples.
    window: usize,
    /// RMS level at which the score reaches 0.5. Room noise sits well
    /// below this; even quiet speech sits above.
    noise_floor: f32,
}

impl EnergyVad {
    /// Create a detector with the given threshold and window size.
    pub fn new(threshold: f32, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(1),
            noise_floor: 0.005,
        }
    }

    /// Whether any window of `samples` scores at or above the threshold.
    pub fn is_voice_active(&self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let mut idx = 0;
        while idx < samples.len() {
            let end = (idx + self.window).min(samples.len());
            // Short trailing windows borrow their tail from the end of the
            // frame so the score stays comparable.
            let window = if end - idx < self.window && samples.len() >= self.window {
                &samples[samples.len() - self.window..]
            } else {
                &samples[idx..end]
            };
            if self.score(window) >= self.threshold {
                return true;
            }
            idx += self.window;
        }
        false
    }

    /// Speech score for one window: RMS squashed into [0, 1).
    fn score(&self, window: &[f32]) -> f32 {
        let rms = rms(window);
        rms / (rms + self.noise_floor)
    }
}

/// Root-mean-square of a sample slice.
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vad() -> EnergyVad {
        EnergyVad::new(0.7, 512)
    }

    #[test]
    fn silence_is_inactive() {
        assert!(!vad().is_voice_active(&vec![0.0; 512]));
    }

    #[test]
    fn speech_level_audio_is_active() {
        // ±0.1 square wave: RMS 0.1, score ≈ 0.95.
        let samples: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        assert!(vad().is_voice_active(&samples));
    }

    #[test]
    fn faint_noise_is_inactive() {
        // RMS 0.002 sits below the noise floor: score ≈ 0.29.
        let samples: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { 0.002 } else { -0.002 })
            .collect();
        assert!(!vad().is_voice_active(&samples));
    }

    #[test]
    fn single_loud_window_flags_the_frame() {
        let mut samples = vec![0.0f32; 1536];
        for (i, s) in samples[512..1024].iter_mut().enumerate() {
            *s = if i % 2 == 0 { 0.2 } else { -0.2 };
        }
        assert!(vad().is_voice_active(&samples));
    }

    #[test]
    fn empty_frame_is_inactive() {
        assert!(!vad().is_voice_active(&[]));
    }
}
