//! Audio I/O: capture strategies, echo cancellation, VAD, playback.

pub mod aec;
pub mod capture;
pub mod player;
pub mod vad;

pub use aec::{AecProcessor, ReferenceBuffer, ReferenceHandle};
pub use capture::AudioCapture;
pub use player::{AudioPlayer, CpalPlayer};
pub use vad::EnergyVad;
