//! Speech-activity monitor: segments the frame stream into utterance
//! tasks and detects the user talking over the assistant.
//!
//! The monitor is the sole writer of the interrupt marker and the
//! *user-still-speaking* event. Its silence/active counters deliberately
//! survive across utterance cycles: the *silence-over-threshold* event is
//! re-derived from the counter on every pass, so the playback gate
//! re-opens right after each per-sentence task reset instead of waiting
//! out a fresh silence window.

use crate::audio::EnergyVad;
use crate::config::{Language, MonitorConfig};
use crate::pipeline::messages::{Frame, VoiceTask};
use crate::state::events::{Event, PipelineSignals};
use crate::state::{AudioTaskState, StateRegistry};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pipeline sample rate the monitor operates at.
const SAMPLE_RATE: u32 = 16_000;

/// Per-utterance segmentation state machine.
pub struct SpeechMonitor {
    config: MonitorConfig,
    language: Language,
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    vad: EnergyVad,

    /// Persistent counters, zeroed only by the opposite frame kind.
    active_ms: f32,
    silence_ms: f32,

    /// Per-cycle state.
    task_id: String,
    buffer: Vec<f32>,
    buffer_empty: bool,
    audio_sent: bool,
}

impl SpeechMonitor {
    /// Create a monitor bound to the shared registry and signals.
    pub fn new(
        config: MonitorConfig,
        language: Language,
        registry: Arc<StateRegistry>,
        signals: Arc<PipelineSignals>,
    ) -> Self {
        let vad = EnergyVad::new(config.vad_threshold, config.vad_window);
        Self {
            config,
            language,
            registry,
            signals,
            vad,
            active_ms: 0.0,
            silence_ms: 0.0,
            task_id: String::new(),
            buffer: Vec::new(),
            buffer_empty: true,
            audio_sent: false,
        }
    }

    /// Process one frame; returns an utterance task when one is ready to
    /// dispatch.
    pub fn handle_frame(&mut self, frame: &Frame) -> Option<VoiceTask> {
        self.begin_cycle();

        // Clear the drop marker left by a preempted dispatch so the next
        // fragment of this utterance can go out.
        if self.registry.audio_task_state(&self.task_id) == Some(AudioTaskState::Drop) {
            self.registry.cleanup_task_state(&self.task_id);
            self.audio_sent = false;
            return None;
        }

        if self.silence_ms >= self.config.user_silence_threshold_ms as f32 {
            self.signals.silence_over_threshold.set();
        }

        let samples = normalize_frame(&frame.pcm);
        let voice_active = frame
            .voice_active
            .unwrap_or_else(|| self.vad.is_voice_active(&samples));
        let frame_ms = duration_ms(samples.len());

        if voice_active {
            if peak_amplitude(&samples) > self.config.min_amplitude {
                self.silence_ms = 0.0;
                self.active_ms += frame_ms;
                if self.active_ms > self.config.active_frame_threshold_ms as f32 {
                    self.registry.set_interrupt_task_id(&self.task_id);
                }
                self.buffer_empty = false;
                self.buffer.extend_from_slice(&samples);

                // Forced flush: a continuous utterance is cut at the
                // long-utterance boundary and continues as a new fragment
                // under the same task id.
                if !self.audio_sent
                    && duration_ms(self.buffer.len())
                        >= self.config.long_utterance_threshold_ms as f32
                {
                    return Some(self.dispatch(true));
                }
            }
        } else {
            self.active_ms = 0.0;
            if self.buffer_empty {
                // Keep a rolling tail of silence so the utterance start is
                // not clipped.
                self.buffer.extend_from_slice(&samples);
                let max_tail =
                    (self.config.silence_tail_ms as usize * SAMPLE_RATE as usize) / 1000;
                if self.buffer.len() > max_tail {
                    let cut = self.buffer.len() - max_tail;
                    self.buffer.drain(..cut);
                }
                self.signals.user_still_speaking.clear();
                if self.audio_sent {
                    self.silence_ms += frame_ms;
                }
                return None;
            }
            self.silence_ms += frame_ms;
            self.buffer.extend_from_slice(&samples);
        }

        if voice_active && self.audio_sent {
            self.signals.user_still_speaking.set();
        }

        if self.silence_ms >= self.config.user_silence_threshold_ms as f32 && !self.audio_sent {
            let over = duration_ms(self.buffer.len()) >= self.config.long_utterance_threshold_ms as f32;
            return Some(self.dispatch(over));
        }

        None
    }

    /// Start a fresh utterance cycle when no task id exists.
    fn begin_cycle(&mut self) {
        let current = self.registry.current_task_id();
        if current.is_empty() {
            self.task_id = self.registry.create_task_id();
            self.registry.reset_interrupt_task_id();
            self.signals.silence_over_threshold.clear();
            self.signals.user_still_speaking.clear();
            self.buffer.clear();
            self.buffer_empty = true;
            self.audio_sent = false;
            debug!("monitor: new utterance cycle, task <{}>", self.task_id);
        } else {
            self.task_id = current;
        }
    }

    /// Build and account for a dispatched utterance task.
    fn dispatch(&mut self, over_long_threshold: bool) -> VoiceTask {
        let mut task = VoiceTask::new(
            self.task_id.clone(),
            self.registry.current_session_id(),
            self.language,
        );
        task.answer_id = uuid::Uuid::new_v4().to_string();
        task.user_voice = self.buffer.clone();
        task.over_long_threshold = over_long_threshold;
        task.timings.sent_at = Some(Instant::now());

        self.audio_sent = true;
        self.signals.user_still_speaking.clear();
        if over_long_threshold {
            self.buffer.clear();
            self.buffer_empty = true;
        }

        info!(
            "monitor: dispatching utterance task <{}> ({:.1}s audio{})",
            task.id,
            task.user_voice.len() as f32 / SAMPLE_RATE as f32,
            if over_long_threshold { ", long" } else { "" }
        );
        task
    }
}

/// Run the monitor worker until cancelled.
pub async fn run_monitor_stage(
    mut monitor: SpeechMonitor,
    rx: crate::pipeline::SharedReceiver<Frame>,
    tx: mpsc::Sender<VoiceTask>,
    ready: Arc<Event>,
    cancel: CancellationToken,
) {
    ready.set();
    info!("speech monitor started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = crate::pipeline::recv_shared(&rx) => {
                let Some(frame) = frame else { break };
                if let Some(task) = monitor.handle_frame(&frame)
                    && tx.send(task).await.is_err()
                {
                    break;
                }
            }
        }
    }

    info!("speech monitor stopped");
}

/// Convert 16-bit PCM to float samples in [-1, 1].
fn normalize_frame(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| f32::from(s) / f32::from(i16::MAX)).collect()
}

/// Frame duration in milliseconds at the pipeline rate.
fn duration_ms(samples: usize) -> f32 {
    samples as f32 / SAMPLE_RATE as f32 * 1000.0
}

/// Largest absolute sample value.
fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0, f32::max)
}
