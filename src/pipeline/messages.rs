//! Message types passed between pipeline stages.

use crate::config::Language;
use serde::Serialize;
use std::time::Instant;

/// A chunk of microphone audio from the capture stage.
///
/// 16-bit PCM at the pipeline rate (16kHz mono). `voice_active` is filled
/// by the echo-cancelled capture strategy; plain capture leaves it `None`
/// and the monitor runs its own VAD.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw PCM samples.
    pub pcm: Vec<i16>,
    /// Echo-canceller voice-activity flag, when available.
    pub voice_active: Option<bool>,
}

/// Synthesized audio attached to a task by the TTS stage.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// f32 samples in [-1, 1].
    pub samples: Vec<f32>,
    /// Engine-reported sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioClip {
    /// Clip duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Stage timing stamps for observability.
#[derive(Debug, Clone, Default)]
pub struct TaskTimings {
    /// When the monitor dispatched the utterance.
    pub sent_at: Option<Instant>,
    /// ASR start/end.
    pub asr_started_at: Option<Instant>,
    pub asr_finished_at: Option<Instant>,
    /// LLM start/end (per emitted sentence).
    pub llm_started_at: Option<Instant>,
    pub llm_finished_at: Option<Instant>,
    /// TTS start/end.
    pub tts_started_at: Option<Instant>,
    pub tts_finished_at: Option<Instant>,
}

/// The unit that flows through ASR → LLM → TTS → playback.
///
/// Tasks are value-copied at every queue hand-off so each stage mutates its
/// own copy; the LLM stage fans one task out into several copies sharing
/// `id` and `answer_id` but carrying distinct `answer_index` values.
#[derive(Debug, Clone)]
pub struct VoiceTask {
    /// Utterance identity, unique per utterance.
    pub id: String,
    /// Dialogue session the task belongs to.
    pub session_id: String,
    /// Answer identity, assigned at dispatch.
    pub answer_id: String,
    /// 0-based index of this sentence within the answer.
    pub answer_index: u32,
    /// Dialogue language.
    pub language: Language,
    /// Utterance audio; cleared after ASR.
    pub user_voice: Vec<f32>,
    /// ASR output.
    pub transcribed_text: String,
    /// One LLM sentence.
    pub answer_sentence: String,
    /// Synthesized audio for `answer_sentence`.
    pub sentence_audio: Option<AudioClip>,
    /// The originating utterance hit the long-utterance threshold.
    pub over_long_threshold: bool,
    /// Stage timing stamps.
    pub timings: TaskTimings,
}

impl VoiceTask {
    /// Create a task for a freshly segmented utterance.
    pub fn new(id: String, session_id: String, language: Language) -> Self {
        Self {
            id,
            session_id,
            answer_id: String::new(),
            answer_index: 0,
            language,
            user_voice: Vec::new(),
            transcribed_text: String::new(),
            answer_sentence: String::new(),
            sentence_audio: None,
            over_long_threshold: false,
            timings: TaskTimings::default(),
        }
    }
}

/// Messages forwarded to the UI over the WebSocket surface.
///
/// These are the only pipeline events a client ever sees; errors and drops
/// stay internal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum UiMessage {
    /// The user's transcribed question, emitted when LLM processing starts.
    Question {
        session_id: String,
        task_id: String,
        question: String,
    },
    /// One assistant sentence, emitted when its audio starts playing.
    Answer {
        session_id: String,
        task_id: String,
        answer_index: u32,
        answer: String,
    },
}

impl UiMessage {
    /// The session this message belongs to (used for connection routing).
    pub fn session_id(&self) -> &str {
        match self {
            Self::Question { session_id, .. } | Self::Answer { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_message_serializes_with_tag() {
        let msg = UiMessage::Answer {
            session_id: "s1".to_owned(),
            task_id: "t1".to_owned(),
            answer_index: 2,
            answer: "hello".to_owned(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["message_type"], "answer");
        assert_eq!(json["answer_index"], 2);
        assert_eq!(msg.session_id(), "s1");
    }

    #[test]
    fn clip_duration() {
        let clip = AudioClip {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
        };
        assert!((clip.duration_secs() - 1.0).abs() < f32::EPSILON);
    }
}
