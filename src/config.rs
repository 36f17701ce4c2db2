//! Configuration types for the dialogue pipeline.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the dialogue engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Acoustic echo cancellation settings.
    pub aec: AecConfig,
    /// Speech-activity monitor settings.
    pub monitor: MonitorConfig,
    /// Speech recognition settings.
    pub asr: AsrConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// Service lifecycle settings.
    pub services: ServiceConfig,
    /// HTTP/WebSocket surface settings.
    pub server: ServerConfig,
}

impl DialogueConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::DialogueError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::DialogueError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Dialogue language. Selects the ASR engine and the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Mandarin Chinese.
    Zh,
    /// English.
    En,
}

impl Default for Language {
    fn default() -> Self {
        Self::Zh
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zh => write!(f, "zh"),
            Self::En => write!(f, "en"),
        }
    }
}

impl std::str::FromStr for Language {
    type Err = crate::error::DialogueError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "zh" => Ok(Self::Zh),
            "en" => Ok(Self::En),
            other => Err(crate::error::DialogueError::Config(format!(
                "unknown language '{other}' (expected zh or en)"
            ))),
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz. The pipeline operates at 16kHz mono.
    pub input_sample_rate: u32,
    /// Capture chunk size in samples at the pipeline rate.
    pub frame_size: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            frame_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Acoustic echo cancellation configuration.
///
/// When enabled, the echo-cancelled capture strategy also supplies the
/// per-frame voice-active flag, so the monitor skips its own VAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AecConfig {
    /// Whether to attempt the echo-cancelled capture strategy.
    pub enabled: bool,
    /// FFT size for the FDAF adaptive filter (must be a power of two).
    /// Frame size = fft_size / 2; with 1024 at 16kHz each frame is 32ms.
    pub fft_size: usize,
    /// NLMS learning rate for the adaptive filter.
    pub step_size: f32,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fft_size: 1024,
            step_size: 0.05,
        }
    }
}

/// Speech-activity monitor configuration. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Continuous voice-active duration that marks the current task as
    /// interrupted (barge-in).
    pub active_frame_threshold_ms: u32,
    /// Silence after voice that ends the utterance and unblocks playback.
    pub user_silence_threshold_ms: u32,
    /// Maximum trailing silence kept in the buffered utterance.
    pub silence_tail_ms: u32,
    /// Buffered voice duration that forces a fragment flush.
    pub long_utterance_threshold_ms: u32,
    /// Speech score threshold for the energy VAD.
    pub vad_threshold: f32,
    /// VAD window size in samples at 16kHz.
    pub vad_window: usize,
    /// Minimum peak amplitude for a voice-active frame to count.
    pub min_amplitude: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            active_frame_threshold_ms: 100,
            user_silence_threshold_ms: 1_000,
            silence_tail_ms: 300,
            long_utterance_threshold_ms: 5_000,
            vad_threshold: 0.7,
            vad_window: 512,
            min_amplitude: 0.01,
        }
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Dialogue language; selects FunASR (zh) or Whisper (en).
    pub language: Language,
    /// FunASR server endpoint.
    pub funasr_url: String,
    /// Whisper server endpoint.
    pub whisper_url: String,
    /// Clips shorter than this are padded before transcription (seconds).
    pub min_clip_secs: f32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            language: Language::Zh,
            funasr_url: "http://localhost:10095".to_owned(),
            whisper_url: "http://localhost:9000".to_owned(),
            min_clip_secs: 1.0,
            timeout_secs: 30,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub api_url: String,
    /// Model identifier sent with each request.
    pub api_model: String,
    /// Bearer token (empty = no Authorization header).
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling parameter.
    pub top_p: f64,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Dialogue turns of history fed back per request.
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_model: "qwen3:4b".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 1024,
            history_turns: 3,
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis server endpoint.
    pub api_url: String,
    /// Voice identifier passed to the engine.
    pub voice: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9880".to_owned(),
            voice: "default".to_owned(),
            timeout_secs: 60,
        }
    }
}

/// Service lifecycle configuration. Durations in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default startup timeout.
    pub startup_timeout_secs: u64,
    /// Startup timeout for the LLM stage (model servers load slowly).
    pub llm_startup_timeout_secs: u64,
    /// Startup timeout for the TTS stage.
    pub tts_startup_timeout_secs: u64,
    /// Per-service wait during shutdown.
    pub shutdown_wait_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 60,
            llm_startup_timeout_secs: 180,
            tts_startup_timeout_secs: 120,
            shutdown_wait_secs: 5,
        }
    }
}

/// HTTP/WebSocket surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8200,
        }
    }
}
