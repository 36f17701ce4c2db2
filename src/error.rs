//! Error types for the dialogue pipeline.

/// Top-level error type for the spoken-dialogue system.
#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    /// Configuration error (unknown language, bad endpoint, invalid TOML).
    #[error("config error: {0}")]
    Config(String),

    /// A service failed to become ready within its startup timeout.
    ///
    /// This is the only error that aborts the whole startup when the
    /// failing service is required.
    #[error("startup error: {0}")]
    Startup(String),

    /// Audio capture/playback device error.
    #[error("audio device error: {0}")]
    Device(String),

    /// Speech recognition engine error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis engine error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Channel send/receive error (a pipeline stage has gone away).
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DialogueError>;
