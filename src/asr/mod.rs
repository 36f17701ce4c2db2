//! Speech recognition engines.
//!
//! The pipeline talks to external recognition servers: FunASR for Mandarin
//! and Whisper for English, selected per the configured dialogue language.
//! Both speak the same small HTTP contract — POST a mono 16kHz WAV to
//! `/transcribe`, get `{"text": ...}` back.

use crate::config::{AsrConfig, Language};
use crate::error::{DialogueError, Result};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::info;

/// A speech recognition engine.
///
/// `transcribe` receives float32 mono 16kHz samples; clips shorter than
/// one second must be padded by the caller (see [`ensure_minimum_duration`]).
#[async_trait]
pub trait AsrEngine: Send {
    /// Prepare the engine (reach the server, load models).
    async fn setup(&mut self) -> Result<()>;

    /// Run one throwaway transcription so the first real request is fast.
    async fn warmup(&mut self) -> Result<()>;

    /// Transcribe a padded utterance clip.
    async fn transcribe(&mut self, samples: &[f32], language: Language) -> Result<String>;
}

/// HTTP client for a recognition server.
pub struct HttpAsrEngine {
    name: &'static str,
    base_url: String,
    sample_rate: u32,
    agent: ureq::Agent,
}

impl HttpAsrEngine {
    /// FunASR client (Mandarin).
    pub fn funasr(config: &AsrConfig) -> Self {
        Self::new("funasr", &config.funasr_url, config.timeout_secs)
    }

    /// Whisper client (English).
    pub fn whisper(config: &AsrConfig) -> Self {
        Self::new("whisper", &config.whisper_url, config.timeout_secs)
    }

    /// Engine for the configured dialogue language.
    pub fn for_language(config: &AsrConfig) -> Self {
        match config.language {
            Language::Zh => Self::funasr(config),
            Language::En => Self::whisper(config),
        }
    }

    fn new(name: &'static str, base_url: &str, timeout_secs: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(timeout_secs))
            .build();
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_owned(),
            sample_rate: 16_000,
            agent,
        }
    }
}

#[async_trait]
impl AsrEngine for HttpAsrEngine {
    async fn setup(&mut self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let agent = self.agent.clone();
        let name = self.name;
        tokio::task::spawn_blocking(move || {
            agent
                .get(&url)
                .call()
                .map_err(|e| DialogueError::Asr(format!("{name} server unreachable: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| DialogueError::Asr(format!("setup task failed: {e}")))?
    }

    async fn warmup(&mut self) -> Result<()> {
        let start = Instant::now();
        let silence = vec![0.0f32; self.sample_rate as usize];
        let language = if self.name == "funasr" {
            Language::Zh
        } else {
            Language::En
        };
        self.transcribe(&silence, language).await?;
        info!(
            "{} warmup done in {:.0}ms",
            self.name,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    async fn transcribe(&mut self, samples: &[f32], language: Language) -> Result<String> {
        let wav = encode_wav_pcm16(samples, self.sample_rate)?;
        let url = format!("{}/transcribe?language={}", self.base_url, language);
        let agent = self.agent.clone();
        let name = self.name;

        tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&url)
                .set("Content-Type", "audio/wav")
                .send_bytes(&wav)
                .map_err(|e| DialogueError::Asr(format!("{name} request failed: {e}")))?;

            let body = response
                .into_string()
                .map_err(|e| DialogueError::Asr(format!("{name} response read: {e}")))?;
            let body: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| DialogueError::Asr(format!("{name} response parse: {e}")))?;

            body["text"]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| DialogueError::Asr(format!("{name} response missing text field")))
        })
        .await
        .map_err(|e| DialogueError::Asr(format!("transcribe task failed: {e}")))?
    }
}

/// Pad `samples` with silence up to `min_secs` so very short clips do not
/// confuse the recognizer.
pub fn ensure_minimum_duration(samples: &[f32], min_secs: f32, sample_rate: u32) -> Vec<f32> {
    let min_len = (min_secs * sample_rate as f32) as usize;
    let mut out = samples.to_vec();
    if out.len() < min_len {
        out.resize(min_len, 0.0);
    }
    out
}

/// Encode float samples as a 16-bit PCM mono WAV in memory.
pub fn encode_wav_pcm16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| DialogueError::Asr(format!("WAV encode: {e}")))?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(v)
                .map_err(|e| DialogueError::Asr(format!("WAV encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| DialogueError::Asr(format!("WAV encode: {e}")))?;
    }
    Ok(cursor.into_inner())
}
