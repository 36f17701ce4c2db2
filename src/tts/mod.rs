//! Speech synthesis engine.
//!
//! Sentences are rendered by an external synthesis server: POST
//! `{"text": ..., "voice": ...}` to `/synthesize`, receive a WAV whose
//! sample rate the engine chose. The engine is swappable at runtime via
//! the service manager (stop the TTS stage, start one with a new voice);
//! in-flight clips stay valid because they already carry their audio.

use crate::config::TtsConfig;
use crate::error::{DialogueError, Result};
use crate::pipeline::messages::AudioClip;
use async_trait::async_trait;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::info;

/// A speech synthesis engine.
#[async_trait]
pub trait TtsEngine: Send {
    /// Prepare the engine (reach the server, load the voice).
    async fn setup(&mut self) -> Result<()>;

    /// Run one throwaway synthesis so the first real request is fast.
    async fn warmup(&mut self) -> Result<()>;

    /// Render `text` to audio.
    async fn synthesize(&mut self, text: &str) -> Result<AudioClip>;
}

/// HTTP client for a synthesis server.
pub struct HttpTtsEngine {
    base_url: String,
    voice: String,
    agent: ureq::Agent,
}

impl HttpTtsEngine {
    /// Create a client for the configured endpoint and voice.
    pub fn new(config: &TtsConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            voice: config.voice.clone(),
            agent,
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTtsEngine {
    async fn setup(&mut self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            agent
                .get(&url)
                .call()
                .map_err(|e| DialogueError::Tts(format!("TTS server unreachable: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| DialogueError::Tts(format!("setup task failed: {e}")))?
    }

    async fn warmup(&mut self) -> Result<()> {
        let start = Instant::now();
        let clip = self.synthesize("Ready.").await?;
        info!(
            "TTS warmup done in {:.0}ms ({:.1}s audio at {}Hz)",
            start.elapsed().as_millis(),
            clip.duration_secs(),
            clip.sample_rate
        );
        Ok(())
    }

    async fn synthesize(&mut self, text: &str) -> Result<AudioClip> {
        let url = format!("{}/synthesize", self.base_url);
        let body = serde_json::json!({
            "text": text,
            "voice": self.voice,
        });
        let agent = self.agent.clone();

        tokio::task::spawn_blocking(move || {
            let body_str = serde_json::to_string(&body)
                .map_err(|e| DialogueError::Tts(format!("request serialization: {e}")))?;
            let response = agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_string(&body_str)
                .map_err(|e| DialogueError::Tts(format!("synthesis request failed: {e}")))?;

            let mut bytes = Vec::new();
            std::io::Read::read_to_end(&mut response.into_reader(), &mut bytes)
                .map_err(|e| DialogueError::Tts(format!("response read: {e}")))?;

            decode_wav(&bytes)
        })
        .await
        .map_err(|e| DialogueError::Tts(format!("synthesis task failed: {e}")))?
    }
}

/// Decode a WAV payload into float samples plus its sample rate.
fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| DialogueError::Tts(format!("WAV decode: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = f32::from(i16::MAX);
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / max))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| DialogueError::Tts(format!("WAV decode: {e}")))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| DialogueError::Tts(format!("WAV decode: {e}")))?,
    };

    // Mix down to mono if the engine returned multiple channels.
    let samples = if spec.channels > 1 {
        let ch = spec.channels as usize;
        samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Whether `text` contains anything speakable: letters, digits, or CJK
/// ideographs. Punctuation-only sentences are dropped before synthesis.
pub fn has_word_characters(text: &str) -> bool {
    text.chars()
        .any(|c| c.is_ascii_alphanumeric() || ('\u{4E00}'..='\u{9FA5}').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::encode_wav_pcm16;

    #[test]
    fn word_character_gate() {
        assert!(has_word_characters("hello"));
        assert!(has_word_characters("你好"));
        assert!(has_word_characters("x1"));
        assert!(!has_word_characters("，。！？"));
        assert!(!has_word_characters("... !!"));
        assert!(!has_word_characters(""));
    }

    #[test]
    fn wav_decode_matches_encode() {
        let original = vec![0.0f32, 0.25, -0.25, 0.9];
        let bytes = encode_wav_pcm16(&original, 24_000).expect("encode");
        let clip = decode_wav(&bytes).expect("decode");
        assert_eq!(clip.sample_rate, 24_000);
        assert_eq!(clip.samples.len(), 4);
        for (a, b) in clip.samples.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }
}
