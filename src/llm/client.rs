//! Streaming chat client for an OpenAI-compatible completions API.
//!
//! Works against any local model server implementing the chat completions
//! SSE protocol (Ollama, vLLM, llama.cpp server, MLX server, ...). The
//! blocking HTTP read runs on the blocking pool and feeds content chunks
//! into an async channel; dropping the receiver aborts the stream at the
//! next chunk boundary, which is how interruption reaches the wire.

use crate::config::LlmConfig;
use crate::error::{DialogueError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Channel depth between the SSE reader and the consuming stage.
const CHUNK_CHANNEL_SIZE: usize = 64;

/// Chat completions client.
pub struct LlmClient {
    config: LlmConfig,
    agent: ureq::Agent,
}

impl LlmClient {
    /// Create a client for the configured endpoint.
    pub fn new(config: &LlmConfig) -> Self {
        info!(
            "LLM client configured: {} model={}",
            config.api_url, config.api_model
        );
        Self {
            config: config.clone(),
            agent: ureq::agent(),
        }
    }

    /// Start a streaming completion.
    ///
    /// `history` holds windowed (user, assistant) turns, oldest first.
    /// Returns a receiver of raw content chunks plus the reader handle;
    /// the handle resolves to an error if the request or stream failed.
    /// Dropping the receiver stops the reader.
    pub fn stream(
        &self,
        system_prompt: &str,
        history: &[(String, String)],
        user_input: &str,
        session_id: &str,
    ) -> (mpsc::Receiver<String>, JoinHandle<Result<()>>) {
        let mut messages = Vec::with_capacity(2 + history.len() * 2);
        messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
        for (question, answer) in history {
            messages.push(serde_json::json!({"role": "user", "content": question}));
            messages.push(serde_json::json!({"role": "assistant", "content": answer}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_input}));

        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": messages,
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });

        let url = chat_completions_url(&self.config.api_url);
        let agent = self.agent.clone();
        let api_key = self.config.api_key.clone();
        let session = session_id.to_owned();

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(CHUNK_CHANNEL_SIZE);

        let handle = tokio::task::spawn_blocking(move || -> Result<()> {
            let body_str = serde_json::to_string(&body)
                .map_err(|e| DialogueError::Llm(format!("request serialization failed: {e}")))?;

            let mut req = agent.post(&url).set("Content-Type", "application/json");
            if !api_key.is_empty() {
                let auth = format!("Bearer {api_key}");
                req = req.set("Authorization", &auth);
            }

            let response = req
                .send_string(&body_str)
                .map_err(|e| DialogueError::Llm(format!("chat request failed: {e}")))?;

            let reader = std::io::BufReader::new(response.into_reader());
            for line in std::io::BufRead::lines(reader) {
                let line = line.map_err(|e| DialogueError::Llm(format!("stream read: {e}")))?;
                if line.is_empty() {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }

                let chunk: serde_json::Value = serde_json::from_str(data)
                    .map_err(|e| DialogueError::Llm(format!("stream parse: {e}")))?;

                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str()
                    && !content.is_empty()
                    && chunk_tx.blocking_send(content.to_owned()).is_err()
                {
                    // Receiver gone: the task was interrupted downstream.
                    info!("LLM stream for session {session} abandoned by consumer");
                    break;
                }

                if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break;
                }
            }
            Ok(())
        });

        (chunk_rx, handle)
    }

    /// Run a throwaway completion so the model server is hot before the
    /// first real utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the warmup request fails; callers log and
    /// continue.
    pub async fn warmup(&self, system_prompt: &str) -> Result<()> {
        let (mut rx, handle) = self.stream(
            system_prompt,
            &[],
            "Hello, this is a warmup request; reply with \"Ok\".",
            "warmup",
        );
        while rx.recv().await.is_some() {}
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(DialogueError::Llm(format!("warmup task failed: {e}"))),
        }
    }
}

/// Normalize a configured base URL into the chat completions endpoint.
fn chat_completions_url(api_url: &str) -> String {
    let base = api_url.strip_suffix("/v1").unwrap_or(api_url);
    let base = base.trim_end_matches('/');
    format!("{base}/v1/chat/completions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization() {
        assert_eq!(
            chat_completions_url("http://localhost:11434"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:8080/v1"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:8080/"),
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
