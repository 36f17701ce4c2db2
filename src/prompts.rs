//! System prompt resolution and per-user overrides.
//!
//! User overrides live in a small JSON document under the OS app-data
//! directory and are cached in memory: write-through on update, cache and
//! file cleared on reset. The `/no_think` directive is appended at lookup
//! time so the stored prompt stays clean for display.

use crate::config::Language;
use crate::error::{DialogueError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

/// Built-in Mandarin system prompt.
pub const DEFAULT_ZH_PROMPT: &str = "你是一个友好的语音助手。请用简短、口语化的中文回答，\
避免使用列表、代码块和表情符号，回答控制在三句话以内。";

/// Built-in English system prompt.
pub const DEFAULT_EN_PROMPT: &str = "You are a friendly voice assistant. Answer briefly in \
conversational English, avoid lists, code blocks and emoji, and keep replies under three \
sentences.";

/// Directive appended so reasoning models skip their thinking block.
const NO_THINK_DIRECTIVE: &str = "/no_think";

/// Persisted override document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserPrompts {
    #[serde(skip_serializing_if = "Option::is_none")]
    chinese_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    english_prompt: Option<String>,
}

/// Prompt storage with an in-memory cache.
#[derive(Debug)]
pub struct PromptStore {
    path: PathBuf,
    cache: Mutex<Option<UserPrompts>>,
}

impl PromptStore {
    /// Store under the OS app-data directory.
    pub fn new() -> Self {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self::at(base.join("parlance").join("user_prompts.json"))
    }

    /// Store at an explicit path (used by tests).
    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
        }
    }

    /// The prompt sent to the LLM for `language`, `/no_think` included.
    pub fn prompt_for(&self, language: Language) -> String {
        let base = self.raw_prompt(language);
        if base.contains(NO_THINK_DIRECTIVE) {
            base
        } else {
            format!("{}\n{NO_THINK_DIRECTIVE}", base.trim_end())
        }
    }

    /// The prompt as shown to the user, without the directive.
    pub fn raw_prompt(&self, language: Language) -> String {
        let prompts = self.load();
        match language {
            Language::Zh => prompts
                .chinese_prompt
                .unwrap_or_else(|| DEFAULT_ZH_PROMPT.to_owned()),
            Language::En => prompts
                .english_prompt
                .unwrap_or_else(|| DEFAULT_EN_PROMPT.to_owned()),
        }
    }

    /// The built-in default for `language`.
    pub fn default_prompt(language: Language) -> &'static str {
        match language {
            Language::Zh => DEFAULT_ZH_PROMPT,
            Language::En => DEFAULT_EN_PROMPT,
        }
    }

    /// Persist an override for `language` and refresh the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn set_prompt(&self, language: Language, prompt: &str) -> Result<()> {
        let mut prompts = self.load();
        match language {
            Language::Zh => prompts.chinese_prompt = Some(prompt.to_owned()),
            Language::En => prompts.english_prompt = Some(prompt.to_owned()),
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&prompts)
            .map_err(|e| DialogueError::Config(format!("prompt serialization: {e}")))?;
        std::fs::write(&self.path, content)?;
        info!("user prompts saved to {}", self.path.display());
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(prompts);
        }
        Ok(())
    }

    /// Remove all overrides, reverting to the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be removed.
    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!("user prompts reset to defaults");
        }
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(UserPrompts::default());
        }
        Ok(())
    }

    /// Load overrides, hitting the disk only on the first call.
    fn load(&self) -> UserPrompts {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(ref prompts) = *cache {
                return prompts.clone();
            }
            let prompts = match std::fs::read_to_string(&self.path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(prompts) => prompts,
                    Err(e) => {
                        warn!("invalid user prompt document, using defaults: {e}");
                        UserPrompts::default()
                    }
                },
                Err(_) => UserPrompts::default(),
            };
            *cache = Some(prompts.clone());
            prompts
        } else {
            UserPrompts::default()
        }
    }
}

impl Default for PromptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn store() -> (PromptStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::at(dir.path().join("prompts.json"));
        (store, dir)
    }

    #[test]
    fn defaults_when_no_overrides() {
        let (store, _dir) = store();
        assert_eq!(store.raw_prompt(Language::Zh), DEFAULT_ZH_PROMPT);
        assert_eq!(store.raw_prompt(Language::En), DEFAULT_EN_PROMPT);
    }

    #[test]
    fn no_think_appended_once() {
        let (store, _dir) = store();
        let prompt = store.prompt_for(Language::En);
        assert!(prompt.ends_with("/no_think"));

        store.set_prompt(Language::En, "Custom.\n/no_think").unwrap();
        let prompt = store.prompt_for(Language::En);
        assert_eq!(prompt.matches("/no_think").count(), 1);
    }

    #[test]
    fn override_persists_and_resets() {
        let (store, dir) = store();
        store.set_prompt(Language::Zh, "自定义提示词").unwrap();
        assert_eq!(store.raw_prompt(Language::Zh), "自定义提示词");
        // English untouched.
        assert_eq!(store.raw_prompt(Language::En), DEFAULT_EN_PROMPT);

        // A fresh store re-reads the file.
        let reloaded = PromptStore::at(dir.path().join("prompts.json"));
        assert_eq!(reloaded.raw_prompt(Language::Zh), "自定义提示词");

        store.reset().unwrap();
        assert_eq!(store.raw_prompt(Language::Zh), DEFAULT_ZH_PROMPT);
        assert!(!dir.path().join("prompts.json").exists());
    }
}
