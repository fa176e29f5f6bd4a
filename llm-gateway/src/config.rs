//! Gateway configuration.

use serde::{Deserialize, Serialize};

/// Which backend serves chat completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Any OpenAI-compatible chat-completions API (OpenAI, DeepSeek,
    /// vLLM, Ollama's `/v1` endpoint, ...).
    OpenAi,
    /// Deterministic scripted backend used by tests and offline runs.
    Scripted,
}

/// Configuration for a chat model invocation.
///
/// `endpoint` is the API base URL; the chat-completions path is appended
/// by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: LlmProvider,
    #[serde(default = "default_model")]
    pub model: String,
    /// API base URL, e.g. `https://api.deepseek.com`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_provider() -> LlmProvider {
    LlmProvider::OpenAi
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: None,
        }
    }
}
