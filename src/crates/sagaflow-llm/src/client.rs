//! Chat-client trait and shared request types

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use sagaflow_journal::CancelSignal;

use crate::error::Result;

/// A finite, non-restartable sequence of response chunks
///
/// The caller owns backpressure: chunks are produced as they are polled.
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Narrow interface steps use to talk to a language model
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Single-shot completion
    async fn get_response(&self, prompt: &str, cancel: &CancelSignal) -> Result<String>;

    /// Streaming completion; the stream is finite and cannot be restarted
    async fn get_streaming_response(
        &self,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<ChunkStream>;
}

/// Connection settings for an OpenAI-compatible chat endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Base URL, e.g. `http://localhost:11434/v1`
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_timeout_secs() -> u64 {
    120
}

impl ChatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_deserialize() {
        let config: ChatConfig = serde_json::from_str(
            r#"{"base_url": "http://localhost:11434/v1", "model": "llama3"}"#,
        )
        .unwrap();
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.timeout_secs, 120);
        assert!(config.api_key.is_none());
    }
}
