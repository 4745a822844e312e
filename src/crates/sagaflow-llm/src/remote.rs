//! OpenAI-compatible HTTP chat client
//!
//! Works against any endpoint speaking the `/chat/completions` shape
//! (OpenAI, Ollama, vLLM, LM Studio). Streaming parses server-sent-event
//! lines and yields delta content chunks; the caller owns backpressure.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use sagaflow_journal::CancelSignal;

use crate::client::{ChatClient, ChatConfig, ChunkStream};
use crate::error::{LlmError, Result};

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP chat client over an OpenAI-compatible endpoint
#[derive(Debug)]
pub struct HttpChatClient {
    config: ChatConfig,
    http: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(config: ChatConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::Configuration("base_url must be set".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream": stream,
        });
        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        request
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(
                response.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn get_response(&self, prompt: &str, cancel: &CancelSignal) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        debug!(model = %self.config.model, "chat completion request");

        let mut cancel = cancel.clone();
        let response = tokio::select! {
            response = self.request(prompt, false).send() => response?,
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };
        let response = Self::check_status(response).await?;

        let completion: ChatCompletion = response.json().await.map_err(|err| {
            LlmError::MalformedResponse(err.to_string())
        })?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("empty choices array".to_string()))
    }

    async fn get_streaming_response(
        &self,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<ChunkStream> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let response = self.request(prompt, true).send().await?;
        let response = Self::check_status(response).await?;

        let cancel = cancel.clone();
        let stream = async_stream::try_stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    Err::<(), LlmError>(LlmError::Cancelled)?;
                }
                let chunk = chunk.map_err(LlmError::from)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited `data: {...}` lines.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() || payload == "[DONE]" {
                        continue;
                    }
                    let parsed: StreamChunk = serde_json::from_str(payload)
                        .map_err(|err| LlmError::MalformedResponse(err.to_string()))?;
                    if let Some(content) = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                    {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
