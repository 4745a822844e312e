//! Scripted chat client for tests
//!
//! Responses are consumed in the order they were scripted; when the script
//! runs dry the client echoes the prompt, which keeps step tests readable
//! without scripting every call.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;

use sagaflow_journal::CancelSignal;

use crate::client::{ChatClient, ChunkStream};
use crate::error::{LlmError, Result};

/// Deterministic, scriptable chat client
#[derive(Default)]
pub struct MockChatClient {
    script: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response
    pub fn script(&self, response: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response.into());
    }

    /// Prompts observed so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_response(&self, prompt: &str) -> String {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| format!("echo: {prompt}"))
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn get_response(&self, prompt: &str, cancel: &CancelSignal) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        Ok(self.next_response(prompt))
    }

    async fn get_streaming_response(
        &self,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<ChunkStream> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let response = self.next_response(prompt);
        let chunks: Vec<Result<String>> = response
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}
