//! # sagaflow-llm - chat-client interface for workflow steps
//!
//! Steps that talk to a language model do so through the narrow
//! [`ChatClient`] trait: a single-shot completion and a finite, streaming
//! variant whose backpressure the caller owns. Two implementations ship
//! here:
//!
//! - [`HttpChatClient`] - any OpenAI-compatible `/chat/completions`
//!   endpoint (OpenAI, Ollama, vLLM, LM Studio)
//! - [`MockChatClient`] - a scripted client for deterministic step tests
//!
//! Cancellation flows through the same [`CancelSignal`] the engine hands to
//! steps, so an aborted workflow stops its in-flight model calls at the next
//! I/O boundary.
//!
//! [`CancelSignal`]: sagaflow_journal::CancelSignal

pub mod client;
pub mod error;
pub mod mock;
pub mod remote;

pub use client::{ChatClient, ChatConfig, ChunkStream};
pub use error::{LlmError, Result};
pub use mock::MockChatClient;
pub use remote::HttpChatClient;
