//! The LLM client contract. The concrete client (request signing,
//! retries, provider SDKs) lives outside this crate; this trait is the seam
//! the commit engine and operations (merge/compress/collapse) call through.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::TraceError;
use crate::llm::LLMConfig;

/// Normalized usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A chat completion response. `model` is authoritative: callers overwrite
/// the requested model on the resulting commit's `generation_config` with
/// whatever the provider actually reports having used.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub raw: Value,
}

/// One chat-style message sent to the client, already aggregated and
/// role-resolved by the compiler.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: crate::content::Role,
    pub text: String,
}

/// Object-safe LLM client contract. Implementations live outside this crate;
/// the engine only ever calls through this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &LLMConfig,
    ) -> Result<ChatResponse, TraceError>;
}
