//! The provider-agnostic LLM gateway (spec §4.1, component C3).
//!
//! Two layers:
//! - [`LLMProvider`]: the teacher's own generic, `Clone`-friendly trait
//!   (`llm/provider.rs` in the teacher crate), kept close to its original
//!   shape. Each backend adapter implements it directly.
//! - [`gateway::Client`]/[`gateway::ChatSession`]: an object-safe wrapper
//!   around any `LLMProvider`, matching spec §4.1's literal
//!   `Client`/`Chat` contract (`StartChat`, `Send`, `SendStreaming`,
//!   `SetFunctionDefinitions`, `IsRetryableError`). The [`registry`]
//!   returns `Box<dyn Client>` so callers never need to know which
//!   backend they're talking to.

pub mod bedrock;
pub mod gateway;
pub mod gemini;
pub mod llamacpp;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod retry;

use crate::schema::Schema;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ============================================================================
// Core Trait (backend adapter level)
// ============================================================================

/// Generic per-backend provider contract. Every wire adapter
/// (OpenAI/Gemini/Anthropic/Bedrock/Ollama/llama.cpp) implements this
/// directly; the object-safe [`gateway::Client`] wraps it for callers that
/// need dynamic dispatch across backends.
#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    /// Create a new provider instance with model and API key.
    fn create(model: String, api_key: String) -> Result<Self, ProviderError>
    where
        Self: Sized;

    /// Current token usage / request-count state. Safe to call while a
    /// chat loop is in flight.
    fn state(&self) -> ProviderState;

    fn config(&self) -> ProviderConfig;

    fn update_config(&self, f: impl FnOnce(&mut ProviderConfig));

    /// Enumerate available model IDs for this backend (spec §4.1
    /// `ListModels`). Backends without a models endpoint return a
    /// hard-coded list of the models they support.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Constrain subsequent responses to match this schema. Backends that
    /// don't support response-schema constraints are a documented nil-op
    /// (spec §4.1): they return `Ok(())` without effect.
    fn set_response_schema(&self, schema: Option<Schema>) -> Result<(), ProviderError>;

    /// Simple stateless chat completion, returned as a stream of chunks.
    async fn chat(
        &self,
        prompt: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError>;

    /// Advanced chat loop with conversation history and tool calling.
    async fn chat_loop(
        &self,
        history: Vec<Message>,
        tools: Option<Vec<FunctionDefinition>>,
    ) -> Result<ChatLoopHandle, ProviderError>;

    fn prompt_cache(&mut self, cache_prompt: String) -> Result<(), ProviderError>;

    async fn compact(&self, history: Vec<Message>) -> Result<Vec<Message>, ProviderError>;

    fn get_history(&self) -> Vec<Message>;

    /// Classify whether an error is worth retrying (spec §4.1's status
    /// table: 409/425/429/500/502/503/504 and timeouts).
    fn is_retryable_error(&self, err: &ProviderError) -> bool {
        default_is_retryable(err)
    }
}

/// Shared retryable-error classification, usable both as the
/// [`LLMProvider`] default and directly by the retry decorator.
pub fn default_is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::Timeout => true,
        ProviderError::ApiError(msg) => {
            for code in ["409", "425", "429", "500", "502", "503", "504"] {
                if msg.contains(code) {
                    return true;
                }
            }
            false
        }
        ProviderError::NetworkError(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}

// ============================================================================
// State and Configuration
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub request_count: u64,
    pub last_request_time: Option<std::time::SystemTime>,
    pub metadata: HashMap<String, String>,
    pub conversation_turns: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub enable_reasoning: bool,
    pub system_prompt: Option<String>,
    pub stop_sequences: Vec<String>,
    pub extra_options: HashMap<String, serde_json::Value>,
    /// Maximum number of tool call/result turns to keep in history (None =
    /// unlimited). One turn = one assistant message with tool calls plus
    /// its corresponding tool result messages.
    pub max_tool_turns: Option<usize>,
    /// Response schema set via `SetResponseSchema` (spec §4.1).
    pub response_schema: Option<Schema>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 40960,
            top_p: None,
            top_k: None,
            enable_reasoning: false,
            system_prompt: None,
            stop_sequences: Vec::new(),
            extra_options: HashMap::new(),
            max_tool_turns: Some(3),
            response_schema: None,
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry in a conversation's history (spec §3 `Message`). Owned
/// exclusively by the chat session it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub function_calls: Option<Vec<FunctionCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            function_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            function_calls: None,
        }
    }

    pub fn tool_result(result: &FunctionCallResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.result_text(),
            tool_call_id: Some(result.id.clone()),
            function_calls: None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::System => write!(f, "System: {}", self.content),
            Role::User => write!(f, "User: {}", self.content),
            Role::Assistant => write!(f, "Assistant: {}", self.content),
            Role::Tool => write!(f, "Tool: {}", self.content),
        }
    }
}

/// A function call produced by the LLM (spec §3 `FunctionCall`). `id` is
/// opaque and must be echoed back verbatim in the matching
/// [`FunctionCallResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Definition registered at chat start; immutable for the chat's lifetime
/// (spec §3 `FunctionDefinition`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Schema,
}

/// Result of running a [`FunctionCall`]'s tool. `result` is the tool's
/// output coerced to a structured map; string outputs wrap as
/// `{"content": str}` per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResult {
    pub id: String,
    pub name: String,
    pub result: serde_json::Map<String, serde_json::Value>,
    pub is_error: bool,
}

impl FunctionCallResult {
    pub fn from_text(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        let mut map = serde_json::Map::new();
        map.insert("content".to_string(), serde_json::Value::String(text.into()));
        Self {
            id: id.into(),
            name: name.into(),
            result: map,
            is_error,
        }
    }

    /// Render the result map back down to text for wire formats (or
    /// relayed-as-user-message fallbacks) that only carry a string body.
    pub fn result_text(&self) -> String {
        if let Some(serde_json::Value::String(s)) = self.result.get("content") {
            s.clone()
        } else {
            serde_json::to_string(&self.result).unwrap_or_default()
        }
    }
}

/// Internal: submission of tool results via channel, used by
/// [`ChatLoopHandle::submit_tool_results`].
#[derive(Debug)]
pub(crate) struct ToolResultSubmission {
    pub(crate) results: Vec<FunctionCallResult>,
}

// ============================================================================
// Helper: Tool Call Assembler
// ============================================================================

/// Assembles parallel function-call deltas from a streaming backend into
/// complete [`FunctionCall`]s.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: HashMap<String, PartialToolCall>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_delta(&mut self, id: String, name: Option<String>, arguments_delta: Option<String>) {
        if !self.calls.contains_key(&id) {
            self.order.push(id.clone());
        }
        let call = self.calls.entry(id.clone()).or_insert_with(|| PartialToolCall {
            id: id.clone(),
            name: None,
            arguments: String::new(),
        });

        if let Some(n) = name {
            call.name = Some(n);
        }
        if let Some(delta) = arguments_delta {
            call.arguments.push_str(&delta);
        }
    }

    pub fn into_tool_calls(self) -> Result<Vec<FunctionCall>, serde_json::Error> {
        let mut calls = self.calls;
        self.order
            .into_iter()
            .map(|id| {
                let partial = calls.remove(&id).expect("order tracks every inserted id");
                let arguments = if partial.arguments.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&partial.arguments)?
                };
                Ok(FunctionCall {
                    id: partial.id,
                    name: partial.name.unwrap_or_default(),
                    arguments,
                })
            })
            .collect()
    }
}

// ============================================================================
// Stream Chunk Types
// ============================================================================

#[derive(Debug, Clone)]
pub enum StreamChunk {
    Content(String),
    Done {
        finish_reason: FinishReason,
        usage: TokenUsage,
        full_content: String,
    },
    Thinking(String),
    ToolCallDelta {
        id: String,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    /// One or more fully-formed tool calls that completed mid-stream
    /// (spec §4.1: "when a tool-call completes in-stream, one
    /// fully-formed tool-call part").
    ToolCalls(Vec<FunctionCall>),
}

// ============================================================================
// Chat Loop Types
// ============================================================================

#[derive(Debug, Clone)]
pub enum LoopStep {
    Thinking(String),
    Content(String),
    ToolCallsRequested {
        tool_calls: Vec<FunctionCall>,
        content: String,
    },
    ToolResultsReceived {
        count: usize,
    },
    Done {
        content: String,
        finish_reason: FinishReason,
        total_usage: TokenUsage,
        all_tool_calls: Vec<FunctionCall>,
    },
}

/// Handle for bidirectional chat-loop communication: the gateway drives
/// the provider in a background task and hands the caller a pull-style
/// event stream plus a channel to submit tool results back into it.
pub struct ChatLoopHandle {
    events: Pin<Box<dyn Stream<Item = Result<LoopStep, ProviderError>> + Send>>,
    tool_result_tx: mpsc::UnboundedSender<ToolResultSubmission>,
}

impl ChatLoopHandle {
    pub(crate) fn new(
        event_rx: mpsc::UnboundedReceiver<Result<LoopStep, ProviderError>>,
        tool_result_tx: mpsc::UnboundedSender<ToolResultSubmission>,
    ) -> Self {
        Self {
            events: Box::pin(UnboundedReceiverStream::new(event_rx)),
            tool_result_tx,
        }
    }

    pub async fn next(&mut self) -> Option<Result<LoopStep, ProviderError>> {
        use futures::StreamExt;
        self.events.next().await
    }

    pub fn submit_tool_results(&self, results: Vec<FunctionCallResult>) -> Result<(), ProviderError> {
        self.tool_result_tx
            .send(ToolResultSubmission { results })
            .map_err(|_| ProviderError::ChatLoopClosed)?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.tool_result_tx.is_closed()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

// ============================================================================
// ChatResponse (spec §3: a bag of candidates, each a list of parts)
// ============================================================================

/// One atomic piece of a candidate: either text or a group of function
/// calls (spec glossary "Part").
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    FunctionCalls(Vec<FunctionCall>),
}

/// One of possibly several alternative responses from an LLM turn.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub parts: Vec<Part>,
}

impl Candidate {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::FunctionCalls(_) => None,
            })
            .collect()
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts
            .iter()
            .flat_map(|p| match p {
                Part::FunctionCalls(calls) => calls.clone(),
                Part::Text(_) => vec![],
            })
            .collect()
    }
}

/// A bag of candidates; this shape accommodates providers that multiplex
/// text and tool calls in a single turn (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub candidates: Vec<Candidate>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub fn first_candidate_text(&self) -> String {
        self.candidates.first().map(Candidate::text).unwrap_or_default()
    }
}

/// Stateless single-shot completion response (`GenerateCompletion`).
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Prompt caching not supported")]
    CachingNotSupported,

    #[error("Tool calling not supported")]
    ToolCallingNotSupported,

    #[error("Chat loop closed")]
    ChatLoopClosed,

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("wire-protocol error: {0}")]
    WireProtocol(String),

    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_status_codes() {
        for code in ["409", "425", "429", "500", "502", "503", "504"] {
            let err = ProviderError::ApiError(format!("HTTP {}: boom", code));
            assert!(default_is_retryable(&err), "{code} should be retryable");
        }
        let err = ProviderError::ApiError("HTTP 400: bad request".to_string());
        assert!(!default_is_retryable(&err));
    }

    #[test]
    fn timeout_is_always_retryable() {
        assert!(default_is_retryable(&ProviderError::Timeout));
    }

    #[test]
    fn tool_call_assembler_preserves_call_order() {
        let mut assembler = ToolCallAssembler::new();
        assembler.process_delta("b".into(), Some("second".into()), Some("{}".into()));
        assembler.process_delta("a".into(), Some("first".into()), Some("{}".into()));
        let calls = assembler.into_tool_calls().unwrap();
        assert_eq!(calls[0].name, "second");
        assert_eq!(calls[1].name, "first");
    }

    #[test]
    fn function_call_result_wraps_string_output() {
        let result = FunctionCallResult::from_text("call_1", "bash", "hello", false);
        assert_eq!(result.result["content"], json!("hello"));
        assert_eq!(result.result_text(), "hello");
    }
}
