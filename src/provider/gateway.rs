//! Object-safe wrapper around [`super::LLMProvider`].
//!
//! `LLMProvider::update_config` takes `impl FnOnce(&mut ProviderConfig)`,
//! which makes the trait itself non-object-safe — fine for concrete
//! backend structs, fatal for a registry that wants to hand back
//! `Box<dyn Client>` regardless of which backend answered. `ChatSession`
//! and `Client` are the object-safe contract callers actually use
//! (spec §4.1's `Chat`/`Client`); [`GatewayChat`]/[`GatewayClient`]
//! blanket-implement them for any concrete provider.
//!
//! `ChatSession::send` takes a `Vec<SendContent>` rather than a bare
//! `&str`, matching spec §4.1 literally: "each element is either a string
//! (user text), or a `FunctionCallResult` (tool observation)". Crucially,
//! `send` never executes tools itself — when the backend's `chat_loop`
//! yields `ToolCallsRequested`, the loop is parked in `active_loop` and
//! the function calls are handed back to the caller as part of the
//! `ChatResponse`. The caller (the Agent, §4.6) gates on permission and
//! runs the tool, then calls `send` again with the resulting
//! `FunctionCallResult`s, which resumes the parked loop instead of
//! starting a new one.

use super::{
    Candidate, ChatResponse, CompletionResponse, FinishReason, FunctionCallResult, FunctionDefinition,
    LLMProvider, LoopStep, Message, Part, ProviderError, Role, StreamChunk, TokenUsage,
};
use crate::schema::Schema;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

/// One element of a `Chat.Send(contents…)` call (spec §3/§4.1).
pub enum SendContent {
    Text(String),
    ToolResult(FunctionCallResult),
}

impl From<&str> for SendContent {
    fn from(s: &str) -> Self {
        SendContent::Text(s.to_string())
    }
}

impl From<String> for SendContent {
    fn from(s: String) -> Self {
        SendContent::Text(s)
    }
}

impl From<FunctionCallResult> for SendContent {
    fn from(r: FunctionCallResult) -> Self {
        SendContent::ToolResult(r)
    }
}

/// One ongoing conversation against a single backend (spec §4.1 `Chat`).
#[async_trait::async_trait]
pub trait ChatSession: Send + Sync {
    async fn send(&self, contents: Vec<SendContent>) -> Result<ChatResponse, ProviderError>;

    async fn send_streaming(
        &self,
        contents: Vec<SendContent>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError>;

    fn set_function_definitions(&self, defs: Vec<FunctionDefinition>);

    fn is_retryable_error(&self, err: &ProviderError) -> bool;

    fn history(&self) -> Vec<Message>;
}

/// Entry point into a backend: starts chats and runs stateless
/// completions (spec §4.1 `Client`).
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    fn start_chat(&self, system_prompt: Option<String>) -> Box<dyn ChatSession>;

    async fn generate_completion(&self, prompt: &str) -> Result<CompletionResponse, ProviderError>;

    fn set_response_schema(&self, schema: Option<Schema>) -> Result<(), ProviderError>;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// Adapts any [`LLMProvider`] into an object-safe [`Client`].
pub struct GatewayClient<P: LLMProvider + Clone + Send + Sync + 'static> {
    provider: Arc<P>,
}

impl<P: LLMProvider + Clone + Send + Sync + 'static> GatewayClient<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }
}

#[async_trait::async_trait]
impl<P: LLMProvider + Clone + Send + Sync + 'static> Client for GatewayClient<P> {
    fn start_chat(&self, system_prompt: Option<String>) -> Box<dyn ChatSession> {
        let mut history = Vec::new();
        if let Some(prompt) = system_prompt {
            // Backends that reject a system role (e.g. gemma-3-27b-it)
            // promote this to a leading user message inside their own
            // request builder (spec §4.1); the gateway always records a
            // plain system message and lets the adapter decide.
            history.push(Message::system(prompt));
        }
        Box::new(GatewayChat {
            provider: self.provider.clone(),
            history: Arc::new(RwLock::new(history)),
            tools: Arc::new(RwLock::new(None)),
            active_loop: Arc::new(Mutex::new(None)),
        })
    }

    async fn generate_completion(&self, prompt: &str) -> Result<CompletionResponse, ProviderError> {
        let mut stream = self.provider.chat(prompt).await?;
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Content(c) => text.push_str(&c),
                StreamChunk::Done { usage: u, .. } => usage = u,
                _ => {}
            }
        }
        Ok(CompletionResponse { text, usage })
    }

    fn set_response_schema(&self, schema: Option<Schema>) -> Result<(), ProviderError> {
        self.provider.set_response_schema(schema)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.provider.list_models().await
    }
}

/// Adapts an [`LLMProvider`]'s `chat_loop` machinery into an object-safe
/// [`ChatSession`]. A `chat_loop` round that asks for tool calls is
/// parked in `active_loop` rather than driven to completion here — the
/// caller owns permission gating and execution (spec §4.6), and resumes
/// the parked loop by calling `send` again with the resulting
/// `FunctionCallResult`s.
pub struct GatewayChat<P: LLMProvider + Clone + Send + Sync + 'static> {
    provider: Arc<P>,
    history: Arc<RwLock<Vec<Message>>>,
    tools: Arc<RwLock<Option<Vec<FunctionDefinition>>>>,
    active_loop: Arc<Mutex<Option<super::ChatLoopHandle>>>,
}

impl<P: LLMProvider + Clone + Send + Sync + 'static> GatewayChat<P> {
    fn push_history(&self, msg: Message) {
        if let Ok(mut h) = self.history.write() {
            h.push(msg);
        }
    }

    /// Drain `handle` until it yields a terminal event (`Done` or
    /// `ToolCallsRequested`), folding intermediate steps along the way.
    async fn drain(&self, handle: &mut super::ChatLoopHandle) -> Result<ChatResponse, ProviderError> {
        let mut response = ChatResponse::default();

        while let Some(step) = handle.next().await {
            match step? {
                LoopStep::Done {
                    content,
                    finish_reason,
                    total_usage,
                    all_tool_calls,
                } => {
                    self.push_history(Message {
                        role: Role::Assistant,
                        content: content.clone(),
                        tool_call_id: None,
                        function_calls: if all_tool_calls.is_empty() {
                            None
                        } else {
                            Some(all_tool_calls.clone())
                        },
                    });

                    let mut parts = Vec::new();
                    if !content.is_empty() {
                        parts.push(Part::Text(content));
                    }
                    if !all_tool_calls.is_empty() {
                        parts.push(Part::FunctionCalls(all_tool_calls));
                    }

                    response.candidates.push(Candidate { parts });
                    response.usage = total_usage;
                    response.finish_reason = finish_reason;
                    return Ok(response);
                }
                LoopStep::ToolCallsRequested { tool_calls, content } => {
                    self.push_history(Message {
                        role: Role::Assistant,
                        content: content.clone(),
                        tool_call_id: None,
                        function_calls: Some(tool_calls.clone()),
                    });

                    let mut parts = Vec::new();
                    if !content.is_empty() {
                        parts.push(Part::Text(content));
                    }
                    parts.push(Part::FunctionCalls(tool_calls));
                    response.candidates.push(Candidate { parts });
                    response.finish_reason = FinishReason::ToolCalls;
                    return Ok(response);
                }
                LoopStep::Content(_) | LoopStep::Thinking(_) | LoopStep::ToolResultsReceived { .. } => {
                    continue;
                }
            }
        }

        Err(ProviderError::WireProtocol(
            "provider chat loop ended without a Done or ToolCallsRequested event".to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl<P: LLMProvider + Clone + Send + Sync + 'static> ChatSession for GatewayChat<P> {
    async fn send(&self, contents: Vec<SendContent>) -> Result<ChatResponse, ProviderError> {
        let mut tool_results = Vec::new();
        for content in contents {
            match content {
                SendContent::Text(text) => self.push_history(Message::user(text)),
                SendContent::ToolResult(result) => {
                    self.push_history(Message::tool_result(&result));
                    tool_results.push(result);
                }
            }
        }

        // Resume a parked loop if one is awaiting tool results rather
        // than opening a fresh round trip.
        let parked = self.active_loop.lock().map(|mut g| g.take()).ok().flatten();
        if let Some(mut handle) = parked {
            if !tool_results.is_empty() {
                handle.submit_tool_results(tool_results)?;
            }
            let result = self.drain(&mut handle).await;
            self.repark_if_pending(&result, handle);
            return result;
        }

        crate::log("gateway: opening a new chat_loop round trip");
        let history = self.history.read().map(|h| h.clone()).unwrap_or_default();
        let tools = self.tools.read().map(|t| t.clone()).unwrap_or_default();
        let mut handle = self.provider.chat_loop(history, tools).await?;
        let result = self.drain(&mut handle).await;
        self.repark_if_pending(&result, handle);
        result
    }

    async fn send_streaming(
        &self,
        contents: Vec<SendContent>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
        // Same history/tools-driven round trip as `send` (spec §4.1's
        // equivalence requirement, §8): append the turn's contents,
        // resume a parked loop or open `chat_loop(history, tools)`, then
        // relay its `LoopStep`s as `StreamChunk`s. History is updated
        // exactly once, at end-of-stream, with the final combined
        // content plus any completed tool calls — not per chunk.
        let mut tool_results = Vec::new();
        for content in contents {
            match content {
                SendContent::Text(text) => self.push_history(Message::user(text)),
                SendContent::ToolResult(result) => {
                    self.push_history(Message::tool_result(&result));
                    tool_results.push(result);
                }
            }
        }

        let parked = self.active_loop.lock().map(|mut g| g.take()).ok().flatten();
        let mut handle = match parked {
            Some(handle) => {
                if !tool_results.is_empty() {
                    handle.submit_tool_results(tool_results)?;
                }
                handle
            }
            None => {
                let history = self.history.read().map(|h| h.clone()).unwrap_or_default();
                let tools = self.tools.read().map(|t| t.clone()).unwrap_or_default();
                self.provider.chat_loop(history, tools).await?
            }
        };

        let history = self.history.clone();
        let active_loop = self.active_loop.clone();

        let stream = async_stream::stream! {
            loop {
                match handle.next().await {
                    Some(Ok(LoopStep::Thinking(t))) => yield Ok(StreamChunk::Thinking(t)),
                    Some(Ok(LoopStep::Content(delta))) => yield Ok(StreamChunk::Content(delta)),
                    Some(Ok(LoopStep::ToolResultsReceived { .. })) => continue,
                    Some(Ok(LoopStep::ToolCallsRequested { tool_calls, content })) => {
                        if let Ok(mut h) = history.write() {
                            h.push(Message {
                                role: Role::Assistant,
                                content: content.clone(),
                                tool_call_id: None,
                                function_calls: Some(tool_calls.clone()),
                            });
                        }
                        yield Ok(StreamChunk::ToolCalls(tool_calls));
                        yield Ok(StreamChunk::Done {
                            finish_reason: FinishReason::ToolCalls,
                            usage: TokenUsage::default(),
                            full_content: content,
                        });
                        if let Ok(mut g) = active_loop.lock() {
                            *g = Some(handle);
                        }
                        return;
                    }
                    Some(Ok(LoopStep::Done { content, finish_reason, total_usage, all_tool_calls })) => {
                        if let Ok(mut h) = history.write() {
                            h.push(Message {
                                role: Role::Assistant,
                                content: content.clone(),
                                tool_call_id: None,
                                function_calls: if all_tool_calls.is_empty() { None } else { Some(all_tool_calls.clone()) },
                            });
                        }
                        if !all_tool_calls.is_empty() {
                            yield Ok(StreamChunk::ToolCalls(all_tool_calls));
                        }
                        yield Ok(StreamChunk::Done { finish_reason, usage: total_usage, full_content: content });
                        return;
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => return,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn set_function_definitions(&self, defs: Vec<FunctionDefinition>) {
        if let Ok(mut t) = self.tools.write() {
            *t = Some(defs);
        }
    }

    fn is_retryable_error(&self, err: &ProviderError) -> bool {
        self.provider.is_retryable_error(err)
    }

    fn history(&self) -> Vec<Message> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }
}

impl<P: LLMProvider + Clone + Send + Sync + 'static> GatewayChat<P> {
    fn repark_if_pending(&self, result: &Result<ChatResponse, ProviderError>, handle: super::ChatLoopHandle) {
        let still_pending = matches!(result, Ok(resp) if resp.finish_reason == FinishReason::ToolCalls);
        if still_pending {
            if let Ok(mut g) = self.active_loop.lock() {
                *g = Some(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_content_from_conversions() {
        match SendContent::from("hello") {
            SendContent::Text(t) => assert_eq!(t, "hello"),
            _ => panic!("expected text"),
        }
        let result = FunctionCallResult::from_text("id1", "kubectl", "ok", false);
        match SendContent::from(result) {
            SendContent::ToolResult(r) => assert_eq!(r.id, "id1"),
            _ => panic!("expected tool result"),
        }
    }
}
