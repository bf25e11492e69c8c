//! OpenAI Chat Completions backend adapter, wired over reqwest + SSE.

use super::{
    ChatLoopHandle, FinishReason, FunctionCall, FunctionCallResult, FunctionDefinition, LLMProvider,
    LoopStep, Message, ProviderConfig, ProviderError, ProviderState, Role, StreamChunk,
    ToolCallAssembler, ToolResultSubmission, TokenUsage,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENAI_RESPONSES_API_BASE: &str = "https://api.openai.com/v1/responses";

#[derive(Clone)]
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    config: Arc<RwLock<ProviderConfig>>,
    state: Arc<RwLock<ProviderState>>,
    history: Arc<RwLock<Vec<Message>>>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role")]
enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAIToolCall>>,
    },
    #[serde(rename = "tool")]
    Tool { content: String, tool_call_id: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[allow(dead_code)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    #[allow(dead_code)]
    tool_type: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    #[allow(dead_code)]
    total_tokens: u32,
}

// Responses API types, used for /responses/compact.

#[derive(Debug, Serialize)]
struct ResponsesCompactRequest {
    model: String,
    input: Vec<ResponsesInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum ResponsesInput {
    Message(ResponsesMessage),
    CompactedItem(CompactedItem),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ResponsesMessage {
    role: String,
    content: ResponsesContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum ResponsesContent {
    Text(String),
    Parts(Vec<ResponsesContentPart>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum ResponsesContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
    #[serde(rename = "output_text")]
    OutputText { text: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CompactedItem {
    #[serde(rename = "type")]
    item_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesCompactResponse {
    output: Vec<ResponsesInput>,
}

impl OpenAIProvider {
    fn is_supported_model(model: &str) -> bool {
        model.starts_with("gpt-5") || model.starts_with("o1") || model.starts_with("gpt-4o")
    }

    /// Drop the oldest tool call/result turns beyond `max_turns`, where one
    /// turn is an assistant message carrying tool calls plus the tool
    /// result messages that answer it.
    fn prune_tool_turns(messages: &mut Vec<ChatMessage>, max_turns: usize) {
        if max_turns == 0 {
            return;
        }

        let mut tool_turn_ranges: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;

        while i < messages.len() {
            if let ChatMessage::Assistant {
                tool_calls: Some(_),
                ..
            } = &messages[i]
            {
                let start = i;
                i += 1;
                while i < messages.len() {
                    if matches!(&messages[i], ChatMessage::Tool { .. }) {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tool_turn_ranges.push((start, i));
            } else {
                i += 1;
            }
        }

        if tool_turn_ranges.len() > max_turns {
            let turns_to_remove = tool_turn_ranges.len() - max_turns;
            for &(start, end) in tool_turn_ranges.iter().take(turns_to_remove).rev() {
                messages.drain(start..end);
            }
        }
    }

    fn convert_to_responses_input(msg: &Message) -> ResponsesInput {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        ResponsesInput::Message(ResponsesMessage {
            role: role.to_string(),
            content: ResponsesContent::Text(msg.content.clone()),
        })
    }

    fn convert_from_responses_input(input: &ResponsesInput) -> Result<Message, ProviderError> {
        match input {
            ResponsesInput::Message(msg) => {
                let role = match msg.role.as_str() {
                    "system" => Role::System,
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    "tool" => Role::Tool,
                    other => {
                        return Err(ProviderError::ApiError(format!("unknown role: {other}")))
                    }
                };

                let content = match &msg.content {
                    ResponsesContent::Text(text) => text.clone(),
                    ResponsesContent::Parts(parts) => parts
                        .iter()
                        .filter_map(|part| match part {
                            ResponsesContentPart::InputText { text } => Some(text.as_str()),
                            ResponsesContentPart::OutputText { text } => Some(text.as_str()),
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                };

                Ok(Message {
                    role,
                    content,
                    tool_call_id: None,
                    function_calls: None,
                })
            }
            ResponsesInput::CompactedItem(_) => Err(ProviderError::ApiError(
                "cannot convert an opaque compacted item back to a message".to_string(),
            )),
        }
    }

    fn convert_message(msg: &Message) -> ChatMessage {
        match msg.role {
            Role::System => ChatMessage::System {
                content: msg.content.clone(),
            },
            Role::User => ChatMessage::User {
                content: msg.content.clone(),
            },
            Role::Assistant => {
                let tool_calls = msg.function_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| OpenAIToolCall {
                            id: tc.id.clone(),
                            tool_type: "function".to_string(),
                            function: OpenAIFunctionCall {
                                name: tc.name.clone(),
                                arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                            },
                        })
                        .collect()
                });

                ChatMessage::Assistant {
                    content: Some(msg.content.clone()),
                    tool_calls,
                }
            }
            Role::Tool => ChatMessage::Tool {
                content: msg.content.clone(),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            },
        }
    }

    fn convert_tools(tools: &[FunctionDefinition]) -> Vec<OpenAITool> {
        tools
            .iter()
            .map(|t| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    // OpenAI doesn't distinguish integer from number.
                    parameters: t.parameters.to_json_normalized(),
                },
            })
            .collect()
    }

    pub fn new(model: String, api_key: String) -> Result<Self, ProviderError> {
        if !Self::is_supported_model(&model) {
            return Err(ProviderError::ConfigError(format!(
                "model '{model}' not supported; only GPT-5+, o1, and gpt-4o family models are supported"
            )));
        }
        Ok(Self::new_unchecked(model, api_key, OPENAI_API_BASE.to_string()))
    }

    /// Builds a client for a wire-compatible Chat Completions endpoint
    /// other than OpenAI's own, e.g. an Azure OpenAI deployment or Grok's
    /// endpoint (spec.md §6 `AZURE_OPENAI_ENDPOINT`/`GROK_ENDPOINT`). The
    /// `gpt-5`/`o1`/`gpt-4o` allowlist is OpenAI's own model catalog and
    /// doesn't apply to another vendor's deployment/model names, so it's
    /// skipped for a non-default base URL.
    pub fn new_compatible(model: String, api_key: String, base_url: String) -> Result<Self, ProviderError> {
        Ok(Self::new_unchecked(model, api_key, base_url))
    }

    fn new_unchecked(model: String, api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
            config: Arc::new(RwLock::new(ProviderConfig::default())),
            state: Arc::new(RwLock::new(ProviderState::default())),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Overrides the base URL after construction, e.g. to point the plain
    /// `openai` scheme at a proxy (spec.md §6 `OPENAI_ENDPOINT`/
    /// `OPENAI_API_BASE`) while keeping the `gpt-5`/`o1`/`gpt-4o` model
    /// check from [`Self::new`].
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait::async_trait]
impl LLMProvider for OpenAIProvider {
    fn create(model: String, api_key: String) -> Result<Self, ProviderError> {
        Self::new(model, api_key)
    }

    fn state(&self) -> ProviderState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn config(&self) -> ProviderConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn update_config(&self, f: impl FnOnce(&mut ProviderConfig)) {
        if let Ok(mut config) = self.config.write() {
            f(&mut config);
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![
            "gpt-5".to_string(),
            "gpt-5-nano".to_string(),
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "o1".to_string(),
            "o1-mini".to_string(),
        ])
    }

    fn set_response_schema(&self, schema: Option<crate::schema::Schema>) -> Result<(), ProviderError> {
        if let Ok(mut cfg) = self.config.write() {
            cfg.response_schema = schema;
        }
        Ok(())
    }

    async fn chat(
        &self,
        prompt: &str,
    ) -> Result<
        Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send>>,
        ProviderError,
    > {
        let cfg = self.config();

        let mut messages = vec![];
        if let Some(system_prompt) = &cfg.system_prompt {
            messages.push(ChatMessage::System {
                content: system_prompt.clone(),
            });
        }
        messages.push(ChatMessage::User {
            content: prompt.to_string(),
        });

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(cfg.temperature),
            max_completion_tokens: Some(cfg.max_tokens),
            stream: true,
            stream_options: Some(StreamOptions { include_usage: true }),
            tools: None,
            response_format: cfg
                .response_schema
                .as_ref()
                .map(|s| response_format_json(s)),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError(format!("HTTP {status}: {error_text}")));
        }

        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream.eventsource();

        let state = self.state.clone();
        let mut full_content = String::new();

        let output_stream = async_stream::stream! {
            futures::pin_mut!(event_stream);

            while let Some(event_result) = event_stream.next().await {
                match event_result {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }

                        match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                            Ok(chunk) => {
                                if chunk.choices.is_empty() && chunk.usage.is_some() {
                                    let usage = chunk.usage.unwrap();
                                    let token_usage = TokenUsage {
                                        input_tokens: usage.prompt_tokens,
                                        output_tokens: usage.completion_tokens,
                                        cached_tokens: 0,
                                    };

                                    if let Ok(mut s) = state.write() {
                                        s.input_tokens += token_usage.input_tokens as u64;
                                        s.output_tokens += token_usage.output_tokens as u64;
                                        s.request_count += 1;
                                        s.last_request_time = Some(std::time::SystemTime::now());
                                    }

                                    yield Ok(StreamChunk::Done {
                                        finish_reason: FinishReason::Stop,
                                        usage: token_usage,
                                        full_content: full_content.clone(),
                                    });
                                    continue;
                                }

                                for choice in chunk.choices {
                                    if let Some(content) = choice.delta.content {
                                        full_content.push_str(&content);
                                        yield Ok(StreamChunk::Content(content));
                                    }
                                }
                            }
                            Err(e) => {
                                yield Err(ProviderError::ApiError(format!("failed to parse chunk: {e}")));
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(ProviderError::ApiError(format!("stream error: {e}")));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(output_stream))
    }

    async fn chat_loop(
        &self,
        history: Vec<Message>,
        tools: Option<Vec<FunctionDefinition>>,
    ) -> Result<ChatLoopHandle, ProviderError> {
        let (tool_result_tx, mut tool_result_rx) =
            tokio::sync::mpsc::unbounded_channel::<ToolResultSubmission>();
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel::<Result<LoopStep, ProviderError>>();

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let base_url = self.base_url.clone();
        let cfg = self.config();
        let state = self.state.clone();
        let provider_history = self.history.clone();

        let mut messages: Vec<ChatMessage> = history.iter().map(Self::convert_message).collect();
        let openai_tools = tools.as_ref().map(|t| Self::convert_tools(t));
        let response_format = cfg.response_schema.as_ref().map(response_format_json);
        let mut current_history = history.clone();

        tokio::spawn(async move {
            loop {
                let request = ChatCompletionRequest {
                    model: model.clone(),
                    messages: messages.clone(),
                    temperature: if openai_tools.is_some() { None } else { Some(cfg.temperature) },
                    max_completion_tokens: Some(cfg.max_tokens),
                    stream: true,
                    stream_options: Some(StreamOptions { include_usage: true }),
                    tools: openai_tools.clone(),
                    response_format: response_format.clone(),
                };

                let response = match client
                    .post(format!("{base_url}/chat/completions"))
                    .header("Authorization", format!("Bearer {api_key}"))
                    .header("Content-Type", "application/json")
                    .json(&request)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx.send(Err(ProviderError::ApiError(e.to_string())));
                        break;
                    }
                };

                if !response.status().is_success() {
                    let status = response.status();
                    let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
                    let _ = event_tx.send(Err(ProviderError::ApiError(format!("HTTP {status}: {error_text}"))));
                    break;
                }

                let byte_stream = response.bytes_stream();
                let event_stream = byte_stream.eventsource();

                let mut tool_call_assembler = ToolCallAssembler::new();
                let mut content_accumulator = String::new();
                let mut current_finish_reason = None;
                let mut tool_call_index_to_id: std::collections::HashMap<usize, String> =
                    std::collections::HashMap::new();
                let mut completed_tool_calls: Option<Vec<FunctionCall>> = None;

                futures::pin_mut!(event_stream);

                while let Some(event_result) = event_stream.next().await {
                    match event_result {
                        Ok(event) => {
                            if event.data == "[DONE]" {
                                break;
                            }

                            match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                                Ok(chunk) => {
                                    if chunk.choices.is_empty() && chunk.usage.is_some() {
                                        let usage = chunk.usage.unwrap();
                                        let token_usage = TokenUsage {
                                            input_tokens: usage.prompt_tokens,
                                            output_tokens: usage.completion_tokens,
                                            cached_tokens: 0,
                                        };

                                        if let Ok(mut s) = state.write() {
                                            s.input_tokens += token_usage.input_tokens as u64;
                                            s.output_tokens += token_usage.output_tokens as u64;
                                            s.request_count += 1;
                                            s.last_request_time = Some(std::time::SystemTime::now());
                                        }

                                        let tool_calls = std::mem::replace(&mut tool_call_assembler, ToolCallAssembler::new())
                                            .into_tool_calls()
                                            .unwrap_or_default();

                                        if !tool_calls.is_empty() {
                                            completed_tool_calls = Some(tool_calls.clone());
                                            let _ = event_tx.send(Ok(LoopStep::ToolCallsRequested {
                                                tool_calls,
                                                content: content_accumulator.clone(),
                                            }));
                                        } else {
                                            let _ = event_tx.send(Ok(LoopStep::Done {
                                                content: content_accumulator.clone(),
                                                finish_reason: FinishReason::Stop,
                                                total_usage: token_usage,
                                                all_tool_calls: vec![],
                                            }));
                                        }
                                        continue;
                                    }

                                    for choice in chunk.choices {
                                        if let Some(content) = choice.delta.content {
                                            content_accumulator.push_str(&content);
                                            let _ = event_tx.send(Ok(LoopStep::Content(content)));
                                        }

                                        if let Some(tool_calls) = choice.delta.tool_calls {
                                            for delta in tool_calls {
                                                if let Some(id) = &delta.id {
                                                    tool_call_index_to_id.insert(delta.index, id.clone());
                                                }
                                                if let Some(id) = tool_call_index_to_id.get(&delta.index) {
                                                    tool_call_assembler.process_delta(
                                                        id.clone(),
                                                        delta.function.as_ref().and_then(|f| f.name.clone()),
                                                        delta.function.as_ref().and_then(|f| f.arguments.clone()),
                                                    );
                                                }
                                            }
                                        }

                                        if let Some(finish_reason) = choice.finish_reason {
                                            current_finish_reason = Some(finish_reason);
                                        }
                                    }
                                }
                                Err(e) => {
                                    let _ = event_tx.send(Err(ProviderError::ApiError(format!("failed to parse chunk: {e}"))));
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = event_tx.send(Err(ProviderError::ApiError(format!("stream error: {e}"))));
                            return;
                        }
                    }
                }

                if current_finish_reason.as_deref() == Some("tool_calls") {
                    match tool_result_rx.recv().await {
                        Some(submission) => {
                            let tool_calls = completed_tool_calls.take().unwrap_or_default();

                            messages.push(ChatMessage::Assistant {
                                content: if content_accumulator.is_empty() {
                                    None
                                } else {
                                    Some(content_accumulator.clone())
                                },
                                tool_calls: Some(
                                    tool_calls
                                        .iter()
                                        .map(|tc| OpenAIToolCall {
                                            id: tc.id.clone(),
                                            tool_type: "function".to_string(),
                                            function: OpenAIFunctionCall {
                                                name: tc.name.clone(),
                                                arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                                            },
                                        })
                                        .collect(),
                                ),
                            });

                            current_history.push(Message {
                                role: Role::Assistant,
                                content: content_accumulator.clone(),
                                tool_call_id: None,
                                function_calls: Some(tool_calls.clone()),
                            });

                            let result_count = submission.results.len();
                            let _ = event_tx.send(Ok(LoopStep::ToolResultsReceived { count: result_count }));

                            for result in submission.results {
                                let text = result.result_text();
                                messages.push(ChatMessage::Tool {
                                    content: text.clone(),
                                    tool_call_id: result.id.clone(),
                                });

                                current_history.push(Message {
                                    role: Role::Tool,
                                    content: text,
                                    tool_call_id: Some(result.id),
                                    function_calls: None,
                                });
                            }

                            if let Some(max_turns) = cfg.max_tool_turns {
                                Self::prune_tool_turns(&mut messages, max_turns);
                            }

                            content_accumulator.clear();
                            tool_call_assembler = ToolCallAssembler::new();
                            tool_call_index_to_id.clear();
                            #[allow(unused_assignments)]
                            {
                                current_finish_reason = None;
                            }

                            continue;
                        }
                        None => break,
                    }
                } else {
                    break;
                }
            }

            if let Ok(mut hist) = provider_history.write() {
                *hist = current_history;
            }
        });

        Ok(ChatLoopHandle::new(event_rx, tool_result_tx))
    }

    fn prompt_cache(&mut self, _cache_prompt: String) -> Result<(), ProviderError> {
        Err(ProviderError::CachingNotSupported)
    }

    async fn compact(&self, history: Vec<Message>) -> Result<Vec<Message>, ProviderError> {
        let input: Vec<ResponsesInput> = history.iter().map(Self::convert_to_responses_input).collect();

        let cfg = self.config();
        let request = ResponsesCompactRequest {
            model: self.model.clone(),
            input,
            instructions: cfg.system_prompt.clone(),
        };

        let response = self
            .client
            .post(format!("{OPENAI_RESPONSES_API_BASE}/compact"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(format!("compact request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError(format!("compact API error HTTP {status}: {error_text}")));
        }

        let compact_response: ResponsesCompactResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("failed to parse compact response: {e}")))?;

        let mut compacted_history = Vec::new();
        for input in compact_response.output {
            if let Ok(msg) = Self::convert_from_responses_input(&input) {
                compacted_history.push(msg);
            }
        }

        Ok(compacted_history)
    }

    fn get_history(&self) -> Vec<Message> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }
}

fn response_format_json(schema: &crate::schema::Schema) -> serde_json::Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "schema": schema.to_json_normalized(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_models() {
        assert!(OpenAIProvider::is_supported_model("gpt-5-nano"));
        assert!(OpenAIProvider::is_supported_model("gpt-5-turbo"));
        assert!(OpenAIProvider::is_supported_model("gpt-5"));
        assert!(OpenAIProvider::is_supported_model("o1"));
        assert!(OpenAIProvider::is_supported_model("o1-preview"));
        assert!(OpenAIProvider::is_supported_model("gpt-4o"));
        assert!(OpenAIProvider::is_supported_model("gpt-4o-mini"));
    }

    #[test]
    fn unsupported_models() {
        assert!(!OpenAIProvider::is_supported_model("gpt-4"));
        assert!(!OpenAIProvider::is_supported_model("gpt-4-turbo"));
        assert!(!OpenAIProvider::is_supported_model("gpt-3.5-turbo"));
    }

    #[test]
    fn create_with_unsupported_model_fails() {
        let result = OpenAIProvider::new("gpt-3.5-turbo".to_string(), "test-key".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn create_with_supported_model_succeeds() {
        assert!(OpenAIProvider::new("gpt-4o".to_string(), "test-key".to_string()).is_ok());
    }

    #[test]
    fn prune_tool_turns_under_limit_is_noop() {
        let mut messages = vec![
            ChatMessage::User { content: "Hello".to_string() },
            ChatMessage::Assistant {
                content: Some("Calling tool".to_string()),
                tool_calls: Some(vec![OpenAIToolCall {
                    id: "call_1".to_string(),
                    tool_type: "function".to_string(),
                    function: OpenAIFunctionCall { name: "test".to_string(), arguments: "{}".to_string() },
                }]),
            },
            ChatMessage::Tool { content: "result".to_string(), tool_call_id: "call_1".to_string() },
        ];

        let original_len = messages.len();
        OpenAIProvider::prune_tool_turns(&mut messages, 3);
        assert_eq!(messages.len(), original_len);
    }

    #[test]
    fn prune_tool_turns_exceeding_limit_drops_oldest() {
        let mut messages = Vec::new();
        for n in 1..=4 {
            messages.push(ChatMessage::Assistant {
                content: Some(format!("Turn {n}")),
                tool_calls: Some(vec![OpenAIToolCall {
                    id: format!("call_{n}"),
                    tool_type: "function".to_string(),
                    function: OpenAIFunctionCall { name: "test".to_string(), arguments: "{}".to_string() },
                }]),
            });
            messages.push(ChatMessage::Tool {
                content: format!("result {n}"),
                tool_call_id: format!("call_{n}"),
            });
        }

        OpenAIProvider::prune_tool_turns(&mut messages, 3);

        assert_eq!(messages.len(), 6);
        if let ChatMessage::Assistant { content: Some(c), .. } = &messages[0] {
            assert_eq!(c, "Turn 2");
        } else {
            panic!("expected Turn 2 to survive pruning");
        }
    }

    #[test]
    fn get_history_starts_empty() {
        let provider = OpenAIProvider::new("gpt-4o".to_string(), "test-key".to_string()).unwrap();
        assert_eq!(provider.get_history().len(), 0);
    }
}
