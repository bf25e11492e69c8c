//! Ollama backend adapter.
//!
//! Ollama's `/api/chat` endpoint is OpenAI-Chat-Completions-*shaped* (a
//! `messages` array, an optional `tools` array, a `message.tool_calls`
//! field on the reply) but is its own wire dialect, not a passthrough —
//! unlike llama.cpp's `/v1/chat/completions`, it doesn't speak the OpenAI
//! envelope directly. Ollama also doesn't stream tool-call deltas the way
//! the hosted OpenAI API does, so this adapter requests `"stream": false`
//! and satisfies spec §4.1's streaming contract with a one-element
//! iterator wrapping the single response, exactly as the spec permits for
//! "backends that do not support native streaming".

use super::{
    ChatLoopHandle, FinishReason, FunctionCall, FunctionDefinition, LLMProvider, LoopStep, Message,
    ProviderConfig, ProviderError, ProviderState, Role, StreamChunk, ToolResultSubmission, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

fn default_host() -> String {
    std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    host: String,
    model: String,
    config: Arc<RwLock<ProviderConfig>>,
    state: Arc<RwLock<ProviderState>>,
    history: Arc<RwLock<Vec<Message>>>,
}

impl OllamaProvider {
    pub fn new(model: String) -> Result<Self, ProviderError> {
        Ok(Self {
            client: reqwest::Client::new(),
            host: default_host(),
            model,
            config: Arc::new(RwLock::new(ProviderConfig::default())),
            state: Arc::new(RwLock::new(ProviderState::default())),
            history: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn convert_message(msg: &Message) -> OllamaMessage {
        OllamaMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            }
            .to_string(),
            content: msg.content.clone(),
            tool_calls: msg.function_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| OllamaToolCall {
                        function: OllamaFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect()
            }),
        }
    }

    fn convert_tools(tools: &[FunctionDefinition]) -> Vec<OllamaTool> {
        tools
            .iter()
            .map(|t| OllamaTool {
                tool_type: "function".to_string(),
                function: OllamaFunctionSpec {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    // Ollama's tool schema is OpenAI-shaped: an `object`
                    // schema with no properties must still serialize the
                    // `properties` key (spec §3/§4.1).
                    parameters: t.parameters.to_json_normalized(),
                },
            })
            .collect()
    }

    async fn post_chat(
        &self,
        messages: &[OllamaMessage],
        tools: &Option<Vec<OllamaTool>>,
    ) -> Result<OllamaChatResponse, ProviderError> {
        let cfg = self.config();
        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
            tools: tools.clone(),
            options: OllamaOptions {
                temperature: cfg.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError(format!("HTTP {status}: {text}")));
        }

        response
            .json::<OllamaChatResponse>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("failed to parse Ollama response: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaFunctionCall {
    name: String,
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize, Clone)]
struct OllamaTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OllamaFunctionSpec,
}

#[derive(Debug, Serialize, Clone)]
struct OllamaFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
    options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    done: bool,
}

#[async_trait::async_trait]
impl LLMProvider for OllamaProvider {
    fn create(model: String, _api_key: String) -> Result<Self, ProviderError> {
        Self::new(model)
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
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }

        let response = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(vec![self.model.clone()]);
        }

        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("failed to parse tags: {e}")))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
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
    ) -> Result<Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
        let cfg = self.config();
        let mut messages = Vec::new();
        if let Some(system_prompt) = &cfg.system_prompt {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
                tool_calls: None,
            });
        }
        messages.push(OllamaMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
            tool_calls: None,
        });

        let response = self.post_chat(&messages, &None).await?;
        let usage = TokenUsage {
            input_tokens: response.prompt_eval_count,
            output_tokens: response.eval_count,
            cached_tokens: 0,
        };

        if let Ok(mut s) = self.state.write() {
            s.input_tokens += usage.input_tokens as u64;
            s.output_tokens += usage.output_tokens as u64;
            s.request_count += 1;
            s.last_request_time = Some(std::time::SystemTime::now());
        }

        let content = response.message.content.clone();
        // A non-streaming backend satisfies the streaming contract with a
        // one-element stream carrying Content then Done (spec §4.1).
        let stream = async_stream::stream! {
            yield Ok(StreamChunk::Content(content.clone()));
            yield Ok(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
                usage,
                full_content: content,
            });
        };
        Ok(Box::pin(stream))
    }

    async fn chat_loop(
        &self,
        history: Vec<Message>,
        tools: Option<Vec<FunctionDefinition>>,
    ) -> Result<ChatLoopHandle, ProviderError> {
        let (tool_result_tx, mut tool_result_rx) =
            tokio::sync::mpsc::unbounded_channel::<ToolResultSubmission>();
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel::<Result<LoopStep, ProviderError>>();

        let this = self.clone();
        let ollama_tools = tools.as_ref().map(|t| Self::convert_tools(t));
        let mut messages: Vec<OllamaMessage> = history.iter().map(Self::convert_message).collect();

        tokio::spawn(async move {
            loop {
                let response = match this.post_chat(&messages, &ollama_tools).await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx.send(Err(e));
                        return;
                    }
                };

                if let Ok(mut s) = this.state.write() {
                    s.input_tokens += response.prompt_eval_count as u64;
                    s.output_tokens += response.eval_count as u64;
                    s.request_count += 1;
                }

                let tool_calls: Vec<FunctionCall> = response
                    .message
                    .tool_calls
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(i, tc)| FunctionCall {
                        id: format!("ollama-call-{i}"),
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect();

                let usage = TokenUsage {
                    input_tokens: response.prompt_eval_count,
                    output_tokens: response.eval_count,
                    cached_tokens: 0,
                };

                if tool_calls.is_empty() {
                    let _ = event_tx.send(Ok(LoopStep::Done {
                        content: response.message.content,
                        finish_reason: FinishReason::Stop,
                        total_usage: usage,
                        all_tool_calls: vec![],
                    }));
                    return;
                }

                let _ = event_tx.send(Ok(LoopStep::ToolCallsRequested {
                    tool_calls: tool_calls.clone(),
                    content: response.message.content.clone(),
                }));

                messages.push(OllamaMessage {
                    role: "assistant".to_string(),
                    content: response.message.content,
                    tool_calls: Some(
                        tool_calls
                            .iter()
                            .map(|c| OllamaToolCall {
                                function: OllamaFunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.clone(),
                                },
                            })
                            .collect(),
                    ),
                });

                match tool_result_rx.recv().await {
                    Some(submission) => {
                        let count = submission.results.len();
                        for result in submission.results {
                            messages.push(OllamaMessage {
                                role: "tool".to_string(),
                                content: result.result_text(),
                                tool_calls: None,
                            });
                        }
                        let _ = event_tx.send(Ok(LoopStep::ToolResultsReceived { count }));
                    }
                    None => return,
                }
            }
        });

        Ok(ChatLoopHandle::new(event_rx, tool_result_tx))
    }

    fn prompt_cache(&mut self, _cache_prompt: String) -> Result<(), ProviderError> {
        Err(ProviderError::CachingNotSupported)
    }

    async fn compact(&self, history: Vec<Message>) -> Result<Vec<Message>, ProviderError> {
        Ok(history)
    }

    fn get_history(&self) -> Vec<Message> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_defaults_to_localhost() {
        std::env::remove_var("OLLAMA_HOST");
        assert_eq!(default_host(), "http://localhost:11434");
    }

    #[test]
    fn create_succeeds_without_api_key() {
        let provider = OllamaProvider::create("llama3".to_string(), String::new());
        assert!(provider.is_ok());
    }
}
