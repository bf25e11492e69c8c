//! llama.cpp backend adapter.
//!
//! `llama.cpp`'s `server` binary exposes an OpenAI-compatible
//! `/v1/chat/completions` endpoint, so this adapter is a thin
//! specialization of the OpenAI wire format targeting a locally-resolved
//! base URL with no API key requirement (spec §4.1's SPEC_FULL
//! expansion). It has no stable streaming tool-call ids, so like
//! [`super::ollama`] it requests `"stream": false` and folds into the
//! one-element-stream fallback path spec §4.1 documents for backends
//! without native streaming.

use super::{
    ChatLoopHandle, FinishReason, FunctionCall, FunctionDefinition, LLMProvider, LoopStep, Message,
    ProviderConfig, ProviderError, ProviderState, Role, StreamChunk, ToolResultSubmission, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

fn default_host() -> String {
    std::env::var("LLAMACPP_HOST").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Clone)]
pub struct LlamaCppProvider {
    client: reqwest::Client,
    host: String,
    model: String,
    config: Arc<RwLock<ProviderConfig>>,
    state: Arc<RwLock<ProviderState>>,
    history: Arc<RwLock<Vec<Message>>>,
}

impl LlamaCppProvider {
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

    fn convert_message(msg: &Message) -> LcppMessage {
        LcppMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            }
            .to_string(),
            content: Some(msg.content.clone()),
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls: msg.function_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| LcppToolCall {
                        id: c.id.clone(),
                        tool_type: "function".to_string(),
                        function: LcppFunctionCall {
                            name: c.name.clone(),
                            arguments: serde_json::to_string(&c.arguments).unwrap_or_default(),
                        },
                    })
                    .collect()
            }),
        }
    }

    fn convert_tools(tools: &[FunctionDefinition]) -> Vec<LcppTool> {
        tools
            .iter()
            .map(|t| LcppTool {
                tool_type: "function".to_string(),
                function: LcppFunctionSpec {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.to_json_normalized(),
                },
            })
            .collect()
    }

    async fn post_completion(
        &self,
        messages: &[LcppMessage],
        tools: &Option<Vec<LcppTool>>,
    ) -> Result<LcppResponse, ProviderError> {
        let cfg = self.config();
        let request = LcppRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
            temperature: cfg.temperature,
            tools: tools.clone(),
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.host))
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
            .json::<LcppResponse>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("failed to parse llama.cpp response: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct LcppMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<LcppToolCall>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct LcppToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: LcppFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct LcppFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Clone)]
struct LcppTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: LcppFunctionSpec,
}

#[derive(Debug, Serialize, Clone)]
struct LcppFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct LcppRequest {
    model: String,
    messages: Vec<LcppMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<LcppTool>>,
}

#[derive(Debug, Deserialize)]
struct LcppResponse {
    choices: Vec<LcppChoice>,
    #[serde(default)]
    usage: Option<LcppUsage>,
}

#[derive(Debug, Deserialize)]
struct LcppChoice {
    message: LcppMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LcppUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait::async_trait]
impl LLMProvider for LlamaCppProvider {
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
        // llama.cpp serves a single model per process; there is no
        // enumeration endpoint worth calling.
        Ok(vec![self.model.clone()])
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
            messages.push(LcppMessage {
                role: "system".to_string(),
                content: Some(system_prompt.clone()),
                tool_call_id: None,
                tool_calls: None,
            });
        }
        messages.push(LcppMessage {
            role: "user".to_string(),
            content: Some(prompt.to_string()),
            tool_call_id: None,
            tool_calls: None,
        });

        let response = self.post_completion(&messages, &None).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::WireProtocol("llama.cpp response has no choices".to_string()))?;
        let content = choice.message.content.unwrap_or_default();
        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                cached_tokens: 0,
            })
            .unwrap_or_default();

        if let Ok(mut s) = self.state.write() {
            s.input_tokens += usage.input_tokens as u64;
            s.output_tokens += usage.output_tokens as u64;
            s.request_count += 1;
        }

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
        let lcpp_tools = tools.as_ref().map(|t| Self::convert_tools(t));
        let mut messages: Vec<LcppMessage> = history.iter().map(Self::convert_message).collect();

        tokio::spawn(async move {
            loop {
                let response = match this.post_completion(&messages, &lcpp_tools).await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx.send(Err(e));
                        return;
                    }
                };

                let usage = response
                    .usage
                    .map(|u| TokenUsage {
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                        cached_tokens: 0,
                    })
                    .unwrap_or_default();

                if let Ok(mut s) = this.state.write() {
                    s.input_tokens += usage.input_tokens as u64;
                    s.output_tokens += usage.output_tokens as u64;
                    s.request_count += 1;
                }

                let choice = match response.choices.into_iter().next() {
                    Some(c) => c,
                    None => {
                        let _ = event_tx.send(Err(ProviderError::WireProtocol(
                            "llama.cpp response has no choices".to_string(),
                        )));
                        return;
                    }
                };

                let content = choice.message.content.clone().unwrap_or_default();
                let tool_calls: Vec<FunctionCall> = choice
                    .message
                    .tool_calls
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tc| FunctionCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::Value::Null),
                    })
                    .collect();

                if tool_calls.is_empty() || choice.finish_reason.as_deref() != Some("tool_calls") {
                    let _ = event_tx.send(Ok(LoopStep::Done {
                        content,
                        finish_reason: FinishReason::Stop,
                        total_usage: usage,
                        all_tool_calls: vec![],
                    }));
                    return;
                }

                let _ = event_tx.send(Ok(LoopStep::ToolCallsRequested {
                    tool_calls: tool_calls.clone(),
                    content: content.clone(),
                }));

                messages.push(LcppMessage {
                    role: "assistant".to_string(),
                    content: if content.is_empty() { None } else { Some(content) },
                    tool_call_id: None,
                    tool_calls: Some(
                        tool_calls
                            .iter()
                            .map(|c| LcppToolCall {
                                id: c.id.clone(),
                                tool_type: "function".to_string(),
                                function: LcppFunctionCall {
                                    name: c.name.clone(),
                                    arguments: serde_json::to_string(&c.arguments).unwrap_or_default(),
                                },
                            })
                            .collect(),
                    ),
                });

                match tool_result_rx.recv().await {
                    Some(submission) => {
                        let count = submission.results.len();
                        for result in submission.results {
                            messages.push(LcppMessage {
                                role: "tool".to_string(),
                                content: Some(result.result_text()),
                                tool_call_id: Some(result.id),
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
        std::env::remove_var("LLAMACPP_HOST");
        assert_eq!(default_host(), "http://localhost:8080");
    }

    #[test]
    fn list_models_returns_configured_model_only() {
        let provider = LlamaCppProvider::new("local-model".to_string()).unwrap();
        let models = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(provider.list_models())
            .unwrap();
        assert_eq!(models, vec!["local-model".to_string()]);
    }
}
