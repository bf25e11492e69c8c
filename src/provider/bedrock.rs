//! Anthropic-on-Bedrock Converse backend adapter.
//!
//! Same Anthropic message/tool semantics as the Messages API (content
//! blocks, `tool_use`/`tool_result` blocks) but targets the Bedrock
//! Converse wire shape: `role`/`content` turns plus a top-level `toolConfig`, no
//! `x-api-key` header. AWS SigV4 request signing is explicitly out of
//! scope here (spec §1 excludes "provider-specific SDK wrappers beyond
//! the abstract contract"); it is modeled as a pluggable
//! `CredentialProvider` closure that returns the headers to attach to
//! each request, so a caller can plug in a real SigV4 signer (or a
//! Bedrock API key, as the newer `BEDROCK_API_KEY` bearer-auth mode
//! allows) without this adapter needing to know which.

use super::{
    ChatLoopHandle, FinishReason, FunctionCall, FunctionDefinition, LLMProvider, LoopStep, Message,
    ProviderConfig, ProviderError, ProviderState, Role, StreamChunk, ToolResultSubmission, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Resolves the headers (and, implicitly, the signature) attached to
/// every Converse request. Defaults to a bearer-token header built from
/// `BEDROCK_API_KEY`, matching Bedrock's API-key auth mode; a caller
/// targeting SigV4 IAM auth instead supplies their own signer here.
pub type CredentialProvider = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

fn default_credential_provider() -> CredentialProvider {
    Arc::new(|| {
        match std::env::var("BEDROCK_API_KEY") {
            Ok(key) if !key.is_empty() => vec![("Authorization".to_string(), format!("Bearer {key}"))],
            _ => vec![],
        }
    })
}

fn default_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("GOOGLE_CLOUD_REGION"))
        .unwrap_or_else(|_| "us-east-1".to_string())
}

#[derive(Clone)]
pub struct BedrockProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    credentials: CredentialProvider,
    config: Arc<RwLock<ProviderConfig>>,
    state: Arc<RwLock<ProviderState>>,
    history: Arc<RwLock<Vec<Message>>>,
}

impl BedrockProvider {
    pub fn new(model: String) -> Result<Self, ProviderError> {
        let model = if model.is_empty() {
            std::env::var("BEDROCK_MODEL")
                .map_err(|_| ProviderError::ConfigError("BEDROCK_MODEL must be set when no model is given".to_string()))?
        } else {
            model
        };
        let region = default_region();
        let endpoint = format!("https://bedrock-runtime.{region}.amazonaws.com");

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            model,
            credentials: default_credential_provider(),
            config: Arc::new(RwLock::new(ProviderConfig::default())),
            state: Arc::new(RwLock::new(ProviderState::default())),
            history: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn with_credential_provider(mut self, provider: CredentialProvider) -> Self {
        self.credentials = provider;
        self
    }

    fn convert_messages(history: &[Message]) -> (Vec<ConverseMessage>, Option<String>) {
        let mut messages = Vec::new();
        let mut system_prompt = None;

        for msg in history {
            match msg.role {
                Role::System => {
                    if system_prompt.is_none() {
                        system_prompt = Some(msg.content.clone());
                    }
                }
                Role::User => {
                    if msg.tool_call_id.is_none() {
                        messages.push(ConverseMessage {
                            role: "user".to_string(),
                            content: vec![ConverseBlock::Text { text: msg.content.clone() }],
                        });
                    }
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(ConverseBlock::Text { text: msg.content.clone() });
                    }
                    if let Some(calls) = &msg.function_calls {
                        for call in calls {
                            blocks.push(ConverseBlock::ToolUse {
                                tool_use: ConverseToolUse {
                                    tool_use_id: call.id.clone(),
                                    name: call.name.clone(),
                                    input: call.arguments.clone(),
                                },
                            });
                        }
                    }
                    if !blocks.is_empty() {
                        messages.push(ConverseMessage { role: "assistant".to_string(), content: blocks });
                    }
                }
                Role::Tool => {
                    if let Some(id) = &msg.tool_call_id {
                        messages.push(ConverseMessage {
                            role: "user".to_string(),
                            content: vec![ConverseBlock::ToolResult {
                                tool_result: ConverseToolResult {
                                    tool_use_id: id.clone(),
                                    content: vec![ConverseBlock::Text { text: msg.content.clone() }],
                                },
                            }],
                        });
                    }
                }
            }
        }

        (messages, system_prompt)
    }

    fn convert_tools(tools: &[FunctionDefinition]) -> ConverseToolConfig {
        ConverseToolConfig {
            tools: tools
                .iter()
                .map(|t| ConverseToolSpecWrapper {
                    tool_spec: ConverseToolSpec {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: ConverseSchemaWrapper { json: t.parameters.to_json() },
                    },
                })
                .collect(),
        }
    }

    async fn converse(
        &self,
        messages: &[ConverseMessage],
        system: &Option<String>,
        tools: &Option<ConverseToolConfig>,
    ) -> Result<ConverseResponse, ProviderError> {
        let cfg = self.config();
        let request = ConverseRequest {
            messages: messages.to_vec(),
            system: system.clone().map(|s| vec![ConverseBlock::Text { text: s }]),
            tool_config: tools.clone(),
            inference_config: ConverseInferenceConfig {
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
            },
        };

        let url = format!(
            "{}/model/{}/converse",
            self.endpoint,
            urlencoding_path_segment(&self.model)
        );

        let mut builder = self.client.post(url).json(&request);
        for (key, value) in (self.credentials)() {
            builder = builder.header(key, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError(format!("HTTP {status}: {text}")));
        }

        response
            .json::<ConverseResponse>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("failed to parse Converse response: {e}")))
    }
}

fn urlencoding_path_segment(s: &str) -> String {
    s.replace('/', "%2F").replace(':', "%3A")
}

#[derive(Debug, Serialize, Clone)]
struct ConverseMessage {
    role: String,
    content: Vec<ConverseBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum ConverseBlock {
    Text { text: String },
    ToolUse { #[serde(rename = "toolUse")] tool_use: ConverseToolUse },
    ToolResult { #[serde(rename = "toolResult")] tool_result: ConverseToolResult },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ConverseToolUse {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    name: String,
    input: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ConverseToolResult {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    content: Vec<ConverseBlock>,
}

#[derive(Debug, Serialize, Clone)]
struct ConverseToolConfig {
    tools: Vec<ConverseToolSpecWrapper>,
}

#[derive(Debug, Serialize, Clone)]
struct ConverseToolSpecWrapper {
    #[serde(rename = "toolSpec")]
    tool_spec: ConverseToolSpec,
}

#[derive(Debug, Serialize, Clone)]
struct ConverseToolSpec {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: ConverseSchemaWrapper,
}

#[derive(Debug, Serialize, Clone)]
struct ConverseSchemaWrapper {
    json: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ConverseInferenceConfig {
    temperature: f32,
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ConverseRequest {
    messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<ConverseBlock>>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    tool_config: Option<ConverseToolConfig>,
    #[serde(rename = "inferenceConfig")]
    inference_config: ConverseInferenceConfig,
}

#[derive(Debug, Deserialize)]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(rename = "stopReason")]
    stop_reason: String,
    #[serde(default)]
    usage: Option<ConverseUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ConverseResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ConverseResponseMessage {
    content: Vec<ConverseBlock>,
}

#[derive(Debug, Deserialize)]
struct ConverseUsage {
    #[serde(rename = "inputTokens", default)]
    input_tokens: u32,
    #[serde(rename = "outputTokens", default)]
    output_tokens: u32,
}

fn split_response(content: &[ConverseBlock]) -> (String, Vec<FunctionCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for (i, block) in content.iter().enumerate() {
        match block {
            ConverseBlock::Text { text: t } => text.push_str(t),
            ConverseBlock::ToolUse { tool_use } => calls.push(FunctionCall {
                id: if tool_use.tool_use_id.is_empty() {
                    format!("bedrock-call-{i}")
                } else {
                    tool_use.tool_use_id.clone()
                },
                name: tool_use.name.clone(),
                arguments: tool_use.input.clone(),
            }),
            ConverseBlock::ToolResult { .. } => {}
        }
    }
    (text, calls)
}

#[async_trait::async_trait]
impl LLMProvider for BedrockProvider {
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
        Ok(vec![
            "anthropic.claude-sonnet-4-5-20250929-v1:0".to_string(),
            "anthropic.claude-opus-4-5-20251101-v1:0".to_string(),
            "anthropic.claude-3-5-haiku-20241022-v1:0".to_string(),
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
    ) -> Result<Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
        let cfg = self.config();
        let messages = vec![ConverseMessage {
            role: "user".to_string(),
            content: vec![ConverseBlock::Text { text: prompt.to_string() }],
        }];

        let response = self.converse(&messages, &cfg.system_prompt, &None).await?;
        let (text, _) = split_response(&response.output.message.content);
        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cached_tokens: 0,
            })
            .unwrap_or_default();

        if let Ok(mut s) = self.state.write() {
            s.input_tokens += usage.input_tokens as u64;
            s.output_tokens += usage.output_tokens as u64;
            s.request_count += 1;
        }

        let stream = async_stream::stream! {
            yield Ok(StreamChunk::Content(text.clone()));
            yield Ok(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
                usage,
                full_content: text,
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
        let tool_config = tools.as_ref().map(|t| Self::convert_tools(t));
        let (mut messages, system_prompt) = Self::convert_messages(&history);

        tokio::spawn(async move {
            loop {
                let response = match this.converse(&messages, &system_prompt, &tool_config).await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx.send(Err(e));
                        return;
                    }
                };

                let usage = response
                    .usage
                    .as_ref()
                    .map(|u| TokenUsage {
                        input_tokens: u.input_tokens,
                        output_tokens: u.output_tokens,
                        cached_tokens: 0,
                    })
                    .unwrap_or_default();

                if let Ok(mut s) = this.state.write() {
                    s.input_tokens += usage.input_tokens as u64;
                    s.output_tokens += usage.output_tokens as u64;
                    s.request_count += 1;
                }

                let (text, tool_calls) = split_response(&response.output.message.content);

                if response.stop_reason != "tool_use" || tool_calls.is_empty() {
                    let _ = event_tx.send(Ok(LoopStep::Done {
                        content: text,
                        finish_reason: FinishReason::Stop,
                        total_usage: usage,
                        all_tool_calls: vec![],
                    }));
                    return;
                }

                let _ = event_tx.send(Ok(LoopStep::ToolCallsRequested {
                    tool_calls: tool_calls.clone(),
                    content: text.clone(),
                }));

                let mut assistant_blocks = Vec::new();
                if !text.is_empty() {
                    assistant_blocks.push(ConverseBlock::Text { text: text.clone() });
                }
                for call in &tool_calls {
                    assistant_blocks.push(ConverseBlock::ToolUse {
                        tool_use: ConverseToolUse {
                            tool_use_id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        },
                    });
                }
                messages.push(ConverseMessage { role: "assistant".to_string(), content: assistant_blocks });

                match tool_result_rx.recv().await {
                    Some(submission) => {
                        let count = submission.results.len();
                        let mut result_blocks = Vec::new();
                        for result in submission.results {
                            result_blocks.push(ConverseBlock::ToolResult {
                                tool_result: ConverseToolResult {
                                    tool_use_id: result.id.clone(),
                                    content: vec![ConverseBlock::Text { text: result.result_text() }],
                                },
                            });
                        }
                        messages.push(ConverseMessage { role: "user".to_string(), content: result_blocks });
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
    fn default_credential_provider_is_empty_without_api_key() {
        std::env::remove_var("BEDROCK_API_KEY");
        let provider = default_credential_provider();
        assert!(provider().is_empty());
    }

    #[test]
    fn default_credential_provider_sets_bearer_header() {
        std::env::set_var("BEDROCK_API_KEY", "secret-token");
        let provider = default_credential_provider();
        let headers = provider();
        std::env::remove_var("BEDROCK_API_KEY");
        assert_eq!(headers, vec![("Authorization".to_string(), "Bearer secret-token".to_string())]);
    }

    #[test]
    fn model_path_segment_is_escaped() {
        assert_eq!(
            urlencoding_path_segment("anthropic.claude-3:0"),
            "anthropic.claude-3%3A0"
        );
    }

    #[test]
    fn split_response_separates_text_and_tool_calls() {
        let blocks = vec![
            ConverseBlock::Text { text: "checking".to_string() },
            ConverseBlock::ToolUse {
                tool_use: ConverseToolUse {
                    tool_use_id: "call_1".to_string(),
                    name: "kubectl".to_string(),
                    input: serde_json::json!({"command": "kubectl get pods"}),
                },
            },
        ];
        let (text, calls) = split_response(&blocks);
        assert_eq!(text, "checking");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "kubectl");
    }
}
