//! Tool-Use Shim for models without native function calling (C9,
//! spec.md §4.7).
//!
//! Grounded on [`super::provider::ToolCallAssembler`]'s "accumulate
//! partial structured data, then parse" shape: there, streaming deltas
//! accumulate into a JSON string before one `serde_json::from_str` call;
//! here, free-form model text is scanned for a single fenced ```` ```json
//! ```` block before the same kind of one-shot parse.

use serde::{Deserialize, Serialize};

use crate::provider::registry::ProviderScheme;
use crate::provider::FunctionCall;

/// One parsed turn from a shim-driven model: either a tool call to make
/// next, or a final answer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ReActResponse {
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub action: Option<ReActAction>,
    #[serde(default)]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReActAction {
    pub name: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub input: String,
}

impl ReActResponse {
    pub fn is_final(&self) -> bool {
        self.action.is_none()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ShimError {
    #[error("no ```json fenced block found in model output")]
    NoJsonFence,
    #[error("failed to parse ReAct response JSON: {0}")]
    Json(#[from] serde_json::Error),
}

const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// Extracts the contents of the first ` ```json ` fence to the next
/// ` ``` ` (spec.md §4.7 step 2).
pub fn extract_json_fence(text: &str) -> Option<&str> {
    let start = text.find(FENCE_OPEN)? + FENCE_OPEN.len();
    let rest = &text[start..];
    let end = rest.find(FENCE_CLOSE)?;
    Some(rest[..end].trim())
}

/// Extracts and parses a [`ReActResponse`] from raw model output. Parse
/// failures are distinguishable from "no fence at all" so the caller can
/// choose what observation to feed back (spec.md §4.7 step 3).
pub fn parse_react_response(text: &str) -> Result<ReActResponse, ShimError> {
    let fenced = extract_json_fence(text).ok_or(ShimError::NoJsonFence)?;
    Ok(serde_json::from_str(fenced)?)
}

/// Maps a parsed action to a synthetic [`FunctionCall`] the agent loop
/// can dispatch exactly like a native tool call (spec.md §4.7 step 4):
/// `{command: action.input, modifies_resource: "unknown"}`.
pub fn synthesize_function_call(action: &ReActAction) -> FunctionCall {
    FunctionCall {
        id: uuid::Uuid::new_v4().to_string(),
        name: action.name.clone(),
        arguments: serde_json::json!({
            "command": action.input,
            "modifies_resource": "unknown",
        }),
    }
}

const DEFAULT_TEMPLATE: &str = r#"You are a Kubernetes assistant. You must respond with exactly one fenced ```json code block and nothing else.

Available tools: {{tools}}

Reply in this shape:
```json
{"thought": "...", "action": {"name": "<tool>", "input": "<argument>"}}
```
or, once you have a final answer:
```json
{"thought": "...", "answer": "<final answer text>"}
```

Recent observations:
{{observations}}

User query: {{query}}
"#;

/// Extra formatting emphasis some Bedrock/Anthropic dialects need to
/// reliably stick to the fenced-JSON contract (spec.md §4.7, last
/// paragraph).
const STRICT_JSON_DIRECTIVE: &str =
    "\n\nRespond with exactly one ```json fenced code block and no other text before or after it.";

/// Renders the shim's system/user prompt (spec.md §4.7 step 1), with an
/// override path for `prompt-template-file-path` (spec.md §6).
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self {
            template: std::fs::read_to_string(path)?,
        })
    }

    pub fn render(&self, query: &str, observations: &[String], tool_names: &[&str]) -> String {
        let observations_block = if observations.is_empty() {
            "(none yet)".to_string()
        } else {
            observations.join("\n")
        };
        self.template
            .replace("{{query}}", query)
            .replace("{{observations}}", &observations_block)
            .replace("{{tools}}", &tool_names.join(", "))
    }

    /// Appends the stricter directive for dialects that need it (spec.md
    /// §4.7: "the shim injects them when it detects the shim format is
    /// in use").
    pub fn with_strict_json_directive_for(mut self, scheme: ProviderScheme) -> Self {
        if matches!(scheme, ProviderScheme::Bedrock) {
            self.template.push_str(STRICT_JSON_DIRECTIVE);
        }
        self
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fence_contents() {
        let text = "some preamble\n```json\n{\"answer\": \"done\"}\n```\ntrailing";
        assert_eq!(extract_json_fence(text), Some("{\"answer\": \"done\"}"));
    }

    #[test]
    fn missing_fence_is_none() {
        assert_eq!(extract_json_fence("no fence here"), None);
    }

    #[test]
    fn parses_action_response() {
        let text = "```json\n{\"thought\": \"need pods\", \"action\": {\"name\": \"kubectl\", \"input\": \"get pods\"}}\n```";
        let parsed = parse_react_response(text).unwrap();
        assert!(!parsed.is_final());
        let action = parsed.action.unwrap();
        assert_eq!(action.name, "kubectl");
        assert_eq!(action.input, "get pods");
    }

    #[test]
    fn parses_final_answer() {
        let text = "```json\n{\"answer\": \"3 pods running\"}\n```";
        let parsed = parse_react_response(text).unwrap();
        assert!(parsed.is_final());
        assert_eq!(parsed.answer.as_deref(), Some("3 pods running"));
    }

    #[test]
    fn malformed_json_is_a_distinct_error() {
        let text = "```json\n{not json\n```";
        assert!(matches!(parse_react_response(text), Err(ShimError::Json(_))));
    }

    #[test]
    fn no_fence_is_a_distinct_error() {
        assert!(matches!(parse_react_response("just text"), Err(ShimError::NoJsonFence)));
    }

    #[test]
    fn synthesizes_command_argument_with_unknown_mutation() {
        let action = ReActAction {
            name: "kubectl".to_string(),
            reason: Some("need pod list".to_string()),
            input: "get pods".to_string(),
        };
        let call = synthesize_function_call(&action);
        assert_eq!(call.name, "kubectl");
        assert_eq!(call.arguments["command"], serde_json::json!("get pods"));
        assert_eq!(call.arguments["modifies_resource"], serde_json::json!("unknown"));
    }

    #[test]
    fn render_substitutes_placeholders() {
        let template = PromptTemplate::default();
        let rendered = template.render("list pods", &["kubectl get pods -> 3 pods".to_string()], &["kubectl", "bash"]);
        assert!(rendered.contains("list pods"));
        assert!(rendered.contains("kubectl get pods -> 3 pods"));
        assert!(rendered.contains("kubectl, bash"));
    }

    #[test]
    fn bedrock_gets_strict_directive_others_do_not() {
        let bedrock = PromptTemplate::default().with_strict_json_directive_for(ProviderScheme::Bedrock);
        let openai = PromptTemplate::default().with_strict_json_directive_for(ProviderScheme::OpenAI);
        assert!(bedrock.render("q", &[], &[]).contains("exactly one"));
        assert!(!openai.render("q", &[], &[]).ends_with("and no other text before or after it.\n"));
    }
}
