//! The `kubectl` built-in tool (spec.md §4.3).

use async_trait::async_trait;

use crate::runner::interactive_refusal_reason;
use crate::safety::{self, Mutation};
use crate::schema::Schema;

use super::{Tool, ToolContext};

/// Runs an LLM-supplied `kubectl` command line through the shared
/// [`CommandRunner`](crate::runner::CommandRunner), gated by the
/// interactive-refusal and safety-classification rules (C6/C7).
#[derive(Debug, Clone, Default)]
pub struct KubectlTool;

impl KubectlTool {
    pub fn new() -> Self {
        Self
    }
}

fn command_argument(arguments: &serde_json::Value) -> &str {
    arguments.get("command").and_then(|v| v.as_str()).unwrap_or("")
}

#[async_trait]
impl Tool for KubectlTool {
    fn name(&self) -> &str {
        "kubectl"
    }

    fn description(&self) -> &str {
        "Executes a kubectl command against the configured cluster and returns its output."
    }

    fn parameters_schema(&self) -> Schema {
        Schema::object(
            [(
                "command".to_string(),
                Schema::string("The full kubectl command line to run, e.g. `kubectl get pods -n default`."),
            )]
            .into_iter()
            .collect(),
            vec!["command".to_string()],
        )
    }

    fn is_interactive(&self, arguments: &serde_json::Value) -> Option<String> {
        interactive_refusal_reason(command_argument(arguments))
    }

    fn classify_mutation(&self, arguments: &serde_json::Value) -> Mutation {
        safety::classify(command_argument(arguments))
    }

    async fn run(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        let command = command_argument(arguments);
        ctx.runner().run(command).await.to_json().as_object().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_definition_requires_command() {
        let tool = KubectlTool::new();
        let def = tool.function_definition();
        assert_eq!(def.name, "kubectl");
        assert!(def.parameters.to_json()["required"].as_array().unwrap().contains(&serde_json::json!("command")));
    }

    #[test]
    fn mutation_follows_static_classifier_not_declared_argument() {
        let tool = KubectlTool::new();
        let args = serde_json::json!({"command": "kubectl delete pod foo", "modifies_resource": "no"});
        assert_eq!(tool.classify_mutation(&args), Mutation::Yes);
    }

    #[test]
    fn edit_is_refused_before_execution() {
        let tool = KubectlTool::new();
        let args = serde_json::json!({"command": "kubectl edit deployment/nginx"});
        assert!(tool.is_interactive(&args).is_some());
    }

    #[tokio::test]
    async fn run_executes_the_command() {
        let tool = KubectlTool::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        // Stand in for a real cluster call: kubectl itself isn't present
        // in this environment, so assert only that the runner was invoked
        // and produced the expected shape of observation.
        let args = serde_json::json!({"command": "echo not-really-kubectl"});
        let result = tool.run(&ctx, &args).await;
        assert!(result.contains_key("stdout"));
        assert!(result.contains_key("exit_code"));
    }
}
