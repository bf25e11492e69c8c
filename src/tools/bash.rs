//! The `bash` built-in tool (spec.md §4.3).
//!
//! Generalizes the teacher's original `BashTool` (its own `spawn` +
//! `tokio::time::timeout` + reader-task plumbing) onto the shared
//! [`CommandRunner`](crate::runner::CommandRunner) so it picks up the
//! same `work_dir`/`kubeconfig` execution context and interactive/
//! streaming rules as `kubectl`, instead of running in the process's own
//! cwd with its own bespoke spawn logic.

use async_trait::async_trait;

use crate::safety::{self, Mutation};
use crate::schema::Schema;

use super::{Tool, ToolContext};

#[derive(Debug, Clone)]
pub struct BashTool {
    description: String,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            description: shell_description(),
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

fn command_argument(arguments: &serde_json::Value) -> &str {
    arguments.get("command").and_then(|v| v.as_str()).unwrap_or("")
}

fn shell_description() -> String {
    let os = std::env::consts::OS;
    let (shell_name, rules, examples) = match os {
        "windows" => (
            "cmd.exe",
            "On Windows, you MUST generate commands runnable under %COMSPEC% /c. \
             DO NOT use bash syntax or Unix utilities (ls, grep, awk, sed, cat, rm, etc.).",
            r#"Examples:
    - List files: dir
    - Read file: type file.txt
    - Search text: findstr foo file.txt"#,
        ),
        _ => (
            "bash",
            "On Linux/macOS, you MUST generate bash-compatible shell commands.",
            r#"Examples:
    - List files: ls
    - Read file: cat file.txt
    - Search text: grep foo file.txt"#,
        ),
    };
    format!(
        "Execute a shell command and return its output.\n\
         {rules}\n\
         Current OS: {os}\n\
         Shell: {shell_name}\n\
         {examples}"
    )
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Schema {
        Schema::object(
            [("command".to_string(), Schema::string("The shell command to execute."))]
                .into_iter()
                .collect(),
            vec!["command".to_string()],
        )
    }

    fn is_interactive(&self, arguments: &serde_json::Value) -> Option<String> {
        crate::runner::interactive_refusal_reason(command_argument(arguments))
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

    #[tokio::test]
    async fn simple_command_succeeds() {
        let tool = BashTool::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        let args = serde_json::json!({"command": "echo hello"});
        let result = tool.run(&ctx, &args).await;
        assert_eq!(result["exit_code"], serde_json::json!(0));
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let tool = BashTool::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        let args = serde_json::json!({"command": "exit 7"});
        let result = tool.run(&ctx, &args).await;
        assert_eq!(result["exit_code"], serde_json::json!(7));
    }

    #[test]
    fn function_definition_has_command_property() {
        let tool = BashTool::new();
        let def = tool.function_definition();
        assert_eq!(def.name, "bash");
        assert!(def.description.contains("Execute"));
    }

    #[test]
    fn mutation_defaults_to_unknown_for_non_kubectl_commands() {
        let tool = BashTool::new();
        let args = serde_json::json!({"command": "rm -rf /tmp/scratch"});
        assert_eq!(tool.classify_mutation(&args), Mutation::Unknown);
    }
}
