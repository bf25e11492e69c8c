//! User-defined tools loaded from YAML (spec.md §4.3/§6).
//!
//! Each record closes over a configured command prefix; the LLM supplies
//! only the remainder, not the whole command, following spec.md §9's
//! "custom tools as data not code" note — a `CustomTool` is a value, not
//! a trait impl a user has to write.

use async_trait::async_trait;
use serde::Deserialize;

use crate::safety::Mutation;
use crate::schema::Schema;

use super::{declared_mutation, Tool, ToolContext};

/// One entry of the YAML list described in spec.md §6: `[{name,
/// description, command, command_desc, is_interactive?}]`.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomToolRecord {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub command_desc: Option<String>,
    #[serde(default)]
    pub is_interactive: bool,
}

#[derive(Debug, Clone)]
pub struct CustomTool {
    record: CustomToolRecord,
}

impl CustomTool {
    pub fn from_record(record: CustomToolRecord) -> Self {
        Self { record }
    }

    /// Characters that would let the LLM-supplied argument escape the
    /// configured command prefix: pipes, redirects, background markers,
    /// or statement separators (spec.md §4.3).
    fn is_prefix_mangling(argument: &str) -> bool {
        argument.contains(['|', '>', '<', '&', ';'])
    }

    fn compose(&self, argument: &str) -> String {
        let trimmed_prefix = self.record.command.trim();
        if argument.trim_start().starts_with(trimmed_prefix) {
            argument.to_string()
        } else {
            format!("{trimmed_prefix} {argument}")
        }
    }
}

#[async_trait]
impl Tool for CustomTool {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn description(&self) -> &str {
        &self.record.description
    }

    fn parameters_schema(&self) -> Schema {
        let command_desc = self
            .record
            .command_desc
            .clone()
            .unwrap_or_else(|| format!("Arguments appended after `{}`.", self.record.command));
        Schema::object(
            [
                ("command".to_string(), Schema::string(command_desc)),
                (
                    "modifies_resource".to_string(),
                    Schema::string("Whether this call mutates cluster or host state: \"yes\", \"no\", or \"unknown\"."),
                ),
            ]
            .into_iter()
            .collect(),
            vec!["command".to_string()],
        )
    }

    fn is_interactive(&self, _arguments: &serde_json::Value) -> Option<String> {
        if self.record.is_interactive {
            Some(format!("'{}' is configured as interactive and cannot be run non-interactively", self.record.name))
        } else {
            None
        }
    }

    fn classify_mutation(&self, arguments: &serde_json::Value) -> Mutation {
        declared_mutation(arguments)
    }

    async fn run(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        let argument = arguments.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if Self::is_prefix_mangling(argument) {
            let mut map = serde_json::Map::new();
            map.insert(
                "error".to_string(),
                serde_json::Value::String(format!(
                    "argument '{argument}' contains a pipe, redirect, background marker, or statement separator and was rejected"
                )),
            );
            return map;
        }
        let full_command = self.compose(argument);
        ctx.runner().run(&full_command).await.to_json().as_object().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str) -> CustomToolRecord {
        CustomToolRecord {
            name: "get_logs".to_string(),
            description: "Fetches logs".to_string(),
            command: command.to_string(),
            command_desc: Some("Pod name".to_string()),
            is_interactive: false,
        }
    }

    #[test]
    fn composes_argument_after_prefix() {
        let tool = CustomTool::from_record(record("kubectl logs"));
        assert_eq!(tool.compose("mypod"), "kubectl logs mypod");
    }

    #[test]
    fn does_not_double_prefix_when_argument_already_starts_with_command() {
        let tool = CustomTool::from_record(record("kubectl logs"));
        assert_eq!(tool.compose("kubectl logs mypod"), "kubectl logs mypod");
    }

    #[tokio::test]
    async fn pipe_in_argument_is_rejected_without_executing() {
        let tool = CustomTool::from_record(record("kubectl logs"));
        let ctx = ToolContext::new(std::env::temp_dir());
        let args = serde_json::json!({"command": "mypod | rm -rf /"});
        let result = tool.run(&ctx, &args).await;
        assert!(result.contains_key("error"));
    }

    #[tokio::test]
    async fn interactive_record_is_refused() {
        let mut rec = record("kubectl logs");
        rec.is_interactive = true;
        let tool = CustomTool::from_record(rec);
        assert!(tool.is_interactive(&serde_json::json!({})).is_some());
    }

    #[test]
    fn declared_mutation_defaults_to_unknown() {
        let tool = CustomTool::from_record(record("kubectl logs"));
        assert_eq!(tool.classify_mutation(&serde_json::json!({})), Mutation::Unknown);
        assert_eq!(tool.classify_mutation(&serde_json::json!({"modifies_resource": "yes"})), Mutation::Yes);
    }

    #[test]
    fn deserializes_from_yaml_list() {
        let yaml = r#"
- name: get_logs
  description: Fetches logs
  command: kubectl logs
  command_desc: Pod name
- name: restart_deploy
  description: Restarts a deployment
  command: kubectl rollout restart
  is_interactive: false
"#;
        let records: Vec<CustomToolRecord> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "get_logs");
        assert!(records[1].command_desc.is_none());
    }
}
