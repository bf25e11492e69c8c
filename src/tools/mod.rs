//! Tool trait and process-wide registry (spec.md §4.3, C5).
//!
//! Generalizes the teacher's `ToolRegistry`/`ToolProvider` split
//! (`llm/registry.rs`) from "an LLM-facing `Tool` description plus a
//! closure-ish `execute`" into a trait whose `run` talks the gateway's
//! `FunctionCall`/`FunctionCallResult` wire types directly, and whose
//! mutation classification is part of the trait contract rather than
//! bolted on by the caller.

pub mod bash;
pub mod custom;
pub mod kubectl;
pub mod trivy;

pub use bash::BashTool;
pub use custom::CustomTool;
pub use kubectl::KubectlTool;
pub use trivy::TrivyTool;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::{FunctionCall, FunctionCallResult, FunctionDefinition};
use crate::runner::CommandRunner;
use crate::safety::Mutation;

/// Per-invocation execution context (spec.md §4.3: "work_dir and
/// kubeconfig via the context"). The work directory is a fresh temp
/// directory per agent run; `kubeconfig` is the resolved path precedence
/// chain from spec.md §6 (flag > `KUBECONFIG` env > `~/.kube/config`).
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub work_dir: PathBuf,
    pub kubeconfig: Option<PathBuf>,
}

impl ToolContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Builds a [`CommandRunner`] scoped to this context's work directory
    /// and kubeconfig.
    pub fn runner(&self) -> CommandRunner {
        let runner = CommandRunner::new().with_working_dir(&self.work_dir);
        match &self.kubeconfig {
            Some(path) => runner.with_kubeconfig(path),
            None => runner,
        }
    }
}

/// A registered effector: something the agent can invoke with LLM-chosen
/// arguments. Mirrors spec.md §4.3's `{name, description, FunctionDefinition,
/// Run(ctx, arguments), IsInteractive(arguments)}`, plus a mutation
/// classification hook used by the permission gate (§4.6).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> crate::schema::Schema;

    fn function_definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }

    /// `Some(reason)` refuses the call before it is ever spawned (e.g.
    /// `kubectl exec -it`). Checked before mutation classification.
    fn is_interactive(&self, arguments: &serde_json::Value) -> Option<String>;

    /// Whether running `arguments` mutates cluster/host state. `kubectl`
    /// and `bash` ignore any LLM-declared `modifies_resource` argument and
    /// classify the actual command statically (C6); custom tools trust
    /// the LLM's declaration, defaulting to `Unknown` (spec.md §4.5's
    /// last paragraph).
    fn classify_mutation(&self, arguments: &serde_json::Value) -> Mutation;

    /// Executes the call and returns the observation map that becomes a
    /// `FunctionCallResult.result`.
    async fn run(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> serde_json::Map<String, serde_json::Value>;
}

/// Reads the `modifies_resource` argument an LLM declared for a custom
/// tool call, defaulting to `Unknown` (spec.md §4.5).
pub fn declared_mutation(arguments: &serde_json::Value) -> Mutation {
    match arguments.get("modifies_resource").and_then(|v| v.as_str()) {
        Some("yes") => Mutation::Yes,
        Some("no") => Mutation::No,
        _ => Mutation::Unknown,
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
    #[error("failed to read custom tool definitions from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse custom tool YAML at {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Process-wide map from tool name to tool (spec.md §4.3). Registration
/// panics on a name conflict — a deliberate departure from the teacher's
/// `ToolRegistry::register`, which silently overwrote — because spec.md
/// §4.3 calls this out explicitly: "registration panics on name conflict
/// to surface configuration errors at startup."
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Registers a tool, panicking if its name collides with one already
    /// present.
    pub fn register<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.register_arc(Arc::new(tool))
    }

    fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            panic!("tool '{name}' registered twice");
        }
        self
    }

    /// Registers the three built-in tools named in spec.md §4.3:
    /// `kubectl`, `bash`, `scan_image_with_trivy`.
    pub fn register_builtin(self) -> Self {
        self.register(KubectlTool::new())
            .register(BashTool::new())
            .register(TrivyTool::new())
    }

    /// Loads user-defined tools from a single YAML file or a directory of
    /// them (spec.md §6: "Loaded recursively from `~/.config/kubectl-ai/
    /// tools.yaml` (or a file/directory override)").
    pub fn load_custom_tools(mut self, path: &Path) -> Result<Self, ToolError> {
        let mut records = Vec::new();
        collect_yaml_records(path, &mut records)?;
        for record in records {
            self = self.register_arc(Arc::new(CustomTool::from_record(record)));
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Full set of function definitions to register with a chat session
    /// (`Chat.SetFunctionDefinitions`, spec.md §4.1).
    pub fn function_definitions(&self) -> Vec<FunctionDefinition> {
        self.tools.values().map(|tool| tool.function_definition()).collect()
    }

    /// Dispatches one LLM-issued call. Returns `None` only when the named
    /// tool was never registered; everything else (interactive refusal,
    /// non-zero exit, tool panic-free runtime errors) comes back as an
    /// `is_error` result, because spec.md §7 treats tool failure as data
    /// fed back to the LLM, not an exception.
    pub async fn execute(&self, ctx: &ToolContext, call: &FunctionCall) -> Option<FunctionCallResult> {
        let tool = self.tools.get(&call.name)?.clone();
        crate::log(format!("tool registry: dispatching '{}'", call.name));
        if let Some(reason) = tool.is_interactive(&call.arguments) {
            return Some(FunctionCallResult::from_text(&call.id, &call.name, reason, true));
        }
        let result = tool.run(ctx, &call.arguments).await;
        let is_error = result.get("error").is_some()
            || result
                .get("exit_code")
                .and_then(|v| v.as_i64())
                .map(|code| code != 0)
                .unwrap_or(false);
        Some(FunctionCallResult {
            id: call.id.clone(),
            name: call.name.clone(),
            is_error,
            result,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_yaml_records(path: &Path, out: &mut Vec<custom::CustomToolRecord>) -> Result<(), ToolError> {
    let metadata = std::fs::metadata(path).map_err(|source| ToolError::Io { path: path.to_path_buf(), source })?;
    if metadata.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|source| ToolError::Io { path: path.to_path_buf(), source })?;
        for entry in entries {
            let entry = entry.map_err(|source| ToolError::Io { path: path.to_path_buf(), source })?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                collect_yaml_records(&entry_path, out)?;
                continue;
            }
            let is_yaml = entry_path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if is_yaml {
                load_yaml_file(&entry_path, out)?;
            }
        }
        Ok(())
    } else {
        load_yaml_file(path, out)
    }
}

fn load_yaml_file(path: &Path, out: &mut Vec<custom::CustomToolRecord>) -> Result<(), ToolError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ToolError::Io { path: path.to_path_buf(), source })?;
    let records: Vec<custom::CustomToolRecord> =
        serde_yaml::from_str(&contents).map_err(|source| ToolError::Yaml { path: path.to_path_buf(), source })?;
    out.extend(records);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_tools() {
        let registry = ToolRegistry::new();
        assert!(registry.tool_names().is_empty());
    }

    #[test]
    fn builtin_registration_includes_all_three() {
        let registry = ToolRegistry::new().register_builtin();
        assert!(registry.has_tool("kubectl"));
        assert!(registry.has_tool("bash"));
        assert!(registry.has_tool("scan_image_with_trivy"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        ToolRegistry::new().register(KubectlTool::new()).register(KubectlTool::new());
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_none() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        let call = FunctionCall {
            id: "1".to_string(),
            name: "does-not-exist".to_string(),
            arguments: serde_json::json!({}),
        };
        assert!(registry.execute(&ctx, &call).await.is_none());
    }

    #[tokio::test]
    async fn execute_bash_tool_runs_command() {
        let registry = ToolRegistry::new().register(BashTool::new());
        let ctx = ToolContext::new(std::env::temp_dir());
        let call = FunctionCall {
            id: "1".to_string(),
            name: "bash".to_string(),
            arguments: serde_json::json!({"command": "echo hi"}),
        };
        let result = registry.execute(&ctx, &call).await.unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn execute_refuses_interactive_kubectl_without_spawning() {
        let registry = ToolRegistry::new().register(KubectlTool::new());
        let ctx = ToolContext::new(std::env::temp_dir());
        let call = FunctionCall {
            id: "1".to_string(),
            name: "kubectl".to_string(),
            arguments: serde_json::json!({"command": "kubectl edit deployment/nginx"}),
        };
        let result = registry.execute(&ctx, &call).await.unwrap();
        assert!(result.is_error);
    }
}
