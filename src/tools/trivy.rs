//! `scan_image_with_trivy` built-in tool (spec.md §4.3).
//!
//! Shells out the same way `bash` does (it is, in the runner's eyes, just
//! another command); the only thing specific to this tool is the fixed
//! `trivy image <ref>` command shape and that it never mutates cluster
//! state, so it is always permission-free.

use async_trait::async_trait;

use crate::safety::Mutation;
use crate::schema::Schema;

use super::{Tool, ToolContext};

#[derive(Debug, Clone, Default)]
pub struct TrivyTool;

impl TrivyTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for TrivyTool {
    fn name(&self) -> &str {
        "scan_image_with_trivy"
    }

    fn description(&self) -> &str {
        "Scans a container image reference for known vulnerabilities using trivy."
    }

    fn parameters_schema(&self) -> Schema {
        Schema::object(
            [(
                "image".to_string(),
                Schema::string("Container image reference to scan, e.g. `nginx:1.25`."),
            )]
            .into_iter()
            .collect(),
            vec!["image".to_string()],
        )
    }

    fn is_interactive(&self, _arguments: &serde_json::Value) -> Option<String> {
        None
    }

    fn classify_mutation(&self, _arguments: &serde_json::Value) -> Mutation {
        Mutation::No
    }

    async fn run(&self, ctx: &ToolContext, arguments: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        let image = arguments.get("image").and_then(|v| v.as_str()).unwrap_or("");
        if image.trim().is_empty() {
            let mut map = serde_json::Map::new();
            map.insert("error".to_string(), serde_json::Value::String("missing 'image' argument".to_string()));
            return map;
        }
        let command = format!("trivy image {}", shell_words::quote(image));
        ctx.runner().run(&command).await.to_json().as_object().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_refused_and_never_mutating() {
        let tool = TrivyTool::new();
        let args = serde_json::json!({"image": "nginx:1.25"});
        assert!(tool.is_interactive(&args).is_none());
        assert_eq!(tool.classify_mutation(&args), Mutation::No);
    }

    #[tokio::test]
    async fn missing_image_is_an_error_without_spawning() {
        let tool = TrivyTool::new();
        let ctx = ToolContext::new(std::env::temp_dir());
        let result = tool.run(&ctx, &serde_json::json!({})).await;
        assert!(result.contains_key("error"));
    }
}
