use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{remote_error, schema_object, Tool, ToolResult};
use crate::cursor::TaskApi;
use cursorbot_core::llm_types::ToolDefinition;

fn normalize_repository(url: &str) -> String {
    let lower = url.trim().to_lowercase();
    let trimmed = lower.trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
}

/// True when `allowed` is empty or contains `repository`, ignoring case,
/// a trailing slash and a `.git` suffix.
pub fn repository_allowed(allowed: &[String], repository: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let wanted = normalize_repository(repository);
    allowed.iter().any(|a| normalize_repository(a) == wanted)
}

pub struct ListRepositoriesTool {
    api: Arc<dyn TaskApi>,
    allowed: Arc<Vec<String>>,
}

impl ListRepositoriesTool {
    pub fn new(api: Arc<dyn TaskApi>, allowed: Arc<Vec<String>>) -> Self {
        Self { api, allowed }
    }
}

#[async_trait]
impl Tool for ListRepositoriesTool {
    fn name(&self) -> &str {
        "list_repositories"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_repositories".into(),
            description: "List the GitHub repositories the Cursor account can run tasks against. Each entry says whether the bot is allowed to start tasks on it.".into(),
            input_schema: schema_object(json!({}), &[]),
        }
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        let repositories = match self.api.list_repositories().await {
            Ok(r) => r,
            Err(e) => return remote_error(e),
        };
        let entries: Vec<serde_json::Value> = repositories
            .iter()
            .map(|r| {
                json!({
                    "owner": r.owner,
                    "name": r.name,
                    "url": r.url,
                    "allowed": repository_allowed(&self.allowed, &r.url),
                })
            })
            .collect();
        ToolResult::json(json!({
            "repositories": entries,
            "allowed_repositories": self.allowed.as_slice(),
        }))
    }
}
