pub mod button_message;
pub mod models;
pub mod repositories;
pub mod tasks;

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::config::Config;
use crate::cursor::TaskApi;
use cursorbot_core::error::CursorBotError;
use cursorbot_core::llm_types::ToolDefinition;
use cursorbot_storage::db::Database;
use cursorbot_storage::image_cache::ImageCache;
use cursorbot_tools::runtime::inject_auth_context;
pub use cursorbot_tools::runtime::{
    auth_context_from_input, optional_str, require_auth_context, required_str, schema_object,
    Tool, ToolAuthContext, ToolResult,
};

/// Failed Cursor API call as a tool error. HTTP failures keep their status code.
pub(crate) fn remote_error(e: CursorBotError) -> ToolResult {
    match e {
        CursorBotError::RemoteApi { status, .. } => ToolResult::error_json(e.to_string())
            .with_status_code(i32::from(status))
            .with_error_type("remote_api"),
        other => ToolResult::error_json(other.to_string()),
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    cached_definitions: OnceLock<Vec<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new(
        config: &Config,
        db: Arc<Database>,
        api: Arc<dyn TaskApi>,
        image_cache: Arc<ImageCache>,
    ) -> Self {
        let allowed = Arc::new(config.allowed_repositories.clone());
        let tools: Vec<Box<dyn Tool>> = vec![
            Box::new(repositories::ListRepositoriesTool::new(
                api.clone(),
                allowed.clone(),
            )),
            Box::new(tasks::StartTaskTool::new(
                api.clone(),
                db.clone(),
                image_cache,
                allowed,
            )),
            Box::new(tasks::GetTaskStatusTool::new(api.clone(), db.clone())),
            Box::new(tasks::ListActiveTasksTool::new(db.clone())),
            Box::new(tasks::StopTaskTool::new(api.clone(), db.clone())),
            Box::new(tasks::AddFollowupTool::new(api.clone(), db)),
            Box::new(models::ListModelsTool::new(api)),
            Box::new(button_message::SendButtonMessageTool),
        ];
        ToolRegistry {
            tools,
            cached_definitions: OnceLock::new(),
        }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        self.cached_definitions
            .get_or_init(|| self.tools.iter().map(|t| t.definition()).collect())
    }

    pub async fn execute(&self, name: &str, input: serde_json::Value) -> ToolResult {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return ToolResult::error_json(format!("Unknown tool: {name}"))
                .with_error_type("unknown_tool");
        };
        let started = Instant::now();
        let mut result = tool.execute(input).await;
        result.duration_ms = Some(started.elapsed().as_millis());
        result.bytes = result.content.len();
        if result.is_error && result.error_type.is_none() {
            result.error_type = Some("tool_error".to_string());
        }
        result
    }

    pub async fn execute_with_auth(
        &self,
        name: &str,
        input: serde_json::Value,
        auth: &ToolAuthContext,
    ) -> ToolResult {
        self.execute(name, inject_auth_context(input, auth)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{temp_db, FakeTaskApi};
    use serde_json::json;

    fn registry() -> (ToolRegistry, std::path::PathBuf) {
        let (db, dir) = temp_db();
        let cache = Arc::new(ImageCache::new(
            dir.join("image_cache"),
            std::time::Duration::from_secs(180),
        ));
        let registry = ToolRegistry::new(
            &Config::test_config(),
            db,
            Arc::new(FakeTaskApi::new()),
            cache,
        );
        (registry, dir)
    }

    #[test]
    fn test_definitions_cover_all_tools() {
        let (registry, dir) = registry();
        let names: Vec<_> = registry
            .definitions()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "list_repositories",
                "start_task",
                "get_task_status",
                "list_active_tasks",
                "stop_task",
                "add_followup",
                "list_models",
                "send_button_message",
            ]
        );
        for def in registry.definitions() {
            assert_eq!(def.input_schema["type"], "object", "{}", def.name);
            assert!(!def.description.is_empty());
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_payload() {
        let (registry, dir) = registry();
        let result = registry.execute("rm_rf", json!({})).await;
        assert!(result.is_error);
        assert_eq!(result.error_type.as_deref(), Some("unknown_tool"));
        let payload: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("rm_rf"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_execute_records_metrics() {
        let (registry, dir) = registry();
        let result = registry.execute("list_models", json!({})).await;
        assert!(!result.is_error);
        assert!(result.duration_ms.is_some());
        assert_eq!(result.bytes, result.content.len());
        assert_eq!(result.status_code, Some(0));
        let _ = std::fs::remove_dir_all(dir);
    }
}
