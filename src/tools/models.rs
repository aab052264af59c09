use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{remote_error, schema_object, Tool, ToolResult};
use crate::cursor::TaskApi;
use cursorbot_core::llm_types::ToolDefinition;

pub struct ListModelsTool {
    api: Arc<dyn TaskApi>,
}

impl ListModelsTool {
    pub fn new(api: Arc<dyn TaskApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for ListModelsTool {
    fn name(&self) -> &str {
        "list_models"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_models".into(),
            description: "List the model names Cursor accepts for new tasks.".into(),
            input_schema: schema_object(json!({}), &[]),
        }
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.api.list_models().await {
            Ok(models) => ToolResult::json(json!({ "models": models })),
            Err(e) => remote_error(e),
        }
    }
}
