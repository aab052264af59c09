use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::repositories::repository_allowed;
use super::{
    optional_str, remote_error, require_auth_context, required_str, schema_object, Tool,
    ToolAuthContext, ToolResult,
};
use crate::cursor::{
    agent_web_url, AgentSource, CreateAgentRequest, ImageDimension, Prompt, PromptImage, TaskApi,
};
use cursorbot_core::llm_types::ToolDefinition;
use cursorbot_core::task::TaskStatus;
use cursorbot_storage::db::{call_blocking, Database, TaskRecord};
use cursorbot_storage::image_cache::ImageCache;

/// Mirror a remotely reported status into the task table. Best-effort.
async fn record_status(db: &Arc<Database>, task_id: &str, status: &TaskStatus) {
    let id = task_id.to_string();
    let status = status.clone();
    if let Err(e) = call_blocking(db.clone(), move |db| db.update_task_status(&id, &status)).await
    {
        warn!("Failed to update status of task {task_id}: {e}");
    }
}

/// The task row, provided the caller's user and chat started it. Anything
/// else reads as unknown so task ids cannot be probed across chats.
async fn owned_task(
    db: &Arc<Database>,
    auth: ToolAuthContext,
    task_id: &str,
) -> Result<TaskRecord, ToolResult> {
    let id = task_id.to_string();
    let record = call_blocking(db.clone(), move |db| db.get_task_by_composer_id(&id))
        .await
        .map_err(|e| ToolResult::error_json(format!("Failed to load task {task_id}: {e}")))?;
    match record {
        Some(task)
            if task.user_id == auth.caller_user_id && task.chat_id == auth.caller_chat_id =>
        {
            Ok(task)
        }
        _ => Err(ToolResult::error_json(format!(
            "Task {task_id} was not started from this chat"
        ))
        .with_error_type("task_not_found")),
    }
}

// --- start_task ---

pub struct StartTaskTool {
    api: Arc<dyn TaskApi>,
    db: Arc<Database>,
    image_cache: Arc<ImageCache>,
    allowed: Arc<Vec<String>>,
}

impl StartTaskTool {
    pub fn new(
        api: Arc<dyn TaskApi>,
        db: Arc<Database>,
        image_cache: Arc<ImageCache>,
        allowed: Arc<Vec<String>>,
    ) -> Self {
        Self {
            api,
            db,
            image_cache,
            allowed,
        }
    }
}

#[async_trait]
impl Tool for StartTaskTool {
    fn name(&self) -> &str {
        "start_task"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "start_task".into(),
            description: "Start a Cursor background agent on a repository. Photos the user sent in the last few minutes are attached automatically.".into(),
            input_schema: schema_object(
                json!({
                    "repository": {
                        "type": "string",
                        "description": "Full repository URL, e.g. https://github.com/owner/name"
                    },
                    "prompt": {
                        "type": "string",
                        "description": "Detailed instructions for the agent"
                    },
                    "branch": {
                        "type": "string",
                        "description": "Git ref to start from (optional, defaults to the repository's default branch)"
                    },
                    "model": {
                        "type": "string",
                        "description": "Model name from list_models (optional)"
                    }
                }),
                &["repository", "prompt"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let auth = match require_auth_context(&input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let repository = match required_str(&input, "repository") {
            Ok(r) => r.to_string(),
            Err(e) => return e,
        };
        let prompt = match required_str(&input, "prompt") {
            Ok(p) => p.to_string(),
            Err(e) => return e,
        };
        let branch = optional_str(&input, "branch").map(str::to_string);
        let model = optional_str(&input, "model").map(str::to_string);

        if !repository_allowed(&self.allowed, &repository) {
            return ToolResult::error_json(format!(
                "Repository {repository} is not allowed. Allowed repositories: {}",
                self.allowed.join(", ")
            ))
            .with_error_type("repository_not_allowed");
        }

        let images = match self
            .image_cache
            .read(auth.caller_user_id, auth.caller_chat_id)
        {
            Ok(images) => images,
            Err(e) => {
                warn!("Failed to read cached images: {e}");
                Vec::new()
            }
        };
        let images_attached = images.len();

        let request = CreateAgentRequest {
            prompt: Prompt {
                text: prompt.clone(),
                images: images
                    .into_iter()
                    .map(|img| PromptImage {
                        data: img.data,
                        dimension: ImageDimension {
                            width: img.width,
                            height: img.height,
                        },
                    })
                    .collect(),
            },
            model,
            source: AgentSource {
                repository: repository.clone(),
                git_ref: branch.clone(),
            },
        };

        let agent = match self.api.create_agent(&request).await {
            Ok(agent) => agent,
            Err(e) => return remote_error(e),
        };
        info!(
            "Started task {} on {repository} ({images_attached} image(s))",
            agent.id
        );

        let (agent_id, repo, desc, status) = (
            agent.id.clone(),
            repository.clone(),
            prompt,
            agent.status.clone(),
        );
        if let Err(e) = call_blocking(self.db.clone(), move |db| {
            db.create_task(
                auth.caller_user_id,
                auth.caller_chat_id,
                &agent_id,
                &repo,
                &desc,
                &status,
            )
        })
        .await
        {
            warn!("Failed to record task {}: {e}", agent.id);
        }

        if let Err(e) = self
            .image_cache
            .clear(auth.caller_user_id, auth.caller_chat_id)
        {
            warn!("Failed to clear image cache: {e}");
        }

        let branch = agent
            .target
            .as_ref()
            .and_then(|t| t.branch_name.clone())
            .or(branch);
        ToolResult::json(json!({
            "task_id": agent.id,
            "status": agent.status.as_str(),
            "name": agent.name,
            "repository": repository,
            "branch": branch,
            "url": agent.web_url(),
            "images_attached": images_attached,
        }))
    }
}

// --- get_task_status ---

pub struct GetTaskStatusTool {
    api: Arc<dyn TaskApi>,
    db: Arc<Database>,
}

impl GetTaskStatusTool {
    pub fn new(api: Arc<dyn TaskApi>, db: Arc<Database>) -> Self {
        Self { api, db }
    }
}

#[async_trait]
impl Tool for GetTaskStatusTool {
    fn name(&self) -> &str {
        "get_task_status"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_task_status".into(),
            description: "Fetch the current status, summary and links of a Cursor task.".into(),
            input_schema: schema_object(
                json!({
                    "task_id": {
                        "type": "string",
                        "description": "Task id as returned by start_task or list_active_tasks"
                    }
                }),
                &["task_id"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let auth = match require_auth_context(&input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let task_id = match required_str(&input, "task_id") {
            Ok(t) => t.to_string(),
            Err(e) => return e,
        };
        if let Err(e) = owned_task(&self.db, auth, &task_id).await {
            return e;
        }
        let agent = match self.api.get_agent(&task_id).await {
            Ok(agent) => agent,
            Err(e) => return remote_error(e),
        };
        record_status(&self.db, &agent.id, &agent.status).await;

        let target = agent.target.clone().unwrap_or_default();
        ToolResult::json(json!({
            "task_id": agent.id,
            "status": agent.status.as_str(),
            "name": agent.name,
            "summary": agent.summary,
            "repository": agent.source.as_ref().map(|s| s.repository.clone()),
            "branch": target.branch_name,
            "pr_url": target.pr_url,
            "url": agent.web_url(),
            "created_at": agent.created_at,
        }))
    }
}

// --- list_active_tasks ---

pub struct ListActiveTasksTool {
    db: Arc<Database>,
}

impl ListActiveTasksTool {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for ListActiveTasksTool {
    fn name(&self) -> &str {
        "list_active_tasks"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_active_tasks".into(),
            description: "List the tasks started from this chat that have not reached a final status yet.".into(),
            input_schema: schema_object(json!({}), &[]),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let auth = match require_auth_context(&input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let tasks = match call_blocking(self.db.clone(), move |db| {
            db.get_active_tasks_for_chat(auth.caller_user_id, auth.caller_chat_id)
        })
        .await
        {
            Ok(tasks) => tasks,
            Err(e) => return ToolResult::error_json(format!("Failed to load tasks: {e}")),
        };

        let entries: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| {
                json!({
                    "task_id": t.composer_id,
                    "repository": t.repo_url,
                    "status": t.status.as_str(),
                    "description": t.task_description,
                    "created_at": t.created_at,
                    "url": agent_web_url(&t.composer_id),
                })
            })
            .collect();
        ToolResult::json(json!({ "count": entries.len(), "tasks": entries }))
    }
}

// --- stop_task ---

pub struct StopTaskTool {
    api: Arc<dyn TaskApi>,
    db: Arc<Database>,
}

impl StopTaskTool {
    pub fn new(api: Arc<dyn TaskApi>, db: Arc<Database>) -> Self {
        Self { api, db }
    }
}

#[async_trait]
impl Tool for StopTaskTool {
    fn name(&self) -> &str {
        "stop_task"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "stop_task".into(),
            description: "Stop and delete a Cursor task. This cannot be undone.".into(),
            input_schema: schema_object(
                json!({
                    "task_id": {"type": "string", "description": "Task id to stop"}
                }),
                &["task_id"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let auth = match require_auth_context(&input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let task_id = match required_str(&input, "task_id") {
            Ok(t) => t.to_string(),
            Err(e) => return e,
        };
        let task = match owned_task(&self.db, auth, &task_id).await {
            Ok(task) => task,
            Err(e) => return e,
        };
        if task.status.is_terminal() {
            return ToolResult::error_json(format!("Task {task_id} is already {}", task.status))
                .with_error_type("task_finished");
        }
        let deleted = match self.api.delete_agent(&task_id).await {
            Ok(id) => id,
            Err(e) => return remote_error(e),
        };
        record_status(&self.db, &task_id, &TaskStatus::Cancelled).await;
        info!("Stopped task {deleted}");
        ToolResult::json(json!({
            "task_id": deleted,
            "status": TaskStatus::Cancelled.as_str(),
        }))
    }
}

// --- add_followup ---

pub struct AddFollowupTool {
    api: Arc<dyn TaskApi>,
    db: Arc<Database>,
}

impl AddFollowupTool {
    pub fn new(api: Arc<dyn TaskApi>, db: Arc<Database>) -> Self {
        Self { api, db }
    }
}

#[async_trait]
impl Tool for AddFollowupTool {
    fn name(&self) -> &str {
        "add_followup"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "add_followup".into(),
            description: "Send an additional instruction to a running Cursor task.".into(),
            input_schema: schema_object(
                json!({
                    "task_id": {"type": "string", "description": "Task id"},
                    "instruction": {
                        "type": "string",
                        "description": "Follow-up instruction for the agent"
                    }
                }),
                &["task_id", "instruction"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let auth = match require_auth_context(&input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let task_id = match required_str(&input, "task_id") {
            Ok(t) => t,
            Err(e) => return e,
        };
        let instruction = match required_str(&input, "instruction") {
            Ok(i) => i,
            Err(e) => return e,
        };
        if let Err(e) = owned_task(&self.db, auth, task_id).await {
            return e;
        }
        match self.api.add_followup(task_id, instruction).await {
            Ok(id) => ToolResult::json(json!({ "task_id": id, "followup_sent": true })),
            Err(e) => remote_error(e),
        }
    }
}
