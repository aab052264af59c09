use tracing::warn;

use crate::cursor::agent_web_url;
use crate::runtime::AppState;
use crate::text::preview;
use cursorbot_storage::db::call_blocking;

const HELP_TEXT: &str = "I start and manage Cursor background agents on your GitHub repositories.

Just tell me what to build, for example:
\"Add a dark mode toggle to https://github.com/acme/web\"

Send photos first (within 3 minutes) to attach them to the next task.
Voice notes work too when transcription is configured.

Commands:
/tasks - list active tasks in this chat
/models - list available models
/clear - forget this conversation
/help - show this message";

/// Strips a `@botname` suffix from the command word: `/tasks@my_bot` -> `/tasks`.
fn command_word(text: &str) -> Option<&str> {
    let word = text.trim_start().split_whitespace().next()?;
    if !word.starts_with('/') {
        return None;
    }
    Some(word.split('@').next().unwrap_or(word))
}

/// Direct replies for bot commands. Returns `None` for anything that is not
/// a known command so the caller can hand it to the agent.
pub async fn handle_chat_command(
    state: &AppState,
    user_id: i64,
    chat_id: i64,
    text: &str,
) -> Option<String> {
    match command_word(text)? {
        "/start" => Some(format!("👋 Hi! {HELP_TEXT}")),
        "/help" => Some(HELP_TEXT.to_string()),
        "/clear" => {
            let reply = match call_blocking(state.db.clone(), move |db| {
                db.clear_conversation(user_id, chat_id)
            })
            .await
            {
                Ok(_) => "🧹 Conversation history cleared.".to_string(),
                Err(e) => format!("Failed to clear history: {e}"),
            };
            if let Err(e) = state.image_cache.clear(user_id, chat_id) {
                warn!("Failed to clear image cache for chat {chat_id}: {e}");
            }
            Some(reply)
        }
        "/tasks" => Some(
            match call_blocking(state.db.clone(), move |db| {
                db.get_active_tasks_for_chat(user_id, chat_id)
            })
            .await
            {
                Ok(tasks) if tasks.is_empty() => "No active tasks.".to_string(),
                Ok(tasks) => {
                    let mut out = format!("Active tasks ({}):\n", tasks.len());
                    for task in tasks {
                        out.push_str(&format!(
                            "\n• {} [{}]\n  {}\n  {}\n  {}\n",
                            task.composer_id,
                            task.status,
                            task.repo_url,
                            preview(&task.task_description, 100),
                            agent_web_url(&task.composer_id)
                        ));
                    }
                    out
                }
                Err(e) => format!("Failed to load tasks: {e}"),
            },
        ),
        "/models" => Some(match state.api.list_models().await {
            Ok(models) if models.is_empty() => "No models available.".to_string(),
            Ok(models) => format!(
                "Available models:\n{}",
                models
                    .iter()
                    .map(|m| format!("• {m}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
            Err(e) => format!("Failed to list models: {e}"),
        }),
        _ => None,
    }
}
