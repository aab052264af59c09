use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{
    call_blocking, ConversationMessage, StepTrace, StoredConversationMessage, TaskRecord,
    ToolCallTrace, ToolResultTrace,
};
use crate::llm_types::{ContentBlock, Message, MessageContent, ResponseContentBlock};
use crate::runtime::AppState;
use crate::text::preview;
use crate::tools::button_message::{parse_button_message, ButtonMessage};
use crate::tools::ToolAuthContext;

const STEP_CAP_MESSAGE: &str = "I reached the maximum number of steps for one request. Please check the task status or break the request into smaller steps.";
const EMPTY_REPLY_MESSAGE: &str = "Done.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentRequestContext {
    pub user_id: i64,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Text(String),
    Buttons(ButtonMessage),
}

/// Run one user turn through the tool-calling loop. Never fails: LLM errors
/// come back as a user-facing text reply.
pub async fn process_with_agent(
    state: &AppState,
    context: AgentRequestContext,
    text: &str,
) -> AgentReply {
    let AgentRequestContext { user_id, chat_id } = context;

    let user_message = ConversationMessage::User {
        content: text.to_string(),
    };
    if let Err(e) = call_blocking(state.db.clone(), move |db| {
        db.append_conversation_message(user_id, chat_id, &user_message, 0, false)
    })
    .await
    {
        warn!("Failed to store user message for chat {chat_id}: {e}");
    }

    let limit = state.config.max_history_messages;
    let mut messages = match call_blocking(state.db.clone(), move |db| {
        db.get_conversation_messages(user_id, chat_id, limit)
    })
    .await
    {
        Ok(history) => history_to_llm_messages(&history),
        Err(e) => {
            warn!("Failed to load history for chat {chat_id}: {e}");
            Vec::new()
        }
    };
    if messages.is_empty() {
        messages.push(Message {
            role: "user".into(),
            content: MessageContent::Text(text.to_string()),
        });
    }

    let active_tasks = call_blocking(state.db.clone(), move |db| {
        db.get_active_tasks_for_chat(user_id, chat_id)
    })
    .await
    .unwrap_or_else(|e| {
        warn!("Failed to load active tasks for chat {chat_id}: {e}");
        Vec::new()
    });
    let system_prompt = build_system_prompt(&state.config, &active_tasks);

    let tool_defs = state.tools.definitions().to_vec();
    let auth = ToolAuthContext {
        caller_user_id: user_id,
        caller_chat_id: chat_id,
    };

    let mut produced: Vec<ConversationMessage> = Vec::new();
    let mut final_text: Option<String> = None;
    let mut last_text: Option<String> = None;
    let mut llm_error = None;

    for step in 0..state.config.max_steps {
        let response = match state
            .llm
            .send_message(&system_prompt, messages.clone(), Some(tool_defs.clone()))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                llm_error = Some(e);
                break;
            }
        };

        let text = response.text();
        if !text.trim().is_empty() {
            last_text = Some(text.clone());
        }
        let stop_reason = response.stop_reason.as_deref().unwrap_or("end_turn");
        let mut trace = StepTrace {
            finish_reason: response.stop_reason.clone(),
            usage: response.usage,
            text: text.clone(),
            ..StepTrace::default()
        };

        let tool_uses: Vec<(String, String, serde_json::Value)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();

        if stop_reason == "tool_use" && !tool_uses.is_empty() {
            let mut assistant_blocks = Vec::new();
            if !text.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: text.clone() });
            }
            for (id, name, input) in &tool_uses {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }

            let mut tool_results = Vec::new();
            for (id, name, input) in tool_uses {
                info!("Executing tool: {name} (step {step})");
                let result = state
                    .tools
                    .execute_with_auth(&name, input.clone(), &auth)
                    .await;
                if result.is_error {
                    warn!("Tool {name} failed: {}", preview(&result.content, 200));
                }
                trace.tool_calls.push(ToolCallTrace {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                });
                trace.tool_results.push(ToolResultTrace {
                    tool_use_id: id.clone(),
                    name,
                    content: result.content.clone(),
                    is_error: result.is_error,
                });
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: result.content,
                    is_error: result.is_error.then_some(true),
                });
            }

            messages.push(Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(assistant_blocks.clone()),
            });
            messages.push(Message {
                role: "user".into(),
                content: MessageContent::Blocks(tool_results.clone()),
            });
            produced.push(ConversationMessage::Assistant {
                blocks: assistant_blocks,
            });
            produced.push(ConversationMessage::Tool {
                results: tool_results,
            });
            record_step(state, context, step, trace).await;
            continue;
        }

        // end_turn, max_tokens or an unknown stop reason all finish the turn
        let reply = if text.trim().is_empty() {
            EMPTY_REPLY_MESSAGE.to_string()
        } else {
            text
        };
        produced.push(ConversationMessage::Assistant {
            blocks: vec![ContentBlock::Text {
                text: reply.clone(),
            }],
        });
        record_step(state, context, step, trace).await;
        final_text = Some(reply);
        break;
    }

    persist_response_messages(state, context, produced.clone()).await;

    if let Some(e) = llm_error {
        error!("LLM call failed for chat {chat_id}: {e}");
        return AgentReply::Text(format!(
            "Sorry, something went wrong while processing your request: {e}"
        ));
    }

    if let Some(buttons) = first_button_message(&produced) {
        return AgentReply::Buttons(buttons);
    }

    let text = match final_text {
        Some(text) => text,
        None => {
            warn!(
                "Step cap of {} reached for chat {chat_id}",
                state.config.max_steps
            );
            last_text.unwrap_or_else(|| STEP_CAP_MESSAGE.to_string())
        }
    };
    AgentReply::Text(text)
}

async fn record_step(state: &AppState, context: AgentRequestContext, step: usize, trace: StepTrace) {
    let AgentRequestContext { user_id, chat_id } = context;
    if let Err(e) = call_blocking(state.db.clone(), move |db| {
        db.append_conversation_step(user_id, chat_id, step as i64, &trace)
    })
    .await
    {
        warn!("Failed to store step {step} for chat {chat_id}: {e}");
    }
}

/// Response messages follow the user message (step 0); the last one is final.
async fn persist_response_messages(
    state: &AppState,
    context: AgentRequestContext,
    produced: Vec<ConversationMessage>,
) {
    if produced.is_empty() {
        return;
    }
    let AgentRequestContext { user_id, chat_id } = context;
    let result = call_blocking(state.db.clone(), move |db| {
        let last = produced.len() - 1;
        for (i, message) in produced.iter().enumerate() {
            db.append_conversation_message(user_id, chat_id, message, i as i64 + 1, i == last)?;
        }
        Ok(())
    })
    .await;
    if let Err(e) = result {
        warn!("Failed to store response messages for chat {chat_id}: {e}");
    }
}

/// First tool result, in response order, carrying a button message.
pub(crate) fn first_button_message(produced: &[ConversationMessage]) -> Option<ButtonMessage> {
    produced
        .iter()
        .filter_map(|m| match m {
            ConversationMessage::Tool { results } => Some(results),
            _ => None,
        })
        .flatten()
        .find_map(|block| match block {
            ContentBlock::ToolResult {
                content, is_error, ..
            } if *is_error != Some(true) => parse_button_message(content),
            _ => None,
        })
}

/// Convert stored history into provider messages. Leading entries that are
/// not a user text message are skipped so the window starts on a user turn.
pub(crate) fn history_to_llm_messages(history: &[StoredConversationMessage]) -> Vec<Message> {
    let start = history
        .iter()
        .position(|m| matches!(m.message, ConversationMessage::User { .. }))
        .unwrap_or(history.len());

    history[start..]
        .iter()
        .map(|stored| match &stored.message {
            ConversationMessage::User { content } => Message {
                role: "user".into(),
                content: MessageContent::Text(content.clone()),
            },
            ConversationMessage::Assistant { blocks } => Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(blocks.clone()),
            },
            ConversationMessage::Tool { results } => Message {
                role: "user".into(),
                content: MessageContent::Blocks(results.clone()),
            },
        })
        .collect()
}

pub(crate) fn build_system_prompt(config: &Config, active_tasks: &[TaskRecord]) -> String {
    let mut prompt = String::from(
        r#"You are a Telegram assistant that runs Cursor background agents ("tasks") on GitHub repositories for the user.

You can:
- List repositories the Cursor account can access (list_repositories)
- Start a task on a repository with detailed instructions (start_task)
- Check the status of a task (get_task_status) and list this chat's active tasks (list_active_tasks)
- Stop a task (stop_task) or send it a follow-up instruction (add_followup)
- List the models a task can use (list_models)
- Reply with clickable link buttons (send_button_message)
"#,
    );

    prompt.push_str("\n# Allowed repositories\n\n");
    if config.allowed_repositories.is_empty() {
        prompt.push_str("All repositories are allowed.\n");
    } else {
        for repo in &config.allowed_repositories {
            prompt.push_str(&format!("- {repo}\n"));
        }
    }

    prompt.push_str("\n# Active tasks in this chat\n\n");
    if active_tasks.is_empty() {
        prompt.push_str("None.\n");
    } else {
        for task in active_tasks {
            prompt.push_str(&format!(
                "- {} | {} | {} | {}\n",
                task.composer_id,
                task.repo_url,
                task.status,
                preview(&task.task_description, 120)
            ));
        }
    }

    prompt.push_str(
        r#"
# Rules

- Only start tasks on allowed repositories. If the user does not name a repository and there is exactly one allowed repository, use it; otherwise ask.
- Write start_task prompts as complete, self-contained instructions. Photos the user sent recently are attached automatically.
- Never invent task ids; use the ids above or from tool results.
- After starting a task, reply with send_button_message including an "Open in Cursor" link to the task and a "Repository" link.
- Keep answers short. Tool errors come back as {"error": ...}; explain them plainly.
"#,
    );

    if let Some(custom) = config.custom_prompt.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n# Additional instructions\n\n");
        prompt.push_str(custom.trim());
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use crate::test_support::{test_app, text_response, tool_response};
    use serde_json::json;

    const CTX: AgentRequestContext = AgentRequestContext {
        user_id: 1,
        chat_id: 100,
    };

    #[tokio::test]
    async fn test_plain_text_reply_is_persisted() {
        let app = test_app(Config::test_config());
        app.llm.push(text_response("Hello there"));

        let reply = process_with_agent(&app.state, CTX, "hi").await;
        assert_eq!(reply, AgentReply::Text("Hello there".into()));

        let stored = app.state.db.get_conversation_messages(1, 100, 50).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(
            stored[0].message,
            ConversationMessage::User {
                content: "hi".into()
            }
        );
        assert_eq!(stored[0].step_number, 0);
        assert!(!stored[0].is_final);
        assert_eq!(stored[1].message.message_type(), "assistant");
        assert_eq!(stored[1].step_number, 1);
        assert!(stored[1].is_final);

        let steps = app.state.db.get_conversation_steps(1, 100, 10).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_number, 0);
        assert_eq!(steps[0].trace.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(steps[0].trace.usage.map(|u| u.output_tokens), Some(5));
    }

    #[tokio::test]
    async fn test_tool_round_persists_messages_and_steps() {
        let app = test_app(Config::test_config());
        app.llm
            .push(tool_response("", &[("call_1", "list_models", json!({}))]))
            .push(text_response("You can use claude-4-sonnet or gpt-5."));

        let reply = process_with_agent(&app.state, CTX, "which models?").await;
        assert_eq!(
            reply,
            AgentReply::Text("You can use claude-4-sonnet or gpt-5.".into())
        );

        let stored = app.state.db.get_conversation_messages(1, 100, 50).unwrap();
        let types: Vec<_> = stored.iter().map(|m| m.message.message_type()).collect();
        assert_eq!(types, vec!["user", "assistant", "tool", "assistant"]);
        let steps: Vec<_> = stored.iter().map(|m| m.step_number).collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
        assert_eq!(stored.iter().filter(|m| m.is_final).count(), 1);
        assert!(stored[3].is_final);

        let traces = app.state.db.get_conversation_steps(1, 100, 10).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].step_number, 0);
        assert_eq!(traces[0].trace.tool_calls[0].name, "list_models");
        assert!(!traces[0].trace.tool_results[0].is_error);
        assert_eq!(traces[1].step_number, 1);

        // The second LLM call sees the tool round
        let requests = app.llm.requests();
        assert_eq!(requests[1].len(), 3);
        assert_eq!(requests[1][1].role, "assistant");
    }

    #[tokio::test]
    async fn test_first_button_message_wins() {
        let app = test_app(Config::test_config());
        app.llm
            .push(tool_response(
                "",
                &[
                    (
                        "b1",
                        "send_button_message",
                        json!({"text": "first", "buttons": [{"label": "A", "url": "https://a.dev"}]}),
                    ),
                    (
                        "b2",
                        "send_button_message",
                        json!({"text": "second", "buttons": [{"label": "B", "url": "https://b.dev"}]}),
                    ),
                ],
            ))
            .push(text_response("Here you go"));

        let reply = process_with_agent(&app.state, CTX, "links please").await;
        match reply {
            AgentReply::Buttons(msg) => {
                assert_eq!(msg.text, "first");
                assert_eq!(msg.buttons[0].label, "A");
            }
            other => panic!("expected buttons, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step_cap_truncates_with_last_text() {
        let mut config = Config::test_config();
        config.max_steps = 3;
        let app = test_app(config);
        app.llm.repeat(tool_response(
            "Still checking",
            &[("call_x", "list_models", json!({}))],
        ));

        let reply = process_with_agent(&app.state, CTX, "loop forever").await;
        assert_eq!(reply, AgentReply::Text("Still checking".into()));
        assert_eq!(app.llm.call_count(), 3);

        let stored = app.state.db.get_conversation_messages(1, 100, 50).unwrap();
        assert_eq!(stored.len(), 7);
        assert!(stored[6].is_final);
        assert_eq!(stored[6].message.message_type(), "tool");
    }

    #[tokio::test]
    async fn test_step_cap_without_text_uses_fixed_message() {
        let mut config = Config::test_config();
        config.max_steps = 2;
        let app = test_app(config);
        app.llm
            .repeat(tool_response("", &[("call_x", "list_models", json!({}))]));

        let reply = process_with_agent(&app.state, CTX, "loop").await;
        assert_eq!(reply, AgentReply::Text(STEP_CAP_MESSAGE.into()));
    }

    #[tokio::test]
    async fn test_llm_error_becomes_reply_text() {
        let app = test_app(Config::test_config());
        app.llm.push_error("upstream 502");

        let reply = process_with_agent(&app.state, CTX, "hi").await;
        match reply {
            AgentReply::Text(text) => {
                assert!(text.starts_with("Sorry, something went wrong"));
                assert!(text.contains("upstream 502"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        // The user message is still recorded
        let stored = app.state.db.get_conversation_messages(1, 100, 50).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_history_and_system_prompt_state() {
        let mut config = Config::test_config();
        config.allowed_repositories = vec!["https://github.com/a/b".into()];
        config.custom_prompt = Some("Answer in French.".into());
        let app = test_app(config);
        app.state
            .db
            .create_task(1, 100, "bc-77", "https://github.com/a/b", "fix the navbar", &TaskStatus::Running)
            .unwrap();
        app.llm
            .push(text_response("first answer"))
            .push(text_response("second answer"));

        process_with_agent(&app.state, CTX, "first").await;
        process_with_agent(&app.state, CTX, "second").await;

        let requests = app.llm.requests();
        let second: Vec<_> = requests[1].iter().map(|m| m.role.as_str()).collect();
        assert_eq!(second, vec!["user", "assistant", "user"]);

        let system = &app.llm.systems()[0];
        assert!(system.contains("https://github.com/a/b"));
        assert!(system.contains("bc-77"));
        assert!(system.contains("RUNNING"));
        assert!(system.contains("fix the navbar"));
        assert!(system.contains("Answer in French."));
    }

    #[test]
    fn test_history_window_starts_on_user_message() {
        let stored = |id: i64, message: ConversationMessage| StoredConversationMessage {
            id,
            user_id: 1,
            chat_id: 100,
            message,
            step_number: 0,
            is_final: false,
            created_at: String::new(),
        };
        let history = vec![
            stored(
                1,
                ConversationMessage::Tool {
                    results: vec![ContentBlock::ToolResult {
                        tool_use_id: "gone".into(),
                        content: "{}".into(),
                        is_error: None,
                    }],
                },
            ),
            stored(
                2,
                ConversationMessage::Assistant {
                    blocks: vec![ContentBlock::Text { text: "ok".into() }],
                },
            ),
            stored(
                3,
                ConversationMessage::User {
                    content: "next".into(),
                },
            ),
        ];
        let messages = history_to_llm_messages(&history);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_button_scan_skips_errors_and_plain_results() {
        let produced = vec![
            ConversationMessage::Tool {
                results: vec![
                    ContentBlock::ToolResult {
                        tool_use_id: "1".into(),
                        content: "{\"models\":[]}".into(),
                        is_error: None,
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: "2".into(),
                        content: json!({"type": "button_message", "text": "x", "buttons": []})
                            .to_string(),
                        is_error: Some(true),
                    },
                ],
            },
            ConversationMessage::Tool {
                results: vec![ContentBlock::ToolResult {
                    tool_use_id: "3".into(),
                    content: json!({
                        "type": "button_message",
                        "text": "later",
                        "buttons": [{"label": "L", "url": "https://l.dev"}]
                    })
                    .to_string(),
                    is_error: None,
                }],
            },
        ];
        assert_eq!(first_button_message(&produced).unwrap().text, "later");
    }
}
