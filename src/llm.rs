use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use std::collections::HashSet;
use std::time::Duration;

use crate::config::Config;
use crate::error::CursorBotError;
use crate::llm_types::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse,
    ResponseContentBlock, ToolDefinition, Usage,
};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

fn tool_use_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| match &m.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => vec![],
        })
        .collect()
}

/// Drop `ToolResult` blocks whose `tool_use_id` has no matching `ToolUse`.
/// History is loaded as a window of the last N messages, so the window can
/// start in the middle of a tool_use / tool_result pair.
pub fn sanitize_messages(messages: Vec<Message>) -> Vec<Message> {
    let known_ids = tool_use_ids(&messages);

    messages
        .into_iter()
        .filter_map(|msg| {
            if msg.role != "user" {
                return Some(msg);
            }
            match msg.content {
                MessageContent::Blocks(blocks) => {
                    let filtered: Vec<ContentBlock> = blocks
                        .into_iter()
                        .filter(|b| match b {
                            ContentBlock::ToolResult { tool_use_id, .. } => {
                                known_ids.contains(tool_use_id)
                            }
                            _ => true,
                        })
                        .collect();
                    if filtered.is_empty() {
                        None
                    } else {
                        Some(Message {
                            role: msg.role,
                            content: MessageContent::Blocks(filtered),
                        })
                    }
                }
                other => Some(Message {
                    role: msg.role,
                    content: other,
                }),
            }
        })
        .collect()
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, CursorBotError>;
}

pub fn create_provider(config: &Config) -> Box<dyn LlmProvider> {
    match config.llm_provider.as_str() {
        "anthropic" => Box::new(AnthropicProvider::new(config)),
        _ => Box::new(OpenAiProvider::new(config)),
    }
}

/// Send a request, retrying on HTTP 429 with exponential backoff.
/// Returns the body of the first successful response, or the failing status and body.
async fn send_with_retry<F>(
    build: F,
    retry_base: Duration,
) -> Result<Result<String, (reqwest::StatusCode, String)>, CursorBotError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut retries = 0u32;
    loop {
        let response = build().send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(Ok(response.text().await?));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS && retries < MAX_RATE_LIMIT_RETRIES {
            retries += 1;
            let delay = retry_base * 2u32.pow(retries);
            warn!(
                "Rate limited, retrying in {:?} (attempt {retries}/{MAX_RATE_LIMIT_RETRIES})",
                delay
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        return Ok(Err((status, body)));
    }
}

// ---------------------------------------------------------------------------
// Anthropic provider
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    messages_url: String,
    retry_base: Duration,
}

impl AnthropicProvider {
    pub fn new(config: &Config) -> Self {
        let base = config
            .llm_base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1");
        AnthropicProvider {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            messages_url: format!("{}/messages", base.trim_end_matches('/')),
            retry_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicApiError {
    error: AnthropicApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, CursorBotError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            messages: sanitize_messages(messages),
            tools: tools.filter(|t| !t.is_empty()),
        };

        let outcome = send_with_retry(
            || {
                self.http
                    .post(&self.messages_url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&request)
            },
            self.retry_base,
        )
        .await?;

        match outcome {
            Ok(body) => serde_json::from_str(&body).map_err(|e| {
                CursorBotError::LlmApi(format!("Failed to parse response: {e}\nBody: {body}"))
            }),
            Err((status, body)) => {
                if let Ok(api_err) = serde_json::from_str::<AnthropicApiError>(&body) {
                    return Err(CursorBotError::LlmApi(format!(
                        "{}: {}",
                        api_err.error.error_type, api_err.error.message
                    )));
                }
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(CursorBotError::RateLimited);
                }
                Err(CursorBotError::LlmApi(format!("HTTP {status}: {body}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    chat_url: String,
    retry_base: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &Config) -> Self {
        let base = config
            .llm_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        OpenAiProvider {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            retry_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCall {
    id: String,
    function: OaiFunction,
}

#[derive(Debug, Deserialize)]
struct OaiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, CursorBotError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": translate_messages_to_oai(system, &messages),
        });
        if let Some(tool_defs) = tools.as_deref().filter(|t| !t.is_empty()) {
            body["tools"] = json!(translate_tools_to_oai(tool_defs));
        }

        let outcome = send_with_retry(
            || {
                self.http
                    .post(&self.chat_url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
            },
            self.retry_base,
        )
        .await?;

        match outcome {
            Ok(text) => {
                let oai: OaiResponse = serde_json::from_str(&text).map_err(|e| {
                    CursorBotError::LlmApi(format!(
                        "Failed to parse OpenAI response: {e}\nBody: {text}"
                    ))
                })?;
                Ok(translate_oai_response(oai))
            }
            Err((status, text)) => {
                if let Ok(err) = serde_json::from_str::<OaiErrorResponse>(&text) {
                    return Err(CursorBotError::LlmApi(err.error.message));
                }
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(CursorBotError::RateLimited);
                }
                Err(CursorBotError::LlmApi(format!("HTTP {status}: {text}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Format translation (Anthropic-style internal messages -> OpenAI)
// ---------------------------------------------------------------------------

fn translate_messages_to_oai(system: &str, messages: &[Message]) -> Vec<serde_json::Value> {
    let known_tool_ids = tool_use_ids(messages);
    let mut out: Vec<serde_json::Value> = Vec::new();

    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }

    for msg in messages {
        let blocks = match &msg.content {
            MessageContent::Text(text) => {
                out.push(json!({"role": msg.role, "content": text}));
                continue;
            }
            MessageContent::Blocks(blocks) => blocks,
        };

        if msg.role == "assistant" {
            let text: String = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            let tool_calls: Vec<serde_json::Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": input.to_string(),
                        }
                    })),
                    _ => None,
                })
                .collect();

            let mut m = json!({"role": "assistant"});
            if !text.is_empty() || tool_calls.is_empty() {
                m["content"] = json!(text);
            }
            if !tool_calls.is_empty() {
                m["tool_calls"] = json!(tool_calls);
            }
            out.push(m);
            continue;
        }

        let mut text_parts = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if !known_tool_ids.contains(tool_use_id) {
                        continue;
                    }
                    let c = if *is_error == Some(true) {
                        format!("[Error] {content}")
                    } else {
                        content.clone()
                    };
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": c,
                    }));
                }
                ContentBlock::Text { text } => text_parts.push(text.as_str()),
                ContentBlock::ToolUse { .. } => {}
            }
        }
        if !text_parts.is_empty() {
            out.push(json!({"role": "user", "content": text_parts.join("\n")}));
        }
    }

    out
}

fn translate_tools_to_oai(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

fn translate_oai_response(oai: OaiResponse) -> MessagesResponse {
    let usage = oai.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });
    let Some(choice) = oai.choices.into_iter().next() else {
        return MessagesResponse {
            content: vec![ResponseContentBlock::Text {
                text: "(empty response)".into(),
            }],
            stop_reason: Some("end_turn".into()),
            usage,
        };
    };

    let mut content = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ResponseContentBlock::Text { text });
    }
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let input: serde_json::Value =
            serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| json!({}));
        content.push(ResponseContentBlock::ToolUse {
            id: tc.id,
            name: tc.function.name,
            input,
        });
    }
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    MessagesResponse {
        content,
        stop_reason: Some(stop_reason.into()),
        usage,
    }
}
