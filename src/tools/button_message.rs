use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{required_str, schema_object, Tool, ToolResult};
use cursorbot_core::llm_types::ToolDefinition;

pub const BUTTON_MESSAGE_TYPE: &str = "button_message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

/// Text plus link buttons, rendered by the chat layer instead of plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonMessage {
    pub text: String,
    pub buttons: Vec<Button>,
}

impl ButtonMessage {
    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "type": BUTTON_MESSAGE_TYPE,
            "text": self.text,
            "buttons": self.buttons,
        })
    }
}

/// Parse a tool result payload tagged as a button message.
pub fn parse_button_message(content: &str) -> Option<ButtonMessage> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    if value.get("type").and_then(|t| t.as_str()) != Some(BUTTON_MESSAGE_TYPE) {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

pub struct SendButtonMessageTool;

#[async_trait]
impl Tool for SendButtonMessageTool {
    fn name(&self) -> &str {
        "send_button_message"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "send_button_message".into(),
            description: "Reply to the user with a message that has clickable link buttons (for example a task link and its repository). Use this as the final answer when links are useful; the text is shown above the buttons.".into(),
            input_schema: schema_object(
                json!({
                    "text": {
                        "type": "string",
                        "description": "Message text shown above the buttons"
                    },
                    "buttons": {
                        "type": "array",
                        "description": "Link buttons, in display order",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "url": {"type": "string", "description": "http(s) URL"}
                            },
                            "required": ["label", "url"]
                        }
                    }
                }),
                &["text", "buttons"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let text = match required_str(&input, "text") {
            Ok(t) => t.to_string(),
            Err(e) => return e,
        };
        let raw_buttons = input
            .get("buttons")
            .and_then(|b| b.as_array())
            .cloned()
            .unwrap_or_default();

        let mut buttons = Vec::with_capacity(raw_buttons.len());
        for raw in raw_buttons {
            let button: Button = match serde_json::from_value(raw) {
                Ok(b) => b,
                Err(e) => return ToolResult::error_json(format!("Invalid button: {e}")),
            };
            if button.label.trim().is_empty() {
                return ToolResult::error_json("Button label must not be empty");
            }
            if !is_http_url(&button.url) {
                return ToolResult::error_json(format!(
                    "Button url must be an http(s) URL: {}",
                    button.url
                ));
            }
            buttons.push(button);
        }
        if buttons.is_empty() {
            return ToolResult::error_json("At least one button is required");
        }

        ToolResult::json(ButtonMessage { text, buttons }.to_payload())
    }
}
