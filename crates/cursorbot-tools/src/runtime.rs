use async_trait::async_trait;
use cursorbot_core::llm_types::ToolDefinition;
use serde_json::json;

pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    pub status_code: Option<i32>,
    pub bytes: usize,
    pub duration_ms: Option<u128>,
    pub error_type: Option<String>,
}

impl ToolResult {
    pub fn success(content: String) -> Self {
        let bytes = content.len();
        ToolResult {
            content,
            is_error: false,
            status_code: Some(0),
            bytes,
            duration_ms: None,
            error_type: None,
        }
    }

    pub fn error(content: String) -> Self {
        let bytes = content.len();
        ToolResult {
            content,
            is_error: true,
            status_code: Some(1),
            bytes,
            duration_ms: None,
            error_type: Some("tool_error".to_string()),
        }
    }

    /// Success carrying a JSON payload.
    pub fn json(value: serde_json::Value) -> Self {
        Self::success(value.to_string())
    }

    /// Failure reported to the model as `{"error": message}`.
    pub fn error_json(message: impl Into<String>) -> Self {
        Self::error(json!({ "error": message.into() }).to_string())
    }

    pub fn with_status_code(mut self, status_code: i32) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

/// Identity of the Telegram user and chat a tool call runs on behalf of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolAuthContext {
    pub caller_user_id: i64,
    pub caller_chat_id: i64,
}

const AUTH_CONTEXT_KEY: &str = "__cursorbot_auth";

pub fn auth_context_from_input(input: &serde_json::Value) -> Option<ToolAuthContext> {
    let ctx = input.get(AUTH_CONTEXT_KEY)?;
    Some(ToolAuthContext {
        caller_user_id: ctx.get("caller_user_id")?.as_i64()?,
        caller_chat_id: ctx.get("caller_chat_id")?.as_i64()?,
    })
}

pub fn inject_auth_context(input: serde_json::Value, auth: &ToolAuthContext) -> serde_json::Value {
    let mut obj = match input {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    obj.insert(
        AUTH_CONTEXT_KEY.to_string(),
        json!({
            "caller_user_id": auth.caller_user_id,
            "caller_chat_id": auth.caller_chat_id,
        }),
    );
    serde_json::Value::Object(obj)
}

/// Caller identity, or the error result tools return when it is missing.
pub fn require_auth_context(input: &serde_json::Value) -> Result<ToolAuthContext, ToolResult> {
    auth_context_from_input(input).ok_or_else(|| {
        ToolResult::error_json("Missing caller context").with_error_type("missing_auth")
    })
}

/// Non-empty, trimmed string parameter.
pub fn required_str<'a>(input: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolResult> {
    match input.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ToolResult::error_json(format!(
            "Missing required parameter: {key}"
        ))
        .with_error_type("invalid_input")),
    }
}

pub fn optional_str<'a>(input: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

pub fn schema_object(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_payload() {
        let r = ToolResult::error_json("Repository not allowed");
        assert!(r.is_error);
        let payload: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(payload["error"], "Repository not allowed");
        assert_eq!(r.error_type.as_deref(), Some("tool_error"));
    }

    #[test]
    fn test_json_success() {
        let r = ToolResult::json(json!({"models": ["a"]}));
        assert!(!r.is_error);
        assert_eq!(r.bytes, r.content.len());
        assert_eq!(r.status_code, Some(0));
    }

    #[test]
    fn test_auth_context_round_trip_through_input() {
        let auth = ToolAuthContext {
            caller_user_id: 42,
            caller_chat_id: -100123,
        };
        let input = inject_auth_context(json!({"task_id": "bc-1"}), &auth);
        assert_eq!(input["task_id"], "bc-1");
        assert_eq!(auth_context_from_input(&input), Some(auth));
        assert_eq!(require_auth_context(&input).ok(), Some(auth));
    }

    #[test]
    fn test_inject_auth_context_into_non_object() {
        let auth = ToolAuthContext {
            caller_user_id: 1,
            caller_chat_id: 2,
        };
        let input = inject_auth_context(json!(null), &auth);
        assert!(input.is_object());
        assert!(auth_context_from_input(&input).is_some());
    }

    #[test]
    fn test_missing_auth_context_is_error() {
        let err = require_auth_context(&json!({})).unwrap_err();
        assert!(err.is_error);
        assert_eq!(err.error_type.as_deref(), Some("missing_auth"));
    }

    #[test]
    fn test_required_and_optional_str() {
        let input = json!({"prompt": "  add tests ", "branch": "  ", "model": "gpt-5"});
        assert_eq!(required_str(&input, "prompt").ok(), Some("add tests"));
        assert!(required_str(&input, "branch").is_err());
        assert!(required_str(&input, "repository").is_err());
        assert_eq!(optional_str(&input, "branch"), None);
        assert_eq!(optional_str(&input, "model"), Some("gpt-5"));
    }

    #[test]
    fn test_schema_object() {
        let schema = schema_object(
            json!({
                "repository": {"type": "string"},
                "branch": {"type": "string"}
            }),
            &["repository"],
        );
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["branch"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "repository");
    }
}
