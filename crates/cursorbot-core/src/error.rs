use thiserror::Error;

#[derive(Error, Debug)]
pub enum CursorBotError {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("Rate limited, retry after backoff")]
    RateLimited,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cursor API error ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Config error: {0}")]
    Config(String),
}
