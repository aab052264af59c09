use crate::error::CursorBotError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_llm_provider() -> String {
    "openai".into()
}
fn default_cursor_api_base_url() -> String {
    "https://api.cursor.com".into()
}
fn default_database_path() -> String {
    "./data/cursorbot.db".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_max_steps() -> usize {
    20
}
fn default_max_history_messages() -> usize {
    50
}
fn default_image_cache_ttl_secs() -> u64 {
    180
}
fn default_image_cache_sweep_secs() -> u64 {
    60
}
fn default_task_monitor_interval_secs() -> u64 {
    60
}
fn default_cursor_request_timeout_secs() -> u64 {
    30
}

const SUPPORTED_PROVIDERS: [&str; 2] = ["openai", "anthropic"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub bot_username: String,
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub llm_base_url: Option<String>,
    #[serde(default)]
    pub cursor_api_key: String,
    #[serde(default = "default_cursor_api_base_url")]
    pub cursor_api_base_url: String,
    /// Repository URLs tasks may target. Empty means any repository.
    #[serde(default)]
    pub allowed_repositories: Vec<String>,
    /// Telegram user or chat ids allowed to talk to the bot. Empty means everyone.
    #[serde(default)]
    pub allowed_ids: Vec<i64>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub mention_only: bool,
    #[serde(default)]
    pub transcription_api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_image_cache_ttl_secs")]
    pub image_cache_ttl_secs: u64,
    #[serde(default = "default_image_cache_sweep_secs")]
    pub image_cache_sweep_secs: u64,
    #[serde(default = "default_task_monitor_interval_secs")]
    pub task_monitor_interval_secs: u64,
    #[serde(default = "default_cursor_request_timeout_secs")]
    pub cursor_request_timeout_secs: u64,
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Directory holding the database file; logs and the image cache live beside it.
    pub fn data_dir(&self) -> PathBuf {
        std::path::Path::new(&self.database_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, CursorBotError> {
        if let Ok(custom) = std::env::var("CURSORBOT_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(CursorBotError::Config(format!(
                "CURSORBOT_CONFIG points to non-existent file: {custom}"
            )));
        }

        for candidate in ["./cursorbot.config.yaml", "./cursorbot.config.yml"] {
            if std::path::Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    /// Optional YAML file, then environment overrides, then validation.
    pub fn load() -> Result<Self, CursorBotError> {
        let mut config = match Self::resolve_config_path()? {
            Some(path) => {
                let path_str = path.to_string_lossy().to_string();
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    CursorBotError::Config(format!("Failed to read {path_str}: {e}"))
                })?;
                serde_yaml::from_str::<Config>(&content).map_err(|e| {
                    CursorBotError::Config(format!("Failed to parse {path_str}: {e}"))
                })?
            }
            None => Self::from_yaml("{}")?,
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.post_deserialize()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CursorBotError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CursorBotError::Config(format!("Failed to parse config: {e}")))
    }

    /// Overlay values from the environment (or any lookup) onto the config.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), CursorBotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *target = value.trim().to_string();
            }
        };
        set(&mut self.telegram_bot_token, "TELEGRAM_BOT_TOKEN");
        set(&mut self.bot_username, "BOT_USERNAME");
        set(&mut self.llm_provider, "LLM_PROVIDER");
        set(&mut self.api_key, "LLM_API_KEY");
        set(&mut self.model, "LLM_MODEL");
        set(&mut self.cursor_api_key, "CURSOR_API_KEY");
        set(&mut self.cursor_api_base_url, "CURSOR_API_BASE_URL");
        set(&mut self.database_path, "DATABASE_PATH");

        if let Some(url) = lookup("LLM_BASE_URL") {
            self.llm_base_url = Some(url);
        }
        if let Some(prompt) = lookup("CUSTOM_PROMPT") {
            self.custom_prompt = Some(prompt);
        }
        if let Some(key) = lookup("TRANSCRIPTION_API_KEY") {
            self.transcription_api_key = Some(key);
        }
        if let Some(flag) = lookup("MENTION_ONLY") {
            self.mention_only = parse_bool(&flag);
        }
        if let Some(raw) = lookup("ALLOWED_REPOSITORIES") {
            self.allowed_repositories = split_list(&raw).map(str::to_string).collect();
        }
        if let Some(raw) = lookup("ALLOWED_IDS") {
            self.allowed_ids = split_list(&raw)
                .map(|id| {
                    id.parse::<i64>().map_err(|_| {
                        CursorBotError::Config(format!("ALLOWED_IDS contains invalid id: {id}"))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), CursorBotError> {
        self.llm_provider = self.llm_provider.trim().to_lowercase();
        if self.llm_provider.is_empty() {
            self.llm_provider = default_llm_provider();
        }
        if !SUPPORTED_PROVIDERS.contains(&self.llm_provider.as_str()) {
            return Err(CursorBotError::Config(format!(
                "Unsupported llm_provider '{}' (expected one of: {})",
                self.llm_provider,
                SUPPORTED_PROVIDERS.join(", ")
            )));
        }

        if self.model.trim().is_empty() {
            self.model = match self.llm_provider.as_str() {
                "anthropic" => "claude-sonnet-4-5-20250929".into(),
                _ => "gpt-4o".into(),
            };
        }

        self.llm_base_url = non_empty(self.llm_base_url.take());
        self.custom_prompt = non_empty(self.custom_prompt.take());
        self.transcription_api_key = non_empty(self.transcription_api_key.take());

        self.bot_username = self.bot_username.trim().trim_start_matches('@').to_string();
        self.cursor_api_base_url = self.cursor_api_base_url.trim().trim_end_matches('/').into();
        if self.cursor_api_base_url.is_empty() {
            self.cursor_api_base_url = default_cursor_api_base_url();
        }
        if self.database_path.trim().is_empty() {
            self.database_path = default_database_path();
        }
        self.allowed_repositories = self
            .allowed_repositories
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();

        if self.max_steps == 0 {
            self.max_steps = default_max_steps();
        }
        if self.max_history_messages == 0 {
            self.max_history_messages = default_max_history_messages();
        }
        if self.image_cache_ttl_secs == 0 {
            self.image_cache_ttl_secs = default_image_cache_ttl_secs();
        }
        if self.image_cache_sweep_secs == 0 {
            self.image_cache_sweep_secs = default_image_cache_sweep_secs();
        }
        if self.task_monitor_interval_secs == 0 {
            self.task_monitor_interval_secs = default_task_monitor_interval_secs();
        }
        if self.cursor_request_timeout_secs == 0 {
            self.cursor_request_timeout_secs = default_cursor_request_timeout_secs();
        }

        // Validate required credentials
        if self.telegram_bot_token.trim().is_empty() {
            return Err(CursorBotError::Config(
                "TELEGRAM_BOT_TOKEN is required".into(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(CursorBotError::Config("LLM_API_KEY is required".into()));
        }
        if self.cursor_api_key.trim().is_empty() {
            return Err(CursorBotError::Config("CURSOR_API_KEY is required".into()));
        }
        // Group mentions are matched against the username
        if self.mention_only && self.bot_username.is_empty() {
            return Err(CursorBotError::Config(
                "BOT_USERNAME is required when MENTION_ONLY is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn is_allowed(&self, user_id: i64, chat_id: i64) -> bool {
        self.allowed_ids.is_empty()
            || self.allowed_ids.contains(&user_id)
            || self.allowed_ids.contains(&chat_id)
    }

    #[cfg(test)]
    pub fn test_config() -> Config {
        Config {
            telegram_bot_token: "tok".into(),
            bot_username: "cursor_bot".into(),
            llm_provider: "openai".into(),
            api_key: "key".into(),
            model: "gpt-4o".into(),
            llm_base_url: None,
            cursor_api_key: "cursor-key".into(),
            cursor_api_base_url: "https://api.cursor.com".into(),
            allowed_repositories: vec![],
            allowed_ids: vec![],
            database_path: "./data/cursorbot.db".into(),
            custom_prompt: None,
            mention_only: false,
            transcription_api_key: None,
            max_tokens: 8192,
            max_steps: 20,
            max_history_messages: 50,
            image_cache_ttl_secs: 180,
            image_cache_sweep_secs: 60,
            task_monitor_interval_secs: 60,
            cursor_request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config = Config::from_yaml("telegram_bot_token: tok\n").unwrap();
        assert_eq!(config.llm_provider, "openai");
        assert_eq!(config.cursor_api_base_url, "https://api.cursor.com");
        assert_eq!(config.database_path, "./data/cursorbot.db");
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.max_history_messages, 50);
        assert_eq!(config.image_cache_ttl_secs, 180);
        assert_eq!(config.image_cache_sweep_secs, 60);
        assert_eq!(config.task_monitor_interval_secs, 60);
        assert!(config.allowed_repositories.is_empty());
        assert!(!config.mention_only);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_yaml("{}").unwrap();
        config
            .apply_env_overrides(lookup_from(&[
                ("TELEGRAM_BOT_TOKEN", "tg"),
                ("BOT_USERNAME", "@cursor_bot"),
                ("LLM_PROVIDER", "Anthropic"),
                ("LLM_API_KEY", "llm"),
                ("CURSOR_API_KEY", "cur"),
                (
                    "ALLOWED_REPOSITORIES",
                    "https://github.com/a/b, ,https://github.com/c/d",
                ),
                ("ALLOWED_IDS", "42, -100123"),
                ("DATABASE_PATH", "/srv/bot/state.db"),
                ("MENTION_ONLY", "TRUE"),
                ("CUSTOM_PROMPT", "Be brief."),
            ]))
            .unwrap();
        config.post_deserialize().unwrap();

        assert_eq!(config.telegram_bot_token, "tg");
        assert_eq!(config.bot_username, "cursor_bot");
        assert_eq!(config.llm_provider, "anthropic");
        assert_eq!(config.model, "claude-sonnet-4-5-20250929");
        assert_eq!(
            config.allowed_repositories,
            vec!["https://github.com/a/b", "https://github.com/c/d"]
        );
        assert_eq!(config.allowed_ids, vec![42, -100123]);
        assert!(config.mention_only);
        assert_eq!(config.custom_prompt.as_deref(), Some("Be brief."));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/bot"));
    }

    #[test]
    fn test_invalid_allowed_ids_rejected() {
        let mut config = Config::test_config();
        let err = config
            .apply_env_overrides(lookup_from(&[("ALLOWED_IDS", "12,abc")]))
            .unwrap_err();
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        for (field, expected) in [
            ("telegram", "TELEGRAM_BOT_TOKEN"),
            ("llm", "LLM_API_KEY"),
            ("cursor", "CURSOR_API_KEY"),
        ] {
            let mut config = Config::test_config();
            match field {
                "telegram" => config.telegram_bot_token.clear(),
                "llm" => config.api_key.clear(),
                _ => config.cursor_api_key.clear(),
            }
            let err = config.post_deserialize().unwrap_err();
            assert!(err.to_string().contains(expected), "{err}");
        }
    }

    #[test]
    fn test_mention_only_requires_username() {
        let mut config = Config::test_config();
        config.mention_only = true;
        config.bot_username = " @ ".into();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("BOT_USERNAME"), "{err}");

        let mut config = Config::test_config();
        config.mention_only = true;
        config.bot_username = "@MyCursorBot".into();
        config.post_deserialize().unwrap();
        assert_eq!(config.bot_username, "MyCursorBot");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = Config::test_config();
        config.llm_provider = "ollama".into();
        assert!(config.post_deserialize().is_err());
    }

    #[test]
    fn test_post_deserialize_normalizes_optionals_and_zeroes() {
        let mut config = Config::test_config();
        config.llm_base_url = Some("  ".into());
        config.custom_prompt = Some("".into());
        config.transcription_api_key = Some(" ".into());
        config.cursor_api_base_url = "https://cursor.example/".into();
        config.max_steps = 0;
        config.image_cache_ttl_secs = 0;
        config.post_deserialize().unwrap();
        assert!(config.llm_base_url.is_none());
        assert!(config.custom_prompt.is_none());
        assert!(config.transcription_api_key.is_none());
        assert_eq!(config.cursor_api_base_url, "https://cursor.example");
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.image_cache_ttl_secs, 180);
    }

    #[test]
    fn test_is_allowed() {
        let mut config = Config::test_config();
        assert!(config.is_allowed(1, 2));
        config.allowed_ids = vec![42, -100];
        assert!(config.is_allowed(42, 7));
        assert!(config.is_allowed(7, -100));
        assert!(!config.is_allowed(7, 8));
    }

    #[test]
    fn test_data_dir_for_bare_filename() {
        let mut config = Config::test_config();
        config.database_path = "bot.db".into();
        assert_eq!(config.data_dir(), PathBuf::from("."));
    }
}
