use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use teloxide::requests::Requester;
use tracing::{info, warn};

use crate::channels::telegram::{start_telegram_bot, TelegramNotifier};
use crate::config::Config;
use crate::cursor::{CursorClient, TaskApi};
use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;
use crate::transcribe::Transcriber;
use cursorbot_storage::db::Database;
use cursorbot_storage::image_cache::ImageCache;

pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub llm: Box<dyn LlmProvider>,
    pub api: Arc<dyn TaskApi>,
    pub image_cache: Arc<ImageCache>,
    pub tools: ToolRegistry,
    /// Present only when a transcription key is configured.
    pub transcriber: Option<Transcriber>,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> anyhow::Result<Self> {
        let db = Arc::new(db);
        let llm = crate::llm::create_provider(&config);
        let api: Arc<dyn TaskApi> = Arc::new(CursorClient::from_config(&config)?);
        let image_cache = Arc::new(ImageCache::for_database(
            &config.database_path,
            Duration::from_secs(config.image_cache_ttl_secs),
        ));
        let tools = ToolRegistry::new(&config, db.clone(), api.clone(), image_cache.clone());
        let transcriber = config
            .transcription_api_key
            .as_deref()
            .map(Transcriber::new);

        Ok(AppState {
            config,
            db,
            llm,
            api,
            image_cache,
            tools,
            transcriber,
        })
    }
}

pub async fn run(mut config: Config, db: Database) -> anyhow::Result<()> {
    let bot = teloxide::Bot::new(&config.telegram_bot_token);
    if config.bot_username.is_empty() {
        match bot.get_me().await {
            Ok(me) => {
                if let Some(username) = me.user.username.clone() {
                    info!("Resolved bot username @{username}");
                    config.bot_username = username;
                }
            }
            Err(e) => warn!("Failed to look up bot username: {e}"),
        }
    }
    let state = Arc::new(AppState::new(config, db)?);

    let _sweeper = state
        .image_cache
        .clone()
        .spawn_sweeper(Duration::from_secs(state.config.image_cache_sweep_secs));
    info!(
        "Image cache sweeper started ({}, ttl {}s)",
        state.image_cache.dir().display(),
        state.config.image_cache_ttl_secs
    );

    let notifier = Arc::new(TelegramNotifier::new(bot.clone()));
    let _monitor = crate::task_monitor::spawn_task_monitor(state.clone(), notifier);

    info!("Starting Telegram bot as @{}", state.config.bot_username);
    start_telegram_bot(state, bot)
        .await
        .map_err(|e| anyhow!("Telegram bot stopped: {e}"))
}
