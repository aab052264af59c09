use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{error, info, warn};

use crate::agent_engine::{process_with_agent, AgentReply, AgentRequestContext};
use crate::channels::delivery::{build_keyboard, send_response};
use crate::chat_commands::handle_chat_command;
use crate::db::{call_blocking, StoredMessage};
use crate::error::CursorBotError;
use crate::image_cache::{CachedImage, ImageCache};
use crate::runtime::AppState;
use crate::task_monitor::ChatNotifier;
use crate::text::preview;
use crate::tools::button_message::ButtonMessage;

const TYPING_REFRESH: std::time::Duration = std::time::Duration::from_secs(4);

pub async fn start_telegram_bot(state: Arc<AppState>, bot: Bot) -> anyhow::Result<()> {
    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn is_username_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Case-insensitive removal of every `@username` mention. `None` when absent.
/// `@username_admin` is a different user and is left alone.
pub fn strip_mention(text: &str, bot_username: &str) -> Option<String> {
    if bot_username.is_empty() {
        return None;
    }
    let needle = format!("@{bot_username}");
    let mut out = String::with_capacity(text.len());
    let mut found = false;
    let mut i = 0;
    while i < text.len() {
        let end = i + needle.len();
        let matches = text
            .get(i..end)
            .is_some_and(|s| s.eq_ignore_ascii_case(&needle))
            && !text[end..].chars().next().is_some_and(is_username_char);
        if matches {
            found = true;
            i = end;
            continue;
        }
        let Some(ch) = text[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }
    if found {
        Some(out.split_whitespace().collect::<Vec<_>>().join(" "))
    } else {
        None
    }
}

/// Text the bot should act on, or `None` when a mention-only group message
/// does not mention the bot.
pub fn addressed_text(
    text: &str,
    is_private: bool,
    mention_only: bool,
    bot_username: &str,
) -> Option<String> {
    match strip_mention(text, bot_username) {
        Some(stripped) => Some(stripped),
        None if is_private || !mention_only => Some(text.trim().to_string()),
        None => None,
    }
}

/// What the router does with an inbound message once its photo, if any,
/// is cached and its voice note, if any, is transcribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// Captionless photo: acknowledge it and wait for the task request.
    AcknowledgeImage,
    /// Hand the text (mention stripped) to the agent.
    Process(String),
    Ignore,
}

pub fn inbound_action(
    text: &str,
    has_photo: bool,
    is_private: bool,
    mention_only: bool,
    bot_username: &str,
) -> InboundAction {
    if text.trim().is_empty() {
        return if has_photo && (is_private || !mention_only) {
            InboundAction::AcknowledgeImage
        } else {
            InboundAction::Ignore
        };
    }
    match addressed_text(text, is_private, mention_only, bot_username) {
        Some(text) if !text.is_empty() => InboundAction::Process(text),
        _ => InboundAction::Ignore,
    }
}

pub fn image_received_message(ttl_secs: u64) -> String {
    let ttl_mins = (ttl_secs / 60).max(1);
    format!("📸 Image received. It will be attached to the task you request next (kept for {ttl_mins} minutes).")
}

/// Base64-encode a downloaded photo into the sender's pending attachments.
/// Returns the number of images now waiting.
pub fn cache_photo(
    cache: &ImageCache,
    user_id: i64,
    chat_id: i64,
    bytes: &[u8],
    width: u32,
    height: u32,
) -> Result<usize, CursorBotError> {
    cache.append(
        user_id,
        chat_id,
        CachedImage {
            data: base64_encode(bytes),
            width,
            height,
        },
    )
}

fn sender_name(user: Option<&teloxide::types::User>) -> String {
    user.map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
        .unwrap_or_else(|| "Unknown".into())
}

async fn reply_text(bot: &Bot, chat_id: ChatId, text: &str) {
    if let Err(e) = send_response(bot, chat_id, text, None).await {
        error!("Failed to deliver reply to {chat_id}: {e}");
    }
}

async fn store_outgoing(state: &AppState, chat_id: i64, content: String) {
    let stored = StoredMessage {
        id: uuid::Uuid::new_v4().to_string(),
        chat_id,
        user_id: 0,
        sender_name: state.config.bot_username.clone(),
        content,
        is_from_bot: true,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = call_blocking(state.db.clone(), move |db| db.store_message(&stored)).await {
        warn!("Failed to store bot message for chat {chat_id}: {e}");
    }
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let chat_id = msg.chat.id.0;
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;

    if !state.config.is_allowed(user_id, chat_id) {
        info!("Ignoring message from unauthorized user {user_id} in chat {chat_id}");
        return Ok(());
    }

    let is_private = msg.chat.is_private();
    let chat_type = if is_private { "private" } else { "group" };
    let username = from.username.clone();
    let first_name = from.first_name.clone();
    let chat_title = msg.chat.title().map(str::to_string);
    if let Err(e) = call_blocking(state.db.clone(), move |db| {
        db.upsert_user(user_id, username.as_deref(), Some(&first_name))?;
        db.upsert_chat(chat_id, chat_title.as_deref(), chat_type)
    })
    .await
    {
        warn!("Failed to record user/chat for {chat_id}: {e}");
    }

    let raw_text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or("")
        .to_string();

    if msg.text().is_some() {
        if let Some(reply) = handle_chat_command(&state, user_id, chat_id, &raw_text).await {
            reply_text(&bot, msg.chat.id, &reply).await;
            return Ok(());
        }
    }

    let mut text = raw_text;

    // Telegram lists sizes smallest first
    let photo = msg.photo().and_then(|sizes| sizes.last());
    if let Some(photo) = photo {
        match download_telegram_file(&bot, &photo.file.id.0).await {
            Ok(bytes) => match cache_photo(
                &state.image_cache,
                user_id,
                chat_id,
                &bytes,
                photo.width,
                photo.height,
            ) {
                Ok(count) => info!("Cached image {count} for user {user_id} in chat {chat_id}"),
                Err(e) => error!("Failed to cache image: {e}"),
            },
            Err(e) => error!("Failed to download photo: {e}"),
        }
    }

    if let Some(voice) = msg.voice() {
        let Some(transcriber) = state.transcriber.as_ref() else {
            reply_text(
                &bot,
                msg.chat.id,
                "🎤 Voice messages are not enabled. Set TRANSCRIPTION_API_KEY to turn them on.",
            )
            .await;
            return Ok(());
        };
        let bytes = match download_telegram_file(&bot, &voice.file.id.0).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to download voice message: {e}");
                reply_text(&bot, msg.chat.id, "Sorry, I couldn't download that voice message.")
                    .await;
                return Ok(());
            }
        };
        match transcriber.transcribe(&bytes).await {
            Ok(transcript) => {
                info!("Transcribed voice message in chat {chat_id}");
                text = transcript;
            }
            Err(e) => {
                error!("Voice transcription failed: {e}");
                reply_text(
                    &bot,
                    msg.chat.id,
                    &format!("Sorry, I couldn't transcribe that voice message: {e}"),
                )
                .await;
                return Ok(());
            }
        }
    }

    let sender = sender_name(msg.from.as_ref());
    if !text.trim().is_empty() {
        let inbound = StoredMessage {
            id: msg.id.0.to_string(),
            chat_id,
            user_id,
            sender_name: sender.clone(),
            content: text.clone(),
            is_from_bot: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = call_blocking(state.db.clone(), move |db| db.store_message(&inbound)).await
        {
            warn!("Failed to store message for chat {chat_id}: {e}");
        }
    }

    let text = match inbound_action(
        &text,
        photo.is_some(),
        is_private,
        state.config.mention_only,
        &state.config.bot_username,
    ) {
        InboundAction::Process(text) => text,
        InboundAction::AcknowledgeImage => {
            let ack = image_received_message(state.config.image_cache_ttl_secs);
            reply_text(&bot, msg.chat.id, &ack).await;
            return Ok(());
        }
        InboundAction::Ignore => return Ok(()),
    };

    info!(
        "Processing message from {sender} in chat {chat_id}: {}",
        preview(&text, 100)
    );

    let typing_chat_id = msg.chat.id;
    let typing_bot = bot.clone();
    let typing_handle = tokio::spawn(async move {
        loop {
            let _ = typing_bot
                .send_chat_action(typing_chat_id, ChatAction::Typing)
                .await;
            tokio::time::sleep(TYPING_REFRESH).await;
        }
    });

    let reply = process_with_agent(&state, AgentRequestContext { user_id, chat_id }, &text).await;
    typing_handle.abort();

    let (body, delivered) = match &reply {
        AgentReply::Text(body) => (body.clone(), send_response(&bot, msg.chat.id, body, None).await),
        AgentReply::Buttons(message) => (
            message.text.clone(),
            send_buttons(&bot, msg.chat.id, message).await,
        ),
    };
    match delivered {
        Ok(()) => store_outgoing(&state, chat_id, body).await,
        Err(e) => error!("Failed to deliver reply to chat {chat_id}: {e}"),
    }

    Ok(())
}

pub async fn send_buttons(
    bot: &Bot,
    chat_id: ChatId,
    message: &ButtonMessage,
) -> Result<(), teloxide::RequestError> {
    let keyboard = build_keyboard(&message.buttons);
    send_response(bot, chat_id, &message.text, keyboard.as_ref()).await
}

async fn download_telegram_file(
    bot: &Bot,
    file_id: &str,
) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let file = bot
        .get_file(teloxide::types::FileId(file_id.to_string()))
        .await?;
    let mut buf = Vec::new();
    teloxide::net::Download::download_file(bot, &file.path, &mut buf).await?;
    Ok(buf)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Delivers task monitor notifications through the bot.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatNotifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, message: &ButtonMessage) -> anyhow::Result<()> {
        send_buttons(&self.bot, ChatId(chat_id), message).await?;
        Ok(())
    }
}
