use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use teloxide::RequestError;
use tracing::warn;

use crate::text::split_text;
use crate::tools::button_message::Button;

pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Markup used for a delivery attempt, richest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFormat {
    MarkdownV2,
    Html,
    Plain,
}

impl DeliveryFormat {
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => DeliveryFormat::MarkdownV2,
            2 => DeliveryFormat::Html,
            _ => DeliveryFormat::Plain,
        }
    }

    pub fn render(self, text: &str) -> (String, Option<ParseMode>) {
        match self {
            DeliveryFormat::MarkdownV2 => (render_markdown_v2(text), Some(ParseMode::MarkdownV2)),
            DeliveryFormat::Html => (escape_html(text), Some(ParseMode::Html)),
            DeliveryFormat::Plain => (text.to_string(), None),
        }
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_markdown_v2(text: &str) -> String {
    const RESERVED: &str = r"\_*[]()~`>#+-=|{}.!";
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        if RESERVED.contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Inside code entities only backslash and backtick need escaping.
fn escape_code(text: &str) -> String {
    text.replace('\\', r"\\").replace('`', r"\`")
}

/// Escape plain text, turning `**bold**` pairs into MarkdownV2 bold.
fn render_bold(segment: &str) -> String {
    let parts: Vec<&str> = segment.split("**").collect();
    // An odd number of parts means every `**` is paired
    if parts.len() % 2 == 0 {
        return escape_markdown_v2(segment);
    }
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            if i % 2 == 1 && !part.is_empty() {
                format!("*{}*", escape_markdown_v2(part))
            } else {
                escape_markdown_v2(part)
            }
        })
        .collect()
}

fn render_line(line: &str) -> String {
    let parts: Vec<&str> = line.split('`').collect();
    if parts.len() % 2 == 0 {
        return render_bold(line);
    }
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            if i % 2 == 1 {
                format!("`{}`", escape_code(part))
            } else {
                render_bold(part)
            }
        })
        .collect()
}

/// Render LLM-style markdown as MarkdownV2 that Telegram accepts: fenced
/// and inline code survive, `**bold**` becomes bold, everything else is escaped.
pub fn render_markdown_v2(text: &str) -> String {
    let mut in_fence = false;
    text.split('\n')
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                line.to_string()
            } else if in_fence {
                escape_code(line)
            } else {
                render_line(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One URL button per row. Buttons whose URL does not parse are skipped.
pub fn build_keyboard(buttons: &[Button]) -> Option<InlineKeyboardMarkup> {
    let rows: Vec<Vec<InlineKeyboardButton>> = buttons
        .iter()
        .filter_map(|b| match reqwest::Url::parse(&b.url) {
            Ok(url) => Some(vec![InlineKeyboardButton::url(b.label.clone(), url)]),
            Err(e) => {
                warn!("Skipping button {:?} with invalid url {}: {e}", b.label, b.url);
                None
            }
        })
        .collect();
    if rows.is_empty() {
        None
    } else {
        Some(InlineKeyboardMarkup::new(rows))
    }
}

/// Send one chunk, falling back MarkdownV2 -> HTML -> plain text with a
/// growing pause between attempts. Returns the last error if all fail.
pub async fn send_chunk(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    keyboard: Option<&InlineKeyboardMarkup>,
) -> Result<(), RequestError> {
    let mut attempt = 1;
    loop {
        let format = DeliveryFormat::for_attempt(attempt);
        let (body, parse_mode) = format.render(text);
        let mut req = bot.send_message(chat_id, body);
        if let Some(mode) = parse_mode {
            req = req.parse_mode(mode);
        }
        if let Some(markup) = keyboard {
            req = req.reply_markup(markup.clone());
        }

        match req.await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
                warn!("Telegram {format:?} send to {chat_id} failed (attempt {attempt}): {e}");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Send `text` in 4096-char chunks. The keyboard goes on the last chunk.
pub async fn send_response(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    keyboard: Option<&InlineKeyboardMarkup>,
) -> Result<(), RequestError> {
    let chunks = split_text(text, TELEGRAM_MAX_MESSAGE_LEN);
    let last = chunks.len().saturating_sub(1);
    for (i, chunk) in chunks.iter().enumerate() {
        let markup = if i == last { keyboard } else { None };
        send_chunk(bot, chat_id, chunk, markup).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn test_attempt_formats() {
        assert_eq!(DeliveryFormat::for_attempt(1), DeliveryFormat::MarkdownV2);
        assert_eq!(DeliveryFormat::for_attempt(2), DeliveryFormat::Html);
        assert_eq!(DeliveryFormat::for_attempt(3), DeliveryFormat::Plain);
        let (plain, mode) = DeliveryFormat::Plain.render("a_b");
        assert_eq!(plain, "a_b");
        assert!(mode.is_none());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>a & b</b>"), "&lt;b&gt;a &amp; b&lt;/b&gt;");
    }

    #[test]
    fn test_escape_markdown_v2_reserved_chars() {
        assert_eq!(
            escape_markdown_v2("task_1 (v2.0)! #tag"),
            r"task\_1 \(v2\.0\)\! \#tag"
        );
    }

    #[test]
    fn test_render_markdown_v2_bold_and_code() {
        assert_eq!(
            render_markdown_v2("**Done** see `a_b.rs` now."),
            r"*Done* see `a_b.rs` now\."
        );
        // Unpaired markers are escaped literally
        assert_eq!(render_markdown_v2("2 ** 3"), r"2 \*\* 3");
        assert_eq!(render_markdown_v2("it`s"), r"it\`s");
    }

    #[test]
    fn test_render_markdown_v2_fenced_code() {
        let input = "Run:\n```\nlet x = a_b!();\n```\nok.";
        assert_eq!(
            render_markdown_v2(input),
            "Run:\n```\nlet x = a_b!();\n```\nok\\."
        );
    }

    #[test]
    fn test_build_keyboard() {
        let buttons = vec![
            Button {
                label: "Open in Cursor".into(),
                url: "https://cursor.com/agents?id=bc-1".into(),
            },
            Button {
                label: "Broken".into(),
                url: "not a url".into(),
            },
            Button {
                label: "Repository".into(),
                url: "https://github.com/a/b".into(),
            },
        ];
        let markup = build_keyboard(&buttons).unwrap();
        assert_eq!(markup.inline_keyboard.len(), 2);
        let first = &markup.inline_keyboard[0][0];
        assert_eq!(first.text, "Open in Cursor");
        match &first.kind {
            InlineKeyboardButtonKind::Url(url) => {
                assert_eq!(url.as_str(), "https://cursor.com/agents?id=bc-1")
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(build_keyboard(&[]).is_none());
    }
}
