use anyhow::{anyhow, Context, Result};
use reqwest::multipart;

pub const DEFAULT_TRANSCRIPTION_BASE_URL: &str = "https://api.openai.com/v1";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Whisper-compatible speech-to-text client for Telegram voice notes.
pub struct Transcriber {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl Transcriber {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_TRANSCRIPTION_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Transcribe an OGG/Opus voice note.
    pub async fn transcribe(&self, audio_bytes: &[u8]) -> Result<String> {
        let part = multipart::Part::bytes(audio_bytes.to_vec())
            .file_name("voice.ogg")
            .mime_str("audio/ogg")?;
        let form = multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);

        let resp = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Transcription API error HTTP {status}: {body}"));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse transcription response")?;
        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::trim)
            .ok_or_else(|| anyhow!("Transcription response missing 'text' field"))?;
        if text.is_empty() {
            return Err(anyhow!("Transcription returned no text"));
        }
        Ok(text.to_string())
    }
}
