use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use cursorbot_core::error::CursorBotError;

pub const DEFAULT_IMAGE_TTL: Duration = Duration::from_secs(180);

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImage {
    /// Base64 payload.
    pub data: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageGroup {
    images: Vec<CachedImage>,
    /// Last write in unix millis. Informational; expiry uses the file mtime.
    timestamp: i64,
}

/// Pending photo attachments per (user, chat), one JSON file per pair.
pub struct ImageCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Cache living in `image_cache/` beside the database file.
    pub fn for_database(db_path: &str, ttl: Duration) -> Self {
        let parent = Path::new(db_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::new(parent.join("image_cache"), ttl)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_path(&self, user_id: i64, chat_id: i64) -> PathBuf {
        self.dir.join(format!("{user_id}_{chat_id}.json"))
    }

    fn is_expired(&self, path: &Path) -> std::io::Result<bool> {
        let modified = std::fs::metadata(path)?.modified()?;
        // An mtime in the future counts as fresh.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age > self.ttl)
    }

    /// Images for the pair, oldest first. Expired groups are deleted and read as empty.
    pub fn read(&self, user_id: i64, chat_id: i64) -> Result<Vec<CachedImage>, CursorBotError> {
        let path = self.group_path(user_id, chat_id);
        match self.is_expired(&path) {
            Ok(false) => {}
            Ok(true) => {
                remove_if_present(&path)?;
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            // Cleared or swept between the two calls
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<ImageGroup>(&raw) {
            Ok(group) => Ok(group.images),
            Err(e) => {
                warn!(
                    "Image cache: discarding unreadable group {}: {e}",
                    path.display()
                );
                remove_if_present(&path)?;
                Ok(Vec::new())
            }
        }
    }

    /// Append to the live group (or start a new one) and reset its expiry clock.
    pub fn append(
        &self,
        user_id: i64,
        chat_id: i64,
        image: CachedImage,
    ) -> Result<usize, CursorBotError> {
        let mut images = self.read(user_id, chat_id)?;
        images.push(image);
        let group = ImageGroup {
            images,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self.group_path(user_id, chat_id);
        write_replacing(&path, &serde_json::to_vec(&group)?)?;
        Ok(group.images.len())
    }

    pub fn clear(&self, user_id: i64, chat_id: i64) -> Result<(), CursorBotError> {
        remove_if_present(&self.group_path(user_id, chat_id))?;
        Ok(())
    }

    /// Delete every group older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize, CursorBotError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.is_expired(&path) {
                Ok(true) => {
                    remove_if_present(&path)?;
                    removed += 1;
                }
                Ok(false) => {}
                // Removed concurrently by read/clear
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.sweep() {
                    Ok(0) => {}
                    Ok(n) => info!("Image cache: swept {n} expired group(s)"),
                    Err(e) => warn!("Image cache sweep failed: {e}"),
                }
            }
        })
    }
}

/// Write to a sibling temp file, then rename it over `path`, so a concurrent
/// reader sees either the old group or the new one.
fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
