use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "cursorbot-";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const LOG_RETENTION_DAYS: i64 = 30;

fn env_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

/// Log to hourly files under `<data_dir>/logs`, pruning files older than the retention window.
pub fn init_logging(data_dir: &str) -> Result<()> {
    let log_dir = PathBuf::from(data_dir).join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    cleanup_old_logs(&log_dir, Utc::now(), LOG_RETENTION_DAYS)?;

    let writer = HourlyFileWriter::open(log_dir, LOG_RETENTION_DAYS)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(())
}

pub fn init_console_logging() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

struct OpenHour {
    key: String,
    file: File,
}

/// `MakeWriter` that reopens its file whenever the UTC hour rolls over.
#[derive(Clone)]
struct HourlyFileWriter {
    log_dir: PathBuf,
    retention_days: i64,
    current: Arc<Mutex<OpenHour>>,
}

impl HourlyFileWriter {
    fn open(log_dir: PathBuf, retention_days: i64) -> Result<Self> {
        let key = hour_key(Utc::now());
        let file = open_log_file(&log_dir, &key)?;
        Ok(Self {
            log_dir,
            retention_days,
            current: Arc::new(Mutex::new(OpenHour { key, file })),
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, OpenHour>> {
        self.current
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))
    }
}

impl<'a> MakeWriter<'a> for HourlyFileWriter {
    type Writer = HourlyFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for HourlyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let now = Utc::now();
        let key = hour_key(now);
        let mut current = self.lock()?;
        if current.key != key {
            current.file.flush()?;
            current.file = open_log_file(&self.log_dir, &key)?;
            current.key = key;
            let _ = cleanup_old_logs(&self.log_dir, now, self.retention_days);
        }
        current.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn open_log_file(log_dir: &Path, hour: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{LOG_FILE_PREFIX}{hour}{LOG_FILE_SUFFIX}")))
}

pub fn cleanup_old_logs(log_dir: &Path, now: DateTime<Utc>, retention_days: i64) -> Result<usize> {
    let cutoff = now - Duration::days(retention_days);
    let entries = match fs::read_dir(log_dir) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", log_dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let Some(log_time) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_log_filename_time)
        else {
            continue;
        };
        if log_time < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn parse_log_filename_time(file_name: &str) -> Option<DateTime<Utc>> {
    let body = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let naive =
        NaiveDateTime::parse_from_str(&format!("{body}:00:00"), "%Y-%m-%d-%H:%M:%S").ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
