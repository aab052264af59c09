use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cursorbot_core::error::CursorBotError;
use cursorbot_core::llm_types::{ContentBlock, Usage};
use cursorbot_core::task::{TaskStatus, TERMINAL_STATUSES};

const SCHEMA_VERSION_CURRENT: i64 = 1;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, CursorBotError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, CursorBotError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| CursorBotError::ToolExecution(format!("DB task join error: {e}")))?
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub sender_name: String,
    pub content: String,
    pub is_from_bot: bool,
    pub timestamp: String,
}

/// One LLM-visible message of a conversation, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ConversationMessage {
    User { content: String },
    Assistant { blocks: Vec<ContentBlock> },
    Tool { results: Vec<ContentBlock> },
}

impl ConversationMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ConversationMessage::User { .. } => "user",
            ConversationMessage::Assistant { .. } => "assistant",
            ConversationMessage::Tool { .. } => "tool",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredConversationMessage {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub message: ConversationMessage,
    pub step_number: i64,
    pub is_final: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallTrace {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultTrace {
    pub tool_use_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// Diagnostic trace of a single LLM round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub tool_calls: Vec<ToolCallTrace>,
    pub tool_results: Vec<ToolResultTrace>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct StoredStep {
    pub id: i64,
    pub step_number: i64,
    pub trace: StepTrace,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub composer_id: String,
    pub repo_url: String,
    pub task_description: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

fn get_schema_version(conn: &Connection) -> Result<i64, CursorBotError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), CursorBotError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

fn terminal_status_list() -> String {
    TERMINAL_STATUSES
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        chat_id: row.get(2)?,
        composer_id: row.get(3)?,
        repo_url: row.get(4)?,
        task_description: row.get(5)?,
        status: TaskStatus::parse(&row.get::<_, String>(6)?),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn json_column_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

const TASK_COLUMNS: &str =
    "id, user_id, chat_id, composer_id, repo_url, task_description, status, created_at, updated_at";

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open (or create) the database file, creating its parent directory.
    pub fn new(db_path: &str) -> Result<Self, CursorBotError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                chat_id INTEGER PRIMARY KEY,
                chat_title TEXT,
                chat_type TEXT NOT NULL DEFAULT 'private',
                last_message_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                sender_name TEXT NOT NULL,
                content TEXT NOT NULL,
                is_from_bot INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (id, chat_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp
                ON messages(chat_id, timestamp);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                message_data TEXT NOT NULL,
                message_type TEXT NOT NULL,
                step_number INTEGER NOT NULL DEFAULT 0,
                is_final INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversation_messages_user_chat
                ON conversation_messages(user_id, chat_id, id);

            CREATE TABLE IF NOT EXISTS conversation_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                step_number INTEGER NOT NULL,
                step_data TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversation_steps_user_chat
                ON conversation_steps(user_id, chat_id, id);

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                composer_id TEXT NOT NULL UNIQUE,
                repo_url TEXT NOT NULL,
                task_description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'CREATING',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_user_chat_status
                ON tasks(user_id, chat_id, status);

            CREATE TABLE IF NOT EXISTS db_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        if get_schema_version(&conn)? < SCHEMA_VERSION_CURRENT {
            set_schema_version(&conn, SCHEMA_VERSION_CURRENT)?;
        }

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // --- Users / chats / raw messages ---

    pub fn upsert_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<(), CursorBotError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (user_id, username, first_name, last_seen_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                username = ?2,
                first_name = ?3,
                last_seen_at = ?4",
            params![user_id, username, first_name, now],
        )?;
        Ok(())
    }

    pub fn upsert_chat(
        &self,
        chat_id: i64,
        chat_title: Option<&str>,
        chat_type: &str,
    ) -> Result<(), CursorBotError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO chats (chat_id, chat_title, chat_type, last_message_time)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET
                chat_title = COALESCE(?2, chat_title),
                chat_type = ?3,
                last_message_time = ?4",
            params![chat_id, chat_title, chat_type, now],
        )?;
        Ok(())
    }

    pub fn store_message(&self, msg: &StoredMessage) -> Result<(), CursorBotError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO messages (id, chat_id, user_id, sender_name, content, is_from_bot, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.id,
                msg.chat_id,
                msg.user_id,
                msg.sender_name,
                msg.content,
                msg.is_from_bot as i32,
                msg.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_messages(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, CursorBotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, user_id, sender_name, content, is_from_bot, timestamp
             FROM messages
             WHERE chat_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let mut messages = stmt
            .query_map(params![chat_id, limit as i64], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    user_id: row.get(2)?,
                    sender_name: row.get(3)?,
                    content: row.get(4)?,
                    is_from_bot: row.get::<_, i32>(5)? != 0,
                    timestamp: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse so oldest first
        messages.reverse();
        Ok(messages)
    }

    // --- Conversation log ---

    pub fn append_conversation_message(
        &self,
        user_id: i64,
        chat_id: i64,
        message: &ConversationMessage,
        step_number: i64,
        is_final: bool,
    ) -> Result<i64, CursorBotError> {
        let data = serde_json::to_string(message)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversation_messages
                (user_id, chat_id, message_data, message_type, step_number, is_final, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                chat_id,
                data,
                message.message_type(),
                step_number,
                is_final as i32,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Last `limit` conversation messages for the pair, oldest first.
    pub fn get_conversation_messages(
        &self,
        user_id: i64,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredConversationMessage>, CursorBotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, chat_id, message_data, step_number, is_final, created_at
             FROM conversation_messages
             WHERE user_id = ?1 AND chat_id = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let mut rows = stmt
            .query_map(params![user_id, chat_id, limit as i64], |row| {
                let raw: String = row.get(3)?;
                let message = serde_json::from_str::<ConversationMessage>(&raw)
                    .map_err(|e| json_column_error(3, e))?;
                Ok(StoredConversationMessage {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    chat_id: row.get(2)?,
                    message,
                    step_number: row.get(4)?,
                    is_final: row.get::<_, i32>(5)? != 0,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Drop the conversation log and step traces for the pair.
    pub fn clear_conversation(&self, user_id: i64, chat_id: i64) -> Result<usize, CursorBotError> {
        let conn = self.lock_conn();
        let removed = conn.execute(
            "DELETE FROM conversation_messages WHERE user_id = ?1 AND chat_id = ?2",
            params![user_id, chat_id],
        )?;
        conn.execute(
            "DELETE FROM conversation_steps WHERE user_id = ?1 AND chat_id = ?2",
            params![user_id, chat_id],
        )?;
        Ok(removed)
    }

    pub fn append_conversation_step(
        &self,
        user_id: i64,
        chat_id: i64,
        step_number: i64,
        trace: &StepTrace,
    ) -> Result<i64, CursorBotError> {
        let data = serde_json::to_string(trace)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversation_steps (user_id, chat_id, step_number, step_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                chat_id,
                step_number,
                data,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_conversation_steps(
        &self,
        user_id: i64,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredStep>, CursorBotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, step_number, step_data, created_at
             FROM conversation_steps
             WHERE user_id = ?1 AND chat_id = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let mut steps = stmt
            .query_map(params![user_id, chat_id, limit as i64], |row| {
                let raw: String = row.get(2)?;
                let trace = serde_json::from_str::<StepTrace>(&raw)
                    .map_err(|e| json_column_error(2, e))?;
                Ok(StoredStep {
                    id: row.get(0)?,
                    step_number: row.get(1)?,
                    trace,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        steps.reverse();
        Ok(steps)
    }

    // --- Tasks ---

    pub fn create_task(
        &self,
        user_id: i64,
        chat_id: i64,
        composer_id: &str,
        repo_url: &str,
        task_description: &str,
        status: &TaskStatus,
    ) -> Result<i64, CursorBotError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks
                (user_id, chat_id, composer_id, repo_url, task_description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                user_id,
                chat_id,
                composer_id,
                repo_url,
                task_description,
                status.as_str(),
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task_by_composer_id(
        &self,
        composer_id: &str,
    ) -> Result<Option<TaskRecord>, CursorBotError> {
        let conn = self.lock_conn();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE composer_id = ?1"),
                params![composer_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn get_active_tasks_for_chat(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Vec<TaskRecord>, CursorBotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE user_id = ?1 AND chat_id = ?2 AND status NOT IN ({})
             ORDER BY id ASC",
            terminal_status_list()
        ))?;
        let tasks = stmt
            .query_map(params![user_id, chat_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn get_all_active_tasks(&self) -> Result<Vec<TaskRecord>, CursorBotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status NOT IN ({})
             ORDER BY id ASC",
            terminal_status_list()
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Returns true only when the stored status actually changed.
    pub fn update_task_status(
        &self,
        composer_id: &str,
        status: &TaskStatus,
    ) -> Result<bool, CursorBotError> {
        let conn = self.lock_conn();
        let rows = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2
             WHERE composer_id = ?3 AND status != ?1",
            params![
                status.as_str(),
                chrono::Utc::now().to_rfc3339(),
                composer_id
            ],
        )?;
        Ok(rows > 0)
    }
}
