pub mod agent_engine;
pub mod channels;
pub mod chat_commands;
pub mod config;
pub mod cursor;
pub mod llm;
pub mod runtime;
pub mod task_monitor;
pub mod tools;

pub use channels::telegram;
pub use cursorbot_app::logging;
pub use cursorbot_app::transcribe;
pub use cursorbot_core::error;
pub use cursorbot_core::llm_types;
pub use cursorbot_core::task;
pub use cursorbot_core::text;
pub use cursorbot_storage::db;
pub use cursorbot_storage::image_cache;
