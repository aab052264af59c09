//! Shared error, LLM wire types, task status and text helpers for cursorbot.

pub mod error;
pub mod llm_types;
pub mod task;
pub mod text;
