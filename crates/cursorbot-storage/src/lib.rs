//! Storage and persistence domain for cursorbot.

pub mod db;
pub mod image_cache;
