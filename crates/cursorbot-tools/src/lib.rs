//! Tool runtime shared by cursorbot's LLM tools.

pub mod runtime;
