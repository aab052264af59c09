//! Process-level plumbing for cursorbot: log sinks and voice transcription.

pub mod logging;
pub mod transcribe;
