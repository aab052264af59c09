use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a remote task as reported by the Cursor API.
///
/// The remote side is the system of record and may report values we do not
/// know about; those are kept verbatim in `Other` and treated as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Creating,
    Running,
    Finished,
    Error,
    Expired,
    Cancelled,
    Other(String),
}

/// Stored forms of every terminal status.
pub const TERMINAL_STATUSES: [&str; 4] = ["FINISHED", "ERROR", "EXPIRED", "CANCELLED"];

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "CREATING" => TaskStatus::Creating,
            "RUNNING" => TaskStatus::Running,
            "FINISHED" => TaskStatus::Finished,
            "ERROR" => TaskStatus::Error,
            "EXPIRED" => TaskStatus::Expired,
            "CANCELLED" | "CANCELED" => TaskStatus::Cancelled,
            _ => TaskStatus::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Creating => "CREATING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Expired => "EXPIRED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Other(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Error | TaskStatus::Expired | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        TaskStatus::parse(&value)
    }
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        TaskStatus::parse(value)
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(TaskStatus::parse("running"), TaskStatus::Running);
        assert_eq!(TaskStatus::parse(" Finished "), TaskStatus::Finished);
        assert_eq!(TaskStatus::parse("canceled"), TaskStatus::Cancelled);
    }

    #[test]
    fn test_unknown_status_is_kept_and_not_terminal() {
        let status = TaskStatus::parse("PAUSED_FOR_REVIEW");
        assert_eq!(status, TaskStatus::Other("PAUSED_FOR_REVIEW".into()));
        assert_eq!(status.to_string(), "PAUSED_FOR_REVIEW");
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        for raw in TERMINAL_STATUSES {
            assert!(TaskStatus::parse(raw).is_terminal(), "{raw} should be terminal");
        }
        assert!(!TaskStatus::Creating.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_serde_uses_plain_string() {
        let json = serde_json::to_string(&TaskStatus::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
        let parsed: TaskStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, TaskStatus::Error);
    }
}
