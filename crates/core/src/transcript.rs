use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One turn of the conversation as stored in the room's transcript list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shape() {
        let entry = TranscriptEntry::new(Role::Assistant, "Tell me about yourself.");
        let value: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "Tell me about yourself.");
        // ISO-8601 timestamps, e.g. 2024-05-01T10:00:00.123Z
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "not ISO-8601: {ts}");
    }

    #[test]
    fn test_reads_records_written_elsewhere() {
        let raw = r#"{"role":"user","content":"Hi","timestamp":"2024-05-01T10:00:00+00:00"}"#;
        let entry: TranscriptEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content, "Hi");
    }
}
