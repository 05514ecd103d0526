use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SessionId = i64;
pub type GroupId = i64;

/// Opaque document identifier. Deserializes from a JSON string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocumentId {
    Text(String),
    Integer(i64),
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RawDocumentId::deserialize(deserializer)? {
            RawDocumentId::Text(value) => DocumentId(value),
            RawDocumentId::Integer(value) => DocumentId::from(value),
        })
    }
}

impl DocumentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for DocumentId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonMode {
    #[serde(rename = "vector")]
    VectorOnly,
    #[serde(rename = "hybrid")]
    Hybrid,
    #[serde(rename = "gpt", alias = "judge", alias = "judge_only")]
    JudgeOnly,
}

impl ComparisonMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonMode::VectorOnly => "vector",
            ComparisonMode::Hybrid => "hybrid",
            ComparisonMode::JudgeOnly => "gpt",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "vector" | "vector_only" => Some(ComparisonMode::VectorOnly),
            "hybrid" => Some(ComparisonMode::Hybrid),
            "gpt" | "judge" | "judge_only" => Some(ComparisonMode::JudgeOnly),
            _ => None,
        }
    }

    pub fn uses_judge(&self) -> bool {
        !matches!(self, ComparisonMode::VectorOnly)
    }
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "processing" => Some(SessionStatus::Processing),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Processing)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A full check walks the whole corpus; a secondary check re-examines a chosen subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Full,
    Secondary,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Full => "full",
            CheckKind::Secondary => "secondary",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "full" => Some(CheckKind::Full),
            "secondary" => Some(CheckKind::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSession {
    pub id: SessionId,
    pub threshold: f32,
    pub mode: ComparisonMode,
    pub document_ids: Vec<DocumentId>,
    pub cursor: usize,
    pub status: SessionStatus,
    pub documents_checked: usize,
    pub groups_found: usize,
    pub external_batch_ref: Option<String>,
    pub kind: CheckKind,
    pub created_at: DateTime<Utc>,
}

impl CheckSession {
    pub fn total(&self) -> usize {
        self.document_ids.len()
    }

    pub fn progress_percent(&self) -> f32 {
        progress_percent(self.cursor, self.total())
    }
}

pub fn progress_percent(cursor: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }
    let raw = cursor as f32 / total as f32 * 100.0;
    (raw * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub threshold: f32,
    pub mode: ComparisonMode,
    pub document_ids: Vec<DocumentId>,
    pub external_batch_ref: Option<String>,
    pub kind: CheckKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub document_id: DocumentId,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub reference_cursor: usize,
    pub members: Vec<GroupMember>,
}

impl DuplicateGroup {
    pub fn reference(&self) -> Option<&GroupMember> {
        self.members.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupWrite {
    pub group_id: GroupId,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Input,
    Output,
    BatchInput,
    BatchOutput,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Input => "input",
            TokenKind::Output => "output",
            TokenKind::BatchInput => "batch_input",
            TokenKind::BatchOutput => "batch_output",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "input" => Some(TokenKind::Input),
            "output" => Some(TokenKind::Output),
            "batch_input" => Some(TokenKind::BatchInput),
            "batch_output" => Some(TokenKind::BatchOutput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub document_id: Option<DocumentId>,
    pub tokens: u64,
    pub cost: f64,
    pub operation: String,
    pub batch_ref: Option<String>,
    pub token_kind: TokenKind,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_match_persisted_values() {
        for mode in [
            ComparisonMode::VectorOnly,
            ComparisonMode::Hybrid,
            ComparisonMode::JudgeOnly,
        ] {
            assert_eq!(ComparisonMode::from_str(mode.as_str()), Some(mode));
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.as_str()));
        }
        assert_eq!(
            ComparisonMode::from_str(" Judge "),
            Some(ComparisonMode::JudgeOnly)
        );
        let parsed: ComparisonMode = serde_json::from_str("\"judge_only\"").unwrap();
        assert_eq!(parsed, ComparisonMode::JudgeOnly);
        assert_eq!(ComparisonMode::from_str("gpt4"), None);
    }

    #[test]
    fn document_ids_accept_strings_and_integers() {
        let text: DocumentId = serde_json::from_str("\"post-7\"").unwrap();
        assert_eq!(text.as_str(), "post-7");
        let number: DocumentId = serde_json::from_str("42").unwrap();
        assert_eq!(number, DocumentId::from("42"));
        assert_eq!(serde_json::to_string(&number).unwrap(), "\"42\"");
        let list: Vec<DocumentId> = serde_json::from_str(r#"[1, "2"]"#).unwrap();
        assert_eq!(list, vec![DocumentId::from("1"), DocumentId::from("2")]);
        assert!(serde_json::from_str::<DocumentId>("1.5").is_err());
    }

    #[test]
    fn progress_rounds_to_one_decimal() {
        assert_eq!(progress_percent(1, 3), 33.3);
        assert_eq!(progress_percent(3, 3), 100.0);
        assert_eq!(progress_percent(0, 0), 100.0);
    }

    #[test]
    fn only_processing_is_open() {
        assert!(!SessionStatus::Processing.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert_eq!(SessionStatus::from_str("CANCELLED"), Some(SessionStatus::Cancelled));
    }
}
