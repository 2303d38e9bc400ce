//! Domain rows mirrored client-side.
//!
//! Rows are lenient on input: unknown columns are kept in `extra` and most
//! timestamps are optional, because change payloads frequently carry partial
//! row images.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ProjectId = String;
pub type InterviewId = String;
pub type NoteId = String;
pub type ReplyId = String;
pub type UserId = String;

/// Table holding project-scoped interviews
pub const INTERVIEWS_TABLE: &str = "interviews";
/// Table holding notes, child of interviews
pub const NOTES_TABLE: &str = "interview_notes";
/// Table holding replies, child of notes
pub const REPLIES_TABLE: &str = "note_replies";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interview {
    pub id: InterviewId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Interview {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            company_id: None,
            title: None,
            status: None,
            created_at: Some(Utc::now()),
            updated_at: None,
            deleted_at: None,
            notes: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == note_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub interview_id: InterviewId,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Reply>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Note {
    pub fn new(
        id: impl Into<String>,
        interview_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            interview_id: interview_id.into(),
            author_id: None,
            content: content.into(),
            created_at: Some(Utc::now()),
            updated_at: None,
            deleted_at: None,
            replies: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: ReplyId,
    pub note_id: NoteId,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn new(id: impl Into<String>, note_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            note_id: note_id.into(),
            author_id: None,
            content: content.into(),
            created_at: Some(Utc::now()),
            updated_at: None,
            deleted_at: None,
            extra: Map::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interview_from_row_keeps_extra_columns() {
        let row = json!({
            "id": "i-1",
            "project_id": "p-1",
            "title": "Onboarding call",
            "created_at": "2024-03-01T10:00:00.123456+00:00",
            "interviewee_name": "Dana",
            "notes": [{"id": "n-1", "interview_id": "i-1", "content": "pain point"}]
        });

        let interview: Interview = serde_json::from_value(row).unwrap();
        assert_eq!(interview.title.as_deref(), Some("Onboarding call"));
        assert_eq!(interview.extra["interviewee_name"], "Dana");
        assert_eq!(interview.notes.len(), 1);
        assert!(!interview.is_deleted());
    }

    #[test]
    fn test_soft_deleted_note() {
        let note: Note = serde_json::from_value(json!({
            "id": "n-1",
            "interview_id": "i-1",
            "deleted_at": "2024-03-02T08:00:00Z"
        }))
        .unwrap();
        assert!(note.is_deleted());
        assert_eq!(note.content, "");
    }

    #[test]
    fn test_missing_parent_key_is_rejected() {
        let result: Result<Reply, _> = serde_json::from_value(json!({"id": "r-1"}));
        assert!(result.is_err());
    }
}
