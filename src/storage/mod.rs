//! Data-access boundary for the sync core.
//!
//! The hosted database is an external collaborator. The sync core only needs:
//! - a bulk query for a project's interviews
//! - a child query for the notes (with nested replies) of a set of interviews
//! - single-record fetches used to materialize a change event into a full row
//!
//! [`postgrest`] implements these against the hosted REST API and [`memory`]
//! keeps rows in process for tests and offline runs.

pub mod memory;
pub mod postgrest;
pub mod records;

pub use memory::InMemoryDataSource;
pub use postgrest::{PostgrestConfig, PostgrestDataSource};
pub use records::{
    Interview, InterviewId, Note, NoteId, ProjectId, Reply, ReplyId, UserId, INTERVIEWS_TABLE,
    NOTES_TABLE, REPLIES_TABLE,
};

use async_trait::async_trait;

/// Errors that can occur while fetching rows
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Data source unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Http(err.to_string())
        }
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Row-fetch primitive consumed by the data sync manager
#[async_trait]
pub trait ProjectDataSource: Send + Sync {
    /// Every non-deleted interview of a project, without children
    async fn fetch_interviews(&self, project_id: &str) -> FetchResult<Vec<Interview>>;

    /// Non-deleted notes of the given interviews, each with its replies
    async fn fetch_notes(&self, interview_ids: &[InterviewId]) -> FetchResult<Vec<Note>>;

    /// One interview with its notes and replies
    async fn fetch_interview(&self, id: &str) -> FetchResult<Option<Interview>>;

    /// One note with its replies
    async fn fetch_note(&self, id: &str) -> FetchResult<Option<Note>>;

    async fn fetch_reply(&self, id: &str) -> FetchResult<Option<Reply>>;
}

/// Attach notes to their interviews, dropping soft-deleted children
pub fn assemble_interviews(mut interviews: Vec<Interview>, notes: Vec<Note>) -> Vec<Interview> {
    for interview in interviews.iter_mut() {
        interview.notes.clear();
    }

    for mut note in notes {
        if note.is_deleted() {
            continue;
        }
        note.replies.retain(|r| !r.is_deleted());
        if let Some(parent) = interviews.iter_mut().find(|i| i.id == note.interview_id) {
            parent.notes.push(note);
        }
    }

    interviews.retain(|i| !i.is_deleted());
    interviews
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_assemble_nests_notes_under_parents() {
        let interviews = vec![Interview::new("i-1", "p-1"), Interview::new("i-2", "p-1")];
        let notes = vec![
            Note::new("n-1", "i-1", "first"),
            Note::new("n-2", "i-2", "second"),
            Note::new("n-3", "i-9", "orphan"),
        ];

        let assembled = assemble_interviews(interviews, notes);
        assert_eq!(assembled[0].notes.len(), 1);
        assert_eq!(assembled[1].notes[0].id, "n-2");
    }

    #[test]
    fn test_assemble_drops_soft_deleted() {
        let mut deleted_interview = Interview::new("i-2", "p-1");
        deleted_interview.deleted_at = Some(Utc::now());

        let mut deleted_note = Note::new("n-2", "i-1", "gone");
        deleted_note.deleted_at = Some(Utc::now());

        let mut note = Note::new("n-1", "i-1", "kept");
        let mut deleted_reply = Reply::new("r-2", "n-1", "gone");
        deleted_reply.deleted_at = Some(Utc::now());
        note.replies = vec![Reply::new("r-1", "n-1", "kept"), deleted_reply];

        let assembled = assemble_interviews(
            vec![Interview::new("i-1", "p-1"), deleted_interview],
            vec![note, deleted_note],
        );

        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0].notes.len(), 1);
        assert_eq!(assembled[0].notes[0].replies.len(), 1);
    }

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::Status {
            status: 401,
            body: "JWT expired".to_string(),
        };
        assert_eq!(err.to_string(), "Unexpected status 401: JWT expired");
    }
}
