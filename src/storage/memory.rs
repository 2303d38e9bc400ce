//! In-process data source.
//!
//! Rows are kept flat (interviews, notes, replies) and assembled into the
//! nested shape on every fetch, the way the REST API embeds children.
//! Call counters and a failure switch make it usable as a test double.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{
    assemble_interviews, FetchError, FetchResult, Interview, InterviewId, Note, ProjectDataSource,
    Reply,
};

#[derive(Default)]
struct Tables {
    interviews: Vec<Interview>,
    notes: Vec<Note>,
    replies: Vec<Reply>,
}

#[derive(Default)]
pub struct InMemoryDataSource {
    tables: RwLock<Tables>,
    interview_queries: AtomicUsize,
    note_queries: AtomicUsize,
    single_fetches: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an interview row (children are ignored)
    pub fn upsert_interview(&self, mut interview: Interview) {
        interview.notes.clear();
        let mut tables = self.tables.write();
        match tables.interviews.iter_mut().find(|i| i.id == interview.id) {
            Some(existing) => *existing = interview,
            None => tables.interviews.push(interview),
        }
    }

    /// Insert or replace a note row (replies are ignored)
    pub fn upsert_note(&self, mut note: Note) {
        note.replies.clear();
        let mut tables = self.tables.write();
        match tables.notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => tables.notes.push(note),
        }
    }

    pub fn upsert_reply(&self, reply: Reply) {
        let mut tables = self.tables.write();
        match tables.replies.iter_mut().find(|r| r.id == reply.id) {
            Some(existing) => *existing = reply,
            None => tables.replies.push(reply),
        }
    }

    pub fn remove_interview(&self, id: &str) {
        self.tables.write().interviews.retain(|i| i.id != id);
    }

    pub fn remove_note(&self, id: &str) {
        self.tables.write().notes.retain(|n| n.id != id);
    }

    /// Make every fetch fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of project interview queries served
    pub fn interview_queries(&self) -> usize {
        self.interview_queries.load(Ordering::SeqCst)
    }

    /// Number of child note queries served
    pub fn note_queries(&self) -> usize {
        self.note_queries.load(Ordering::SeqCst)
    }

    /// Number of single-record fetches served
    pub fn single_fetches(&self) -> usize {
        self.single_fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> FetchResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(FetchError::Unavailable("in-memory source switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn note_with_replies(tables: &Tables, note: &Note) -> Note {
        let mut note = note.clone();
        note.replies = tables
            .replies
            .iter()
            .filter(|r| r.note_id == note.id)
            .cloned()
            .collect();
        note
    }
}

#[async_trait]
impl ProjectDataSource for InMemoryDataSource {
    async fn fetch_interviews(&self, project_id: &str) -> FetchResult<Vec<Interview>> {
        self.interview_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let tables = self.tables.read();
        Ok(tables
            .interviews
            .iter()
            .filter(|i| i.project_id == project_id && !i.is_deleted())
            .cloned()
            .collect())
    }

    async fn fetch_notes(&self, interview_ids: &[InterviewId]) -> FetchResult<Vec<Note>> {
        self.note_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let tables = self.tables.read();
        Ok(tables
            .notes
            .iter()
            .filter(|n| interview_ids.contains(&n.interview_id) && !n.is_deleted())
            .map(|n| Self::note_with_replies(&tables, n))
            .collect())
    }

    async fn fetch_interview(&self, id: &str) -> FetchResult<Option<Interview>> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let tables = self.tables.read();
        let Some(interview) = tables.interviews.iter().find(|i| i.id == id).cloned() else {
            return Ok(None);
        };
        let notes = tables
            .notes
            .iter()
            .filter(|n| n.interview_id == id)
            .map(|n| Self::note_with_replies(&tables, n))
            .collect();

        let mut assembled = assemble_interviews(vec![interview.clone()], notes);
        // soft-deleted rows are still returned by id
        Ok(Some(assembled.pop().unwrap_or(interview)))
    }

    async fn fetch_note(&self, id: &str) -> FetchResult<Option<Note>> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let tables = self.tables.read();
        Ok(tables
            .notes
            .iter()
            .find(|n| n.id == id)
            .map(|n| Self::note_with_replies(&tables, n)))
    }

    async fn fetch_reply(&self, id: &str) -> FetchResult<Option<Reply>> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        Ok(self.tables.read().replies.iter().find(|r| r.id == id).cloned())
    }
}
