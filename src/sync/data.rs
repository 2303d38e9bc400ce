//! Project view model kept current from a bulk load plus row changes.
//!
//! Row changes are buffered for a short window and then applied group by
//! group (record type and change kind, in order of first arrival). Each group
//! produces one batch event. A full reload backs this up whenever
//! continuity is in doubt.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::optimistic::run_optimistic;
use super::{sleep_until_opt, SyncError, SyncResult};
use crate::storage::{
    assemble_interviews, FetchResult, Interview, InterviewId, Note, NoteId, ProjectDataSource,
    ProjectId, Reply, ReplyId, INTERVIEWS_TABLE, NOTES_TABLE, REPLIES_TABLE,
};
use crate::transport::{ChangeFilter, ChangeKind, ChannelEvent, RealtimeChannel, RowChange};

const EVENT_CAPACITY: usize = 256;

/// Configuration for the data sync manager
#[derive(Debug, Clone)]
pub struct DataSyncConfig {
    /// How long changes are buffered before a flush; the deadline is set by
    /// the first change of a batch
    pub batch_window: Duration,
    /// Buffer size that forces an early flush
    pub max_buffered: usize,
}

impl Default for DataSyncConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            max_buffered: 1000,
        }
    }
}

impl DataSyncConfig {
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Interview,
    Note,
    Reply,
}

impl RecordType {
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            INTERVIEWS_TABLE => Some(RecordType::Interview),
            NOTES_TABLE => Some(RecordType::Note),
            REPLIES_TABLE => Some(RecordType::Reply),
            _ => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            RecordType::Interview => INTERVIEWS_TABLE,
            RecordType::Note => NOTES_TABLE,
            RecordType::Reply => REPLIES_TABLE,
        }
    }
}

/// Denormalized view of one project
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectSnapshot {
    pub project_id: ProjectId,
    pub interviews: Vec<Interview>,
}

impl ProjectSnapshot {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            interviews: Vec::new(),
        }
    }

    pub fn interview(&self, id: &str) -> Option<&Interview> {
        self.interviews.iter().find(|i| i.id == id)
    }

    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.interviews.iter().find_map(|i| i.note(note_id))
    }

    pub fn note_count(&self) -> usize {
        self.interviews.iter().map(|i| i.notes.len()).sum()
    }

    fn note_mut(&mut self, note_id: &str) -> Option<&mut Note> {
        self.interviews
            .iter_mut()
            .flat_map(|i| i.notes.iter_mut())
            .find(|n| n.id == note_id)
    }

    /// Replace by id or append. Children already loaded are kept when the
    /// incoming row carries none.
    pub fn upsert_interview(&mut self, mut interview: Interview) {
        match self.interviews.iter().position(|i| i.id == interview.id) {
            Some(index) => {
                if interview.notes.is_empty() {
                    interview.notes = std::mem::take(&mut self.interviews[index].notes);
                }
                self.interviews[index] = interview;
            }
            None => self.interviews.push(interview),
        }
    }

    pub fn remove_interview(&mut self, id: &str) -> bool {
        let before = self.interviews.len();
        self.interviews.retain(|i| i.id != id);
        self.interviews.len() != before
    }

    /// Returns false when the parent interview is not loaded
    pub fn upsert_note(&mut self, mut note: Note) -> bool {
        // a note may move between interviews
        if let Some(existing) = self.note(&note.id) {
            if existing.interview_id != note.interview_id {
                self.remove_note(&note.id);
            }
        }

        let Some(parent) = self.interviews.iter_mut().find(|i| i.id == note.interview_id) else {
            return false;
        };
        match parent.notes.iter().position(|n| n.id == note.id) {
            Some(index) => {
                if note.replies.is_empty() {
                    note.replies = std::mem::take(&mut parent.notes[index].replies);
                }
                parent.notes[index] = note;
            }
            None => parent.notes.push(note),
        }
        true
    }

    pub fn remove_note(&mut self, note_id: &str) -> bool {
        self.interviews.iter_mut().any(|i| {
            let before = i.notes.len();
            i.notes.retain(|n| n.id != note_id);
            i.notes.len() != before
        })
    }

    /// Returns false when the parent note is not loaded
    pub fn upsert_reply(&mut self, reply: Reply) -> bool {
        let Some(parent) = self.note_mut(&reply.note_id) else {
            return false;
        };
        match parent.replies.iter().position(|r| r.id == reply.id) {
            Some(index) => parent.replies[index] = reply,
            None => parent.replies.push(reply),
        }
        true
    }

    pub fn remove_reply(&mut self, reply_id: &str) -> bool {
        self.interviews
            .iter_mut()
            .flat_map(|i| i.notes.iter_mut())
            .any(|n| {
                let before = n.replies.len();
                n.replies.retain(|r| r.id != reply_id);
                n.replies.len() != before
            })
    }
}

/// Loading and freshness of the view model
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    /// A bulk load is in flight
    pub is_loading: bool,
    /// End of the last successful bulk load
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Message of the last failed load; cleared by the next success
    pub error: Option<String>,
    /// Changes buffered and not yet applied
    pub pending_changes: usize,
}

#[derive(Debug, Clone)]
pub enum DataSyncEvent {
    DataLoaded(ProjectSnapshot),
    BatchInsert { record_type: RecordType, records: Vec<Value> },
    BatchUpdate { record_type: RecordType, records: Vec<Value> },
    BatchDelete { record_type: RecordType, records: Vec<Value> },
    Error(String),
}

impl DataSyncEvent {
    fn batch(kind: ChangeKind, record_type: RecordType, records: Vec<Value>) -> Self {
        match kind {
            ChangeKind::Insert => DataSyncEvent::BatchInsert { record_type, records },
            ChangeKind::Update => DataSyncEvent::BatchUpdate { record_type, records },
            ChangeKind::Delete => DataSyncEvent::BatchDelete { record_type, records },
        }
    }
}

/// Locally initiated change applied ahead of server confirmation
#[derive(Debug, Clone)]
pub enum LocalChange {
    CreateNote(Note),
    DeleteNote { note_id: NoteId },
    CreateReply(Reply),
    DeleteReply { reply_id: ReplyId },
}

impl LocalChange {
    fn apply(&self, snapshot: &mut ProjectSnapshot) {
        match self {
            LocalChange::CreateNote(note) => {
                snapshot.upsert_note(note.clone());
            }
            LocalChange::DeleteNote { note_id } => {
                snapshot.remove_note(note_id);
            }
            LocalChange::CreateReply(reply) => {
                snapshot.upsert_reply(reply.clone());
            }
            LocalChange::DeleteReply { reply_id } => {
                snapshot.remove_reply(reply_id);
            }
        }
    }
}

/// Primary or foreign key as a string, whatever its JSON type
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

struct Inner {
    project_id: ProjectId,
    config: DataSyncConfig,
    source: Arc<dyn ProjectDataSource>,
    snapshot: Mutex<ProjectSnapshot>,
    snapshot_tx: watch::Sender<ProjectSnapshot>,
    state: Mutex<SyncState>,
    pending: Mutex<Vec<RowChange>>,
    events: broadcast::Sender<DataSyncEvent>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn emit(&self, event: DataSyncEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = self.snapshot.lock().clone();
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Queue a change; true when the buffer is full enough to flush now
    fn buffer(&self, change: RowChange) -> bool {
        let len = {
            let mut pending = self.pending.lock();
            pending.push(change);
            pending.len()
        };
        self.state.lock().pending_changes = len;
        len >= self.config.max_buffered
    }

    async fn load(&self) -> SyncResult<ProjectSnapshot> {
        {
            let mut state = self.state.lock();
            state.is_loading = true;
            state.error = None;
        }

        match self.fetch_all().await {
            Ok(interviews) => {
                let snapshot = {
                    let mut snapshot = self.snapshot.lock();
                    snapshot.interviews = interviews;
                    snapshot.clone()
                };
                {
                    let mut state = self.state.lock();
                    state.is_loading = false;
                    state.last_synced_at = Some(Utc::now());
                }
                self.snapshot_tx.send_replace(snapshot.clone());
                info!(
                    "Loaded project {}: {} interviews, {} notes",
                    self.project_id,
                    snapshot.interviews.len(),
                    snapshot.note_count()
                );
                self.emit(DataSyncEvent::DataLoaded(snapshot.clone()));
                Ok(snapshot)
            }
            Err(err) => {
                warn!("Loading project {} failed: {}", self.project_id, err);
                {
                    let mut state = self.state.lock();
                    state.is_loading = false;
                    state.error = Some(err.to_string());
                }
                self.emit(DataSyncEvent::Error(err.to_string()));
                Err(SyncError::Fetch(err))
            }
        }
    }

    async fn fetch_all(&self) -> FetchResult<Vec<Interview>> {
        let interviews = self.source.fetch_interviews(&self.project_id).await?;
        let ids: Vec<InterviewId> = interviews.iter().map(|i| i.id.clone()).collect();
        let notes = if ids.is_empty() {
            Vec::new()
        } else {
            self.source.fetch_notes(&ids).await?
        };
        Ok(assemble_interviews(interviews, notes))
    }

    /// Apply everything buffered; returns the number of applied changes
    async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let changes = std::mem::take(&mut *self.pending.lock());
        self.state.lock().pending_changes = 0;
        if changes.is_empty() {
            return 0;
        }

        let mut groups: Vec<((RecordType, ChangeKind), Vec<RowChange>)> = Vec::new();
        for change in changes {
            let Some(record_type) = RecordType::from_table(&change.table) else {
                debug!("Ignoring change for unrelated table {}", change.table);
                continue;
            };
            let group_key = (record_type, change.kind);
            match groups.iter_mut().find(|(k, _)| *k == group_key) {
                Some((_, batch)) => batch.push(change),
                None => groups.push((group_key, vec![change])),
            }
        }

        let mut applied = 0;
        for ((record_type, kind), batch) in groups {
            let mut records = Vec::with_capacity(batch.len());
            for change in batch {
                if self.apply_change(record_type, &change).await {
                    if let Some(payload) = change.record.or(change.old_record) {
                        records.push(payload);
                    }
                }
            }
            if records.is_empty() {
                continue;
            }

            applied += records.len();
            self.publish();
            debug!("{:?} batch of {} {:?} rows", kind, records.len(), record_type);
            self.emit(DataSyncEvent::batch(kind, record_type, records));
        }
        applied
    }

    fn with_snapshot<R>(&self, f: impl FnOnce(&mut ProjectSnapshot) -> R) -> R {
        f(&mut *self.snapshot.lock())
    }

    async fn apply_change(&self, record_type: RecordType, change: &RowChange) -> bool {
        let Some(id) = change.column("id").and_then(key_string) else {
            warn!("Dropping {} change without a usable id", change.table);
            return false;
        };

        match (record_type, change.kind) {
            (RecordType::Interview, ChangeKind::Delete) => self.with_snapshot(|s| s.remove_interview(&id)),
            (RecordType::Interview, _) => {
                if let Some(project) = change.column("project_id").and_then(key_string) {
                    if project != self.project_id {
                        return false;
                    }
                }
                let fetched = self.source.fetch_interview(&id).await;
                let Some(mut interview) = materialize::<Interview>(fetched, change) else {
                    return false;
                };
                if interview.project_id != self.project_id {
                    return false;
                }
                if interview.is_deleted() {
                    return self.with_snapshot(|s| s.remove_interview(&id));
                }
                interview.notes.retain(|n| !n.is_deleted());
                for note in interview.notes.iter_mut() {
                    note.replies.retain(|r| !r.is_deleted());
                }
                self.with_snapshot(|s| s.upsert_interview(interview));
                true
            }
            (RecordType::Note, ChangeKind::Delete) => self.with_snapshot(|s| s.remove_note(&id)),
            (RecordType::Note, _) => {
                if let Some(parent) = change.column("interview_id").and_then(key_string) {
                    if !self.with_snapshot(|s| s.interview(&parent).is_some()) {
                        debug!("Ignoring note {} for unloaded interview {}", id, parent);
                        return false;
                    }
                }
                let fetched = self.source.fetch_note(&id).await;
                let Some(mut note) = materialize::<Note>(fetched, change) else {
                    return false;
                };
                if note.is_deleted() {
                    return self.with_snapshot(|s| s.remove_note(&id));
                }
                note.replies.retain(|r| !r.is_deleted());
                self.with_snapshot(|s| s.upsert_note(note))
            }
            (RecordType::Reply, ChangeKind::Delete) => self.with_snapshot(|s| s.remove_reply(&id)),
            (RecordType::Reply, _) => {
                if let Some(parent) = change.column("note_id").and_then(key_string) {
                    if !self.with_snapshot(|s| s.note(&parent).is_some()) {
                        debug!("Ignoring reply {} for unloaded note {}", id, parent);
                        return false;
                    }
                }
                let fetched = self.source.fetch_reply(&id).await;
                let Some(reply) = materialize::<Reply>(fetched, change) else {
                    return false;
                };
                if reply.is_deleted() {
                    return self.with_snapshot(|s| s.remove_reply(&id));
                }
                self.with_snapshot(|s| s.upsert_reply(reply))
            }
        }
    }
}

/// Full row from the data source, falling back to the change payload
fn materialize<T: DeserializeOwned>(fetched: FetchResult<Option<T>>, change: &RowChange) -> Option<T> {
    match fetched {
        Ok(Some(row)) => return Some(row),
        Ok(None) => debug!("{} row not found, using change payload", change.table),
        Err(e) => warn!("Fetching {} row failed, using change payload: {}", change.table, e),
    }

    let record = change.record.clone()?;
    match serde_json::from_value(record) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("Dropping malformed {} payload: {}", change.table, e);
            None
        }
    }
}

async fn listen(inner: Arc<Inner>, mut events: broadcast::Receiver<ChannelEvent>) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChannelEvent::PostgresChange(change)) => {
                    if inner.buffer(change) {
                        deadline = None;
                        inner.flush().await;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + inner.config.batch_window);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} change events for {}, reloading", skipped, inner.project_id);
                    deadline = None;
                    inner.flush().await;
                    let _ = inner.load().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    inner.flush().await;
                    break;
                }
            },
            _ = sleep_until_opt(deadline) => {
                deadline = None;
                inner.flush().await;
            }
        }
    }
    debug!("Change listener for {} stopped", inner.project_id);
}

/// Keeps one project's view model in sync
pub struct DataSyncManager {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DataSyncManager {
    pub fn new(
        project_id: impl Into<String>,
        source: Arc<dyn ProjectDataSource>,
        config: DataSyncConfig,
    ) -> Self {
        let project_id = project_id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, _) = watch::channel(ProjectSnapshot::new(project_id.clone()));
        Self {
            inner: Arc::new(Inner {
                snapshot: Mutex::new(ProjectSnapshot::new(project_id.clone())),
                project_id,
                config,
                source,
                snapshot_tx,
                state: Mutex::new(SyncState::default()),
                pending: Mutex::new(Vec::new()),
                events,
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Row-change subscriptions needed for a project
    pub fn change_filters(project_id: &str) -> Vec<ChangeFilter> {
        vec![
            ChangeFilter::table(INTERVIEWS_TABLE).with_eq("project_id", project_id),
            ChangeFilter::table(NOTES_TABLE),
            ChangeFilter::table(REPLIES_TABLE),
        ]
    }

    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Listen for row changes on `channel`, replacing any previous attachment
    pub fn attach_to_channel(&self, channel: &Arc<dyn RealtimeChannel>) {
        for filter in Self::change_filters(&self.inner.project_id) {
            channel.listen_postgres_changes(filter);
        }

        let task = tokio::spawn(listen(self.inner.clone(), channel.events()));
        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
        debug!("Data sync for {} attached to {}", self.inner.project_id, channel.name());
    }

    /// Stop listening. Buffered changes are dropped.
    pub fn detach(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        self.inner.pending.lock().clear();
        self.inner.state.lock().pending_changes = 0;
    }

    /// Fetch the whole project. Errors are kept in [`sync_state`](Self::sync_state)
    /// and returned.
    pub async fn load_initial_data(&self) -> SyncResult<ProjectSnapshot> {
        self.inner.load().await
    }

    /// Apply buffered changes now, then reload everything
    pub async fn force_sync(&self) -> SyncResult<ProjectSnapshot> {
        let flushed = self.inner.flush().await;
        if flushed > 0 {
            debug!("Flushed {} buffered changes before resync", flushed);
        }
        self.inner.load().await
    }

    /// Apply a local change now and undo it if `request` fails. A failed
    /// request also triggers a resync, since the rollback discards remote
    /// changes applied while it was in flight.
    pub async fn apply_optimistic<R, E, Fut>(&self, change: LocalChange, request: Fut) -> Result<R, E>
    where
        Fut: Future<Output = Result<R, E>>,
    {
        let tx = &self.inner.snapshot_tx;
        let result = run_optimistic(
            &self.inner.snapshot,
            |snapshot| change.apply(snapshot),
            request,
            |snapshot| {
                tx.send_replace(snapshot.clone());
            },
        )
        .await;

        if result.is_err() {
            if let Err(e) = self.force_sync().await {
                warn!("Resync after rollback of {} failed: {}", self.inner.project_id, e);
            }
        }
        result
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        self.inner.snapshot.lock().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ProjectSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataSyncEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for DataSyncManager {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}
