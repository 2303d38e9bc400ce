//! Realtime transport abstraction.
//!
//! The sync core never talks to a socket directly. It consumes the channel
//! primitive defined here:
//! - named topics with join/leave/error status events
//! - row-level change subscriptions filtered by table and predicate
//! - presence track/untrack with sync/join/leave events
//! - generic broadcast send/receive
//!
//! Two implementations ship with the crate: [`memory`] (in-process, used by
//! tests and offline runs) and [`phoenix`] (the hosted realtime service's
//! WebSocket protocol).

pub mod memory;
pub mod phoenix;

pub use memory::{MemoryHub, MemoryTransport};
pub use phoenix::{PhoenixConfig, PhoenixTransport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each channel's event fan-out
pub const CHANNEL_EVENT_CAPACITY: usize = 512;

/// Lifecycle status of an underlying transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

impl ChannelStatus {
    /// Joined or on its way to being joined
    pub fn is_active(self) -> bool {
        matches!(self, ChannelStatus::Joined | ChannelStatus::Joining)
    }
}

/// Kind of row-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// Row-change subscription: table, optional event kind and `column=eq.value` predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    /// `None` listens to every kind
    pub event: Option<ChangeKind>,
    pub filter: Option<String>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event: None,
            filter: None,
        }
    }

    pub fn with_event(mut self, kind: ChangeKind) -> Self {
        self.event = Some(kind);
        self
    }

    /// Restrict to rows where `column` equals `value`
    pub fn with_eq(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(format!("{}=eq.{}", column, value));
        self
    }

    /// Whether a change would be delivered under this filter
    pub fn matches(&self, change: &RowChange) -> bool {
        if self.schema != change.schema || self.table != change.table {
            return false;
        }
        if let Some(kind) = self.event {
            if kind != change.kind {
                return false;
            }
        }
        match self.filter.as_deref().and_then(parse_eq_filter) {
            Some((column, expected)) => change
                .column(column)
                .map(|v| value_matches(v, expected))
                .unwrap_or(false),
            None => true,
        }
    }
}

fn parse_eq_filter(filter: &str) -> Option<(&str, &str)> {
    let (column, rest) = filter.split_once('=')?;
    let value = rest.strip_prefix("eq.")?;
    Some((column, value))
}

fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        _ => false,
    }
}

/// A row-level change notification as delivered by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    /// New row image (insert/update)
    pub record: Option<Value>,
    /// Previous row image (update/delete); may only carry the primary key
    pub old_record: Option<Value>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RowChange {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            kind,
            record: None,
            old_record: None,
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self {
            record: Some(record),
            ..Self::new(table, ChangeKind::Insert)
        }
    }

    pub fn update(table: impl Into<String>, record: Value) -> Self {
        Self {
            record: Some(record),
            ..Self::new(table, ChangeKind::Update)
        }
    }

    pub fn delete(table: impl Into<String>, old_record: Value) -> Self {
        Self {
            old_record: Some(old_record),
            ..Self::new(table, ChangeKind::Delete)
        }
    }

    /// Column value from the new image, falling back to the old one
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.record
            .as_ref()
            .and_then(|r| r.get(name))
            .or_else(|| self.old_record.as_ref().and_then(|r| r.get(name)))
    }
}

/// Presence state keyed by presence key, each holding the announced payloads
pub type PresenceState = HashMap<String, Vec<Value>>;

/// Everything a channel can deliver to its listeners
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    PostgresChange(RowChange),
    PresenceSync(PresenceState),
    PresenceJoin { key: String, presences: Vec<Value> },
    PresenceLeave { key: String, presences: Vec<Value> },
    Broadcast { event: String, payload: Value },
}

/// Errors surfaced by transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Channel not joined: {0}")]
    NotJoined(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A named duplex pub/sub topic
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Transport-unique identity of this channel object
    fn id(&self) -> u64;

    fn name(&self) -> &str;

    fn status(&self) -> ChannelStatus;

    /// New receiver for everything this channel delivers
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Register a row-change subscription. Filters added after joining take
    /// effect on the next join.
    fn listen_postgres_changes(&self, filter: ChangeFilter);

    /// Join the topic. Resolves immediately when already joined.
    async fn subscribe(&self) -> TransportResult<()>;

    async fn unsubscribe(&self) -> TransportResult<()>;

    /// Announce (or replace) `member`'s presence payload. Every consumer
    /// sharing this channel object tracks under its own member id; the
    /// channel publishes all of them under its presence key.
    async fn track(&self, member: &str, payload: Value) -> TransportResult<()>;

    /// Withdraw `member`'s payload, leaving other members' in place
    async fn untrack(&self, member: &str) -> TransportResult<()>;

    async fn send_broadcast(&self, event: &str, payload: Value) -> TransportResult<()>;
}

/// Presence payloads of the consumers sharing one channel object, in the
/// order they first tracked
#[derive(Debug, Default)]
pub(crate) struct TrackedMembers {
    entries: Vec<(String, Value)>,
}

impl TrackedMembers {
    /// Insert or replace; returns the member's previous payload
    pub(crate) fn set(&mut self, member: &str, payload: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(m, _)| m == member) {
            Some((_, current)) => Some(std::mem::replace(current, payload)),
            None => {
                self.entries.push((member.to_string(), payload));
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, member: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(m, _)| m == member)?;
        Some(self.entries.remove(index).1)
    }

    pub(crate) fn payloads(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, p)| p.clone()).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Registry of live channels owned by one client connection
pub trait RealtimeTransport: Send + Sync {
    /// Create and register a new channel object
    fn channel(&self, name: &str) -> Arc<dyn RealtimeChannel>;

    /// Every registered channel
    fn channels(&self) -> Vec<Arc<dyn RealtimeChannel>>;

    /// Drop a channel from the registry; returns whether it was present
    fn remove_channel(&self, id: u64) -> bool;

    /// A registered channel with this name that is joined or joining
    fn find_active_channel(&self, name: &str) -> Option<Arc<dyn RealtimeChannel>> {
        self.channels()
            .into_iter()
            .find(|c| c.name() == name && c.status().is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_table_and_predicate() {
        let filter = ChangeFilter::table("interviews").with_eq("project_id", "p-1");

        let hit = RowChange::insert("interviews", json!({"id": "i-1", "project_id": "p-1"}));
        let miss = RowChange::insert("interviews", json!({"id": "i-2", "project_id": "p-2"}));
        let other = RowChange::insert("interview_notes", json!({"project_id": "p-1"}));

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_filter_uses_old_record_for_deletes() {
        let filter = ChangeFilter::table("interviews").with_eq("project_id", "7");
        let change = RowChange::delete("interviews", json!({"id": "i-1", "project_id": 7}));
        assert!(filter.matches(&change));
    }

    #[test]
    fn test_filter_event_kind() {
        let filter = ChangeFilter::table("note_replies").with_event(ChangeKind::Delete);
        assert!(!filter.matches(&RowChange::insert("note_replies", json!({}))));
        assert!(filter.matches(&RowChange::delete("note_replies", json!({}))));
    }

    #[test]
    fn test_change_kind_parse() {
        assert_eq!(ChangeKind::parse("insert"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::parse("DELETE"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_tracked_members_keep_order_and_replace() {
        let mut members = TrackedMembers::default();
        assert!(members.set("m-1", json!({"user_id": "u-1"})).is_none());
        assert!(members.set("m-2", json!({"user_id": "u-2"})).is_none());

        let previous = members.set("m-1", json!({"user_id": "u-1", "interview_id": "i-9"}));
        assert_eq!(previous, Some(json!({"user_id": "u-1"})));
        assert_eq!(members.payloads()[0]["interview_id"], "i-9");
        assert_eq!(members.payloads()[1]["user_id"], "u-2");

        assert_eq!(members.remove("m-1"), Some(json!({"user_id": "u-1", "interview_id": "i-9"})));
        assert!(members.remove("m-1").is_none());
        assert_eq!(members.payloads(), vec![json!({"user_id": "u-2"})]);
    }
}
