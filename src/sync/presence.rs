//! Presence tracking for interviews.
//!
//! This module handles who is looking at which interview:
//! - the local user's announcement, refreshed on a fixed interval
//! - remote users mirrored from the channel's presence sync/join/leave events
//! - staleness filtering on read, based on each entry's `online_at`
//!
//! Entries are unique per (interview, user). Each interview holds a bounded
//! number of users; joins beyond the cap are dropped.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{InterviewId, UserId};
use crate::transport::{
    ChannelEvent, ChannelStatus, PresenceState, RealtimeChannel, TransportError,
};

/// Configuration for presence tracking
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Re-announcement period for the local user
    pub heartbeat_interval: Duration,
    /// Entries older than `heartbeat_interval * stale_multiplier` are hidden
    pub stale_multiplier: u32,
    /// Joins of new users beyond this are dropped
    pub max_users_per_interview: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_multiplier: 3,
            max_users_per_interview: 50,
        }
    }
}

impl PresenceConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_multiplier(mut self, multiplier: u32) -> Self {
        self.stale_multiplier = multiplier;
        self
    }

    pub fn with_max_users_per_interview(mut self, max: usize) -> Self {
        self.max_users_per_interview = max;
        self
    }

    /// Age beyond which an entry is considered stale (90s by default)
    pub fn staleness_window(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.stale_multiplier)
    }
}

/// A user's announced viewing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: UserId,
    /// Display name
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Interview being viewed
    pub interview_id: InterviewId,
    /// Time of the last announcement; drives staleness
    pub online_at: DateTime<Utc>,
    /// Free-form extras such as avatar or cursor position
    #[serde(default)]
    pub metadata: Value,
}

impl PresenceUser {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email: None,
            interview_id: String::new(),
            online_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn viewing(mut self, interview_id: impl Into<String>) -> Self {
        self.interview_id = interview_id.into();
        self
    }

    pub fn online_at(mut self, at: DateTime<Utc>) -> Self {
        self.online_at = at;
        self
    }

    /// Announced within `window` of `now`. The boundary itself counts as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now.signed_duration_since(self.online_at) <= window,
            Err(_) => true,
        }
    }
}

/// Presence grouped by interview
pub type PresenceMap = HashMap<InterviewId, Vec<PresenceUser>>;

#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Remote presence changed; carries the fresh entries
    Changed(PresenceMap),
}

/// Errors related to presence operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Presence manager is not attached to a channel")]
    NotAttached,

    #[error("Channel not joined: {0}")]
    ChannelNotJoined(String),

    #[error("Presence transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Default)]
struct RemoteState {
    interviews: HashMap<InterviewId, HashMap<UserId, PresenceUser>>,
    /// What each presence key currently announces
    by_key: HashMap<String, Vec<PresenceUser>>,
}

impl RemoteState {
    fn insert(&mut self, key: &str, user: PresenceUser, cap: usize) -> bool {
        let users = self.interviews.entry(user.interview_id.clone()).or_default();
        if !users.contains_key(&user.user_id) && users.len() >= cap {
            debug!(
                "Dropping presence for {} on {}: {} users already",
                user.user_id, user.interview_id, cap
            );
            return false;
        }

        self.by_key.entry(key.to_string()).or_default().push(user.clone());
        users.insert(user.user_id.clone(), user);
        true
    }

    /// Drop the (interview, user) entry unless some key still announces it,
    /// in which case the newest remaining announcement takes its place
    fn release(&mut self, interview_id: &str, user_id: &str) {
        let remaining = self
            .by_key
            .values()
            .flatten()
            .filter(|u| u.interview_id == interview_id && u.user_id == user_id)
            .max_by_key(|u| u.online_at)
            .cloned();

        match remaining {
            Some(user) => {
                if let Some(users) = self.interviews.get_mut(interview_id) {
                    users.insert(user.user_id.clone(), user);
                }
            }
            None => {
                if let Some(users) = self.interviews.get_mut(interview_id) {
                    users.remove(user_id);
                    if users.is_empty() {
                        self.interviews.remove(interview_id);
                    }
                }
            }
        }
    }

    /// Withdraw one announcement of `user` made under `key`
    fn remove(&mut self, key: &str, user: &PresenceUser) {
        if let Some(entries) = self.by_key.get_mut(key) {
            if let Some(index) = entries
                .iter()
                .position(|u| u.interview_id == user.interview_id && u.user_id == user.user_id)
            {
                entries.remove(index);
            }
            if entries.is_empty() {
                self.by_key.remove(key);
            }
        }
        self.release(&user.interview_id, &user.user_id);
    }

    /// Forget what `key` announced before
    fn remove_key(&mut self, key: &str) {
        if let Some(entries) = self.by_key.remove(key) {
            for user in entries {
                self.release(&user.interview_id, &user.user_id);
            }
        }
    }

    fn clear(&mut self) {
        self.interviews.clear();
        self.by_key.clear();
    }
}

fn parse_presences(presences: &[Value]) -> Vec<PresenceUser> {
    presences
        .iter()
        .filter_map(|p| match serde_json::from_value::<PresenceUser>(p.clone()) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!("Skipping unrecognized presence payload: {}", e);
                None
            }
        })
        .collect()
}

struct Inner {
    config: PresenceConfig,
    /// This manager's identity among the consumers sharing a channel
    member_id: String,
    state: Mutex<RemoteState>,
    channel: Mutex<Option<Arc<dyn RealtimeChannel>>>,
    local: Mutex<Option<PresenceUser>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Inner {
    fn fresh_presence_at(&self, now: DateTime<Utc>) -> PresenceMap {
        let window = self.config.staleness_window();
        self.state
            .lock()
            .interviews
            .iter()
            .filter_map(|(interview_id, users)| {
                let mut fresh: Vec<PresenceUser> = users
                    .values()
                    .filter(|u| u.is_fresh_at(now, window))
                    .cloned()
                    .collect();
                if fresh.is_empty() {
                    return None;
                }
                fresh.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                Some((interview_id.clone(), fresh))
            })
            .collect()
    }

    fn notify(&self) {
        let _ = self
            .events
            .send(PresenceEvent::Changed(self.fresh_presence_at(Utc::now())));
    }

    fn handle_event(&self, event: ChannelEvent) {
        let cap = self.config.max_users_per_interview;
        match event {
            ChannelEvent::PresenceSync(full) => {
                self.rebuild(full);
            }
            ChannelEvent::PresenceJoin { key, presences } => {
                let mut state = self.state.lock();
                state.remove_key(&key);
                for user in parse_presences(&presences) {
                    state.insert(&key, user, cap);
                }
            }
            ChannelEvent::PresenceLeave { key, presences } => {
                let mut state = self.state.lock();
                for user in parse_presences(&presences) {
                    state.remove(&key, &user);
                }
            }
            ChannelEvent::Status(ChannelStatus::Closed | ChannelStatus::Errored) => {
                self.state.lock().clear();
            }
            _ => return,
        }
        self.notify();
    }

    fn rebuild(&self, full: PresenceState) {
        let cap = self.config.max_users_per_interview;
        let mut state = self.state.lock();
        state.clear();

        let mut keys: Vec<&String> = full.keys().collect();
        keys.sort();
        for key in keys {
            for user in parse_presences(&full[key]) {
                state.insert(key, user, cap);
            }
        }
    }

    fn joined_channel(&self) -> Result<Arc<dyn RealtimeChannel>, PresenceError> {
        let channel = self.channel.lock().clone().ok_or(PresenceError::NotAttached)?;
        if channel.status() != ChannelStatus::Joined {
            return Err(PresenceError::ChannelNotJoined(channel.name().to_string()));
        }
        Ok(channel)
    }

    async fn announce(&self) -> Result<(), PresenceError> {
        let channel = self.joined_channel()?;
        let payload = {
            let mut local = self.local.lock();
            let Some(user) = local.as_mut() else {
                return Ok(());
            };
            user.online_at = Utc::now();
            serde_json::to_value(&*user).unwrap_or(Value::Null)
        };
        channel.track(&self.member_id, payload).await?;
        Ok(())
    }
}

async fn listen(inner: Arc<Inner>, mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => inner.handle_event(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // the next sync or join corrects the mirror
                debug!("Presence listener lagged {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn reannounce_loop(inner: Arc<Inner>) {
    let period = inner.config.heartbeat_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = inner.announce().await {
            warn!("Presence re-announce failed: {}", e);
        }
    }
}

/// Manager for presence on one channel
pub struct PresenceManager {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceManager {
    pub fn new(config: PresenceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                member_id: uuid::Uuid::new_v4().to_string(),
                state: Mutex::new(RemoteState::default()),
                channel: Mutex::new(None),
                local: Mutex::new(None),
                events,
            }),
            listener: Mutex::new(None),
            announcer: Mutex::new(None),
        }
    }

    /// Subscribe to presence events
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Mirror presence from `channel`, replacing any previous attachment
    pub fn attach_to_channel(&self, channel: &Arc<dyn RealtimeChannel>) {
        let events = channel.events();
        *self.inner.channel.lock() = Some(channel.clone());
        self.inner.state.lock().clear();

        let task = tokio::spawn(listen(self.inner.clone(), events));
        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop mirroring and re-announcing
    pub fn detach(&self) {
        for slot in [&self.listener, &self.announcer] {
            if let Some(task) = slot.lock().take() {
                task.abort();
            }
        }
        *self.inner.channel.lock() = None;
        *self.inner.local.lock() = None;
        self.inner.state.lock().clear();
    }

    /// Announce `user` as viewing `interview_id` and keep re-announcing.
    /// Fails unless the attached channel is joined.
    pub async fn track_user(&self, user: PresenceUser, interview_id: &str) -> Result<(), PresenceError> {
        self.inner.joined_channel()?;

        let previous = self.inner.local.lock().replace(user.viewing(interview_id));
        if let Err(e) = self.inner.announce().await {
            *self.inner.local.lock() = previous;
            return Err(e);
        }

        let task = tokio::spawn(reannounce_loop(self.inner.clone()));
        if let Some(old) = self.announcer.lock().replace(task) {
            old.abort();
        }
        debug!("Tracking presence on interview {}", interview_id);
        Ok(())
    }

    /// Re-send the local announcement now, e.g. after a reconnect
    pub async fn reannounce(&self) -> Result<(), PresenceError> {
        self.inner.announce().await
    }

    /// Stop re-announcing and withdraw the local announcement
    pub async fn untrack_user(&self) -> Result<(), PresenceError> {
        if let Some(task) = self.announcer.lock().take() {
            task.abort();
        }
        if self.inner.local.lock().take().is_none() {
            return Ok(());
        }

        let channel = self.inner.joined_channel()?;
        channel.untrack(&self.inner.member_id).await?;
        Ok(())
    }

    pub fn local_user(&self) -> Option<PresenceUser> {
        self.inner.local.lock().clone()
    }

    pub fn get_interview_presence(&self, interview_id: &str) -> Vec<PresenceUser> {
        self.get_interview_presence_at(interview_id, Utc::now())
    }

    /// Fresh entries for one interview as of `now`
    pub fn get_interview_presence_at(&self, interview_id: &str, now: DateTime<Utc>) -> Vec<PresenceUser> {
        self.inner
            .fresh_presence_at(now)
            .remove(interview_id)
            .unwrap_or_default()
    }

    pub fn get_all_presence(&self) -> PresenceMap {
        self.inner.fresh_presence_at(Utc::now())
    }

    pub fn get_all_presence_at(&self, now: DateTime<Utc>) -> PresenceMap {
        self.inner.fresh_presence_at(now)
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        for slot in [&self.listener, &self.announcer] {
            if let Some(task) = slot.lock().take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, RealtimeTransport};
    use serde_json::json;

    fn join(key: &str, user: &PresenceUser) -> ChannelEvent {
        ChannelEvent::PresenceJoin {
            key: key.to_string(),
            presences: vec![serde_json::to_value(user).unwrap()],
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<PresenceEvent>, f: F) -> PresenceMap
    where
        F: Fn(&PresenceMap) -> bool,
    {
        loop {
            let PresenceEvent::Changed(map) = rx.recv().await.unwrap();
            if f(&map) {
                return map;
            }
        }
    }

    async fn joined_channel(hub: &MemoryHub, name: &str) -> Arc<dyn RealtimeChannel> {
        let channel = hub.transport().channel(name);
        channel.subscribe().await.unwrap();
        channel
    }

    #[test]
    fn test_staleness_window_default() {
        assert_eq!(PresenceConfig::default().staleness_window(), Duration::from_secs(90));
        let config = PresenceConfig::default().with_stale_multiplier(4);
        assert_eq!(config.staleness_window(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_staleness_boundaries() {
        let manager = PresenceManager::default();
        let t0 = Utc::now();
        let alice = PresenceUser::new("u-1", "Alice").viewing("i-1").online_at(t0);
        manager.inner.handle_event(join("k-1", &alice));

        let at_threshold = t0 + chrono::Duration::seconds(90);
        assert_eq!(manager.get_interview_presence_at("i-1", at_threshold), vec![alice.clone()]);

        let past_threshold = at_threshold + chrono::Duration::milliseconds(1);
        assert!(manager.get_interview_presence_at("i-1", past_threshold).is_empty());
        assert!(manager.get_all_presence_at(past_threshold).is_empty());
    }

    #[tokio::test]
    async fn test_cap_drops_extra_joins() {
        let manager = PresenceManager::new(PresenceConfig::default().with_max_users_per_interview(2));
        for i in 0..3 {
            let user = PresenceUser::new(format!("u-{}", i), "User").viewing("i-1");
            manager.inner.handle_event(join(&format!("k-{}", i), &user));
        }
        assert_eq!(manager.get_interview_presence("i-1").len(), 2);

        // a refresh of an existing user still lands
        let refreshed = PresenceUser::new("u-0", "Renamed").viewing("i-1");
        manager.inner.handle_event(join("k-0", &refreshed));
        let users = manager.get_interview_presence("i-1");
        assert_eq!(users.len(), 2);
        assert!(users.iter().any(|u| u.name == "Renamed"));
    }

    #[tokio::test]
    async fn test_sync_replaces_existing_entry() {
        let manager = PresenceManager::default();
        let earlier = PresenceUser::new("u-1", "Alice")
            .viewing("i-1")
            .online_at(Utc::now() - chrono::Duration::seconds(20));
        manager.inner.handle_event(join("k-1", &earlier));

        let later = earlier.clone().online_at(Utc::now());
        let mut full = PresenceState::new();
        full.insert("k-1".to_string(), vec![serde_json::to_value(&later).unwrap()]);
        manager.inner.handle_event(ChannelEvent::PresenceSync(full));

        let users = manager.get_interview_presence("i-1");
        assert_eq!(users, vec![later]);
    }

    #[tokio::test]
    async fn test_moving_to_another_interview_replaces_entry() {
        let manager = PresenceManager::default();
        let user = PresenceUser::new("u-1", "Alice").viewing("i-1");
        manager.inner.handle_event(join("k-1", &user));
        manager.inner.handle_event(join("k-1", &user.clone().viewing("i-2")));

        assert!(manager.get_interview_presence("i-1").is_empty());
        assert_eq!(manager.get_interview_presence("i-2").len(), 1);
    }

    #[tokio::test]
    async fn test_leave_keeps_user_announced_under_another_key() {
        let manager = PresenceManager::default();
        let now = Utc::now();
        let first_tab = PresenceUser::new("u-1", "Alice")
            .viewing("i-1")
            .online_at(now - chrono::Duration::seconds(10));
        let second_tab = first_tab.clone().online_at(now);
        manager.inner.handle_event(join("k-1", &first_tab));
        manager.inner.handle_event(join("k-2", &first_tab));
        manager.inner.handle_event(join("k-2", &second_tab));

        manager.inner.handle_event(ChannelEvent::PresenceLeave {
            key: "k-2".to_string(),
            presences: vec![serde_json::to_value(&second_tab).unwrap()],
        });
        assert_eq!(manager.get_interview_presence("i-1"), vec![first_tab.clone()]);

        manager.inner.handle_event(ChannelEvent::PresenceLeave {
            key: "k-1".to_string(),
            presences: vec![serde_json::to_value(&first_tab).unwrap()],
        });
        assert!(manager.get_interview_presence("i-1").is_empty());
    }

    #[tokio::test]
    async fn test_managers_sharing_a_channel_keep_their_own_entries() {
        let hub = MemoryHub::new();
        let channel = joined_channel(&hub, "company:c1:project:p1").await;
        let first = PresenceManager::default();
        let second = PresenceManager::default();
        first.attach_to_channel(&channel);
        second.attach_to_channel(&channel);
        let mut events = first.subscribe();

        first.track_user(PresenceUser::new("u-a", "Ann"), "i-1").await.unwrap();
        second.track_user(PresenceUser::new("u-b", "Ben"), "i-2").await.unwrap();
        wait_for(&mut events, |m| m.contains_key("i-1") && m.contains_key("i-2")).await;

        second.untrack_user().await.unwrap();
        let map = wait_for(&mut events, |m| !m.contains_key("i-2")).await;
        assert_eq!(map["i-1"][0].user_id, "u-a");
        assert_eq!(first.get_interview_presence("i-1").len(), 1);
        assert_eq!(first.local_user().map(|u| u.user_id), Some("u-a".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_presence_is_skipped() {
        let manager = PresenceManager::default();
        manager.inner.handle_event(ChannelEvent::PresenceJoin {
            key: "k-1".to_string(),
            presences: vec![json!({"user": "nobody"})],
        });
        assert!(manager.get_all_presence().is_empty());
    }

    #[tokio::test]
    async fn test_track_requires_joined_channel() {
        let manager = PresenceManager::default();
        let user = PresenceUser::new("u-1", "Alice");
        assert!(matches!(
            manager.track_user(user.clone(), "i-1").await,
            Err(PresenceError::NotAttached)
        ));

        let hub = MemoryHub::new();
        let channel = hub.transport().channel("company:c1");
        manager.attach_to_channel(&channel);
        assert!(matches!(
            manager.track_user(user, "i-1").await,
            Err(PresenceError::ChannelNotJoined(_))
        ));
        assert!(manager.local_user().is_none());
    }

    #[tokio::test]
    async fn test_remote_join_and_leave() {
        let hub = MemoryHub::new();
        let observer = PresenceManager::default();
        let viewer = PresenceManager::default();
        observer.attach_to_channel(&joined_channel(&hub, "company:c1").await);
        viewer.attach_to_channel(&joined_channel(&hub, "company:c1").await);
        let mut events = observer.subscribe();

        let bob = PresenceUser::new("u-2", "Bob").with_email("bob@example.com");
        viewer.track_user(bob, "i-1").await.unwrap();
        let map = wait_for(&mut events, |m| m.contains_key("i-1")).await;
        assert_eq!(map["i-1"][0].user_id, "u-2");
        assert_eq!(observer.get_interview_presence("i-1").len(), 1);

        viewer.untrack_user().await.unwrap();
        wait_for(&mut events, |m| m.is_empty()).await;
        assert!(observer.get_interview_presence("i-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannounces_until_untracked() {
        let hub = MemoryHub::new();
        let channel = joined_channel(&hub, "company:c1").await;
        let manager = PresenceManager::default();
        manager.attach_to_channel(&channel);
        let mut raw = channel.events();

        manager.track_user(PresenceUser::new("u-1", "Alice"), "i-1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;

        let mut joins = 0;
        while let Ok(event) = raw.try_recv() {
            if matches!(event, ChannelEvent::PresenceJoin { .. }) {
                joins += 1;
            }
        }
        assert_eq!(joins, 3);

        manager.untrack_user().await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut late_joins = 0;
        while let Ok(event) = raw.try_recv() {
            if matches!(event, ChannelEvent::PresenceJoin { .. }) {
                late_joins += 1;
            }
        }
        assert_eq!(late_joins, 0);
    }

    #[tokio::test]
    async fn test_channel_error_clears_presence() {
        let hub = MemoryHub::new();
        let channel = joined_channel(&hub, "company:c1").await;
        let manager = PresenceManager::default();
        manager.attach_to_channel(&channel);
        let mut events = manager.subscribe();

        manager.track_user(PresenceUser::new("u-1", "Alice"), "i-1").await.unwrap();
        wait_for(&mut events, |m| !m.is_empty()).await;

        hub.drop_connections();
        wait_for(&mut events, |m| m.is_empty()).await;
        assert!(manager.get_all_presence().is_empty());
    }
}
