//! In-process realtime transport.
//!
//! A [`MemoryHub`] plays the hosted realtime service: channels created by any
//! [`MemoryTransport`] attached to the same hub see each other's presence and
//! broadcasts. Row changes and failures (rejected joins, dropped connections,
//! failing sends) are injected through the hub.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    ChangeFilter, ChannelEvent, ChannelStatus, PresenceState, RealtimeChannel, RealtimeTransport,
    RowChange, TrackedMembers, TransportError, TransportResult, CHANNEL_EVENT_CAPACITY,
};

const STALL_POLL: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Default)]
struct TopicState {
    members: Vec<Arc<MemoryChannel>>,
    /// Payloads published under each channel's presence key
    presence: PresenceState,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, TopicState>>,
    failing_subscribes: AtomicU32,
    subscribe_attempts: AtomicU32,
    offline: AtomicBool,
    fail_sends: AtomicBool,
    stall_subscribes: AtomicBool,
}

/// Shared in-process "server" for memory transports
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection to this hub
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Reject the next `n` join attempts
    pub fn fail_next_subscribes(&self, n: u32) {
        self.inner.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// While offline every join attempt is rejected
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold join attempts open until cleared, like a server that never replies
    pub fn set_stall_subscribes(&self, stall: bool) {
        self.inner.stall_subscribes.store(stall, Ordering::SeqCst);
    }

    /// Make broadcast sends fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of join attempts seen so far
    pub fn subscribe_attempts(&self) -> u32 {
        self.inner.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// Number of joined channels on a topic
    pub fn joined_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|t| t.members.len())
            .unwrap_or(0)
    }

    /// Deliver a row change to every joined channel whose filters match.
    /// Returns the number of channels it reached.
    pub fn emit_change(&self, change: RowChange) -> usize {
        let members: Vec<Arc<MemoryChannel>> = self
            .inner
            .topics
            .lock()
            .values()
            .flat_map(|t| t.members.iter().cloned())
            .collect();

        let mut delivered = 0;
        for member in members {
            let interested = member.filters.lock().iter().any(|f| f.matches(&change));
            if interested {
                member.deliver(ChannelEvent::PostgresChange(change.clone()));
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every joined channel as if the network went away
    pub fn drop_connections(&self) {
        let members: Vec<Arc<MemoryChannel>> = {
            let mut topics = self.inner.topics.lock();
            let members = topics
                .values_mut()
                .flat_map(|t| t.members.drain(..))
                .collect();
            topics.clear();
            members
        };

        debug!("Dropping {} memory channel connections", members.len());
        for member in members {
            member.set_status(ChannelStatus::Errored);
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_subscribe_failure(&self) -> bool {
        self.inner
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn join(&self, channel: Arc<MemoryChannel>) -> PresenceState {
        let mut topics = self.inner.topics.lock();
        let topic = topics.entry(channel.name.clone()).or_default();
        if !topic.members.iter().any(|m| m.id == channel.id) {
            topic.members.push(channel);
        }
        topic.presence.clone()
    }

    /// Remove a channel from its topic, returning the members that should hear
    /// about its presence leaving
    fn leave(&self, channel: &MemoryChannel) -> Option<(Vec<Value>, Vec<Arc<MemoryChannel>>)> {
        let mut topics = self.inner.topics.lock();
        let topic = topics.get_mut(&channel.name)?;
        topic.members.retain(|m| m.id != channel.id);
        let left = topic.presence.remove(&channel.presence_key())?;
        Some((left, topic.members.clone()))
    }

    fn members(&self, topic: &str) -> Vec<Arc<MemoryChannel>> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|t| t.members.clone())
            .unwrap_or_default()
    }
}

/// One channel object living on a [`MemoryTransport`]
pub struct MemoryChannel {
    id: u64,
    name: String,
    hub: MemoryHub,
    me: Weak<MemoryChannel>,
    status: Mutex<ChannelStatus>,
    filters: Mutex<Vec<ChangeFilter>>,
    tracked: Mutex<TrackedMembers>,
    events: broadcast::Sender<ChannelEvent>,
}

impl MemoryChannel {
    fn new(hub: MemoryHub, name: &str) -> Arc<Self> {
        let id = hub.next_id();
        let (events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            id,
            name: name.to_string(),
            hub,
            me: me.clone(),
            status: Mutex::new(ChannelStatus::Closed),
            filters: Mutex::new(Vec::new()),
            tracked: Mutex::new(TrackedMembers::default()),
            events,
        })
    }

    fn presence_key(&self) -> String {
        format!("client-{}", self.id)
    }

    fn deliver(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ChannelStatus) {
        let changed = {
            let mut current = self.status.lock();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            self.deliver(ChannelEvent::Status(status));
        }
    }

    fn ensure_joined(&self) -> TransportResult<()> {
        if self.status() == ChannelStatus::Joined {
            Ok(())
        } else {
            Err(TransportError::NotJoined(self.name.clone()))
        }
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn listen_postgres_changes(&self, filter: ChangeFilter) {
        let mut filters = self.filters.lock();
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }

    async fn subscribe(&self) -> TransportResult<()> {
        if self.status() == ChannelStatus::Joined {
            return Ok(());
        }

        self.set_status(ChannelStatus::Joining);
        self.hub.inner.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        while self.hub.inner.stall_subscribes.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL_POLL).await;
        }

        if self.hub.inner.offline.load(Ordering::SeqCst) || self.hub.take_subscribe_failure() {
            self.set_status(ChannelStatus::Errored);
            return Err(TransportError::SubscribeFailed(format!(
                "join rejected for {}",
                self.name
            )));
        }

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| TransportError::Connection("channel dropped".to_string()))?;
        let state = self.hub.join(me);

        self.set_status(ChannelStatus::Joined);
        self.deliver(ChannelEvent::PresenceSync(state));
        Ok(())
    }

    async fn unsubscribe(&self) -> TransportResult<()> {
        if self.status() == ChannelStatus::Closed {
            return Ok(());
        }

        self.set_status(ChannelStatus::Leaving);
        self.tracked.lock().clear();
        if let Some((presences, members)) = self.hub.leave(self) {
            for member in members {
                member.deliver(ChannelEvent::PresenceLeave {
                    key: self.presence_key(),
                    presences: presences.clone(),
                });
            }
        }
        self.set_status(ChannelStatus::Closed);
        Ok(())
    }

    async fn track(&self, member: &str, payload: Value) -> TransportResult<()> {
        self.ensure_joined()?;

        let presences = {
            let mut tracked = self.tracked.lock();
            tracked.set(member, payload);
            tracked.payloads()
        };
        let members = {
            let mut topics = self.hub.inner.topics.lock();
            let topic = topics.entry(self.name.clone()).or_default();
            topic.presence.insert(self.presence_key(), presences.clone());
            topic.members.clone()
        };

        for peer in members {
            peer.deliver(ChannelEvent::PresenceJoin {
                key: self.presence_key(),
                presences: presences.clone(),
            });
        }
        Ok(())
    }

    async fn untrack(&self, member: &str) -> TransportResult<()> {
        self.ensure_joined()?;

        let (removed, remaining) = {
            let mut tracked = self.tracked.lock();
            let Some(removed) = tracked.remove(member) else {
                return Ok(());
            };
            (removed, tracked.payloads())
        };
        let members = {
            let mut topics = self.hub.inner.topics.lock();
            match topics.get_mut(&self.name) {
                Some(topic) => {
                    if remaining.is_empty() {
                        topic.presence.remove(&self.presence_key());
                    } else {
                        topic.presence.insert(self.presence_key(), remaining.clone());
                    }
                    topic.members.clone()
                }
                None => Vec::new(),
            }
        };

        for peer in members {
            peer.deliver(ChannelEvent::PresenceLeave {
                key: self.presence_key(),
                presences: vec![removed.clone()],
            });
            if !remaining.is_empty() {
                peer.deliver(ChannelEvent::PresenceJoin {
                    key: self.presence_key(),
                    presences: remaining.clone(),
                });
            }
        }
        Ok(())
    }

    async fn send_broadcast(&self, event: &str, payload: Value) -> TransportResult<()> {
        self.ensure_joined()?;

        if self.hub.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "broadcast {} on {}",
                event, self.name
            )));
        }

        for member in self.hub.members(&self.name) {
            if member.id != self.id {
                member.deliver(ChannelEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Client-side channel registry backed by a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryTransport {
    /// A transport on a private hub
    pub fn standalone() -> Self {
        MemoryHub::new().transport()
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    /// Number of registered channels with this name that are joined
    pub fn joined_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|c| c.name == name && c.status() == ChannelStatus::Joined)
            .count()
    }

    /// Number of registered channel objects
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl RealtimeTransport for MemoryTransport {
    fn channel(&self, name: &str) -> Arc<dyn RealtimeChannel> {
        let channel = MemoryChannel::new(self.hub.clone(), name);
        self.channels.lock().push(channel.clone());
        channel
    }

    fn channels(&self) -> Vec<Arc<dyn RealtimeChannel>> {
        self.channels
            .lock()
            .iter()
            .map(|c| c.clone() as Arc<dyn RealtimeChannel>)
            .collect()
    }

    fn remove_channel(&self, id: u64) -> bool {
        let removed = {
            let mut channels = self.channels.lock();
            let index = channels.iter().position(|c| c.id == id);
            index.map(|i| channels.remove(i))
        };

        match removed {
            Some(channel) => {
                self.hub.leave(&channel);
                true
            }
            None => false,
        }
    }
}
