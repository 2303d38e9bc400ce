//! Lifecycle of one named realtime channel.
//!
//! A [`ConnectionManager`] is a handle onto a background task that owns the
//! channel. The task serializes connect/disconnect/destroy commands, runs the
//! heartbeat, and drives exponential-backoff reconnects. Readers get state and
//! stats from a shared snapshot without going through the task.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{recv_opt, sleep_until_opt, tick_opt};
use crate::transport::{
    ChangeFilter, ChannelEvent, ChannelStatus, RealtimeChannel, RealtimeTransport, TransportError,
};

/// Broadcast event used as the liveness check
pub const HEARTBEAT_EVENT: &str = "heartbeat";

const EVENT_CAPACITY: usize = 256;

/// Shortest heartbeat period the task will run with
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Topic name, e.g. `company:<tenant>:project:<project>`
    pub channel_name: String,
    /// Schedule reconnects after errors and dropped channels
    pub auto_reconnect: bool,
    /// Reconnects tried before giving up and staying in `Error`
    pub max_reconnect_attempts: u32,
    /// Backoff base, doubled per attempt
    pub reconnect_delay: Duration,
    /// Cap on a single backoff delay
    pub max_reconnect_delay: Duration,
    /// Liveness check period; never below [`MIN_HEARTBEAT_INTERVAL`]
    pub heartbeat_interval: Duration,
    /// Upper bound for a single subscribe attempt
    pub connect_timeout: Duration,
    /// Row-change subscriptions registered on every channel before it joins
    pub change_filters: Vec<ChangeFilter>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_name: String::new(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            change_filters: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn for_channel(name: impl Into<String>) -> Self {
        Self {
            channel_name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_change_filters(mut self, filters: Vec<ChangeFilter>) -> Self {
        self.change_filters = filters;
        self
    }
}

/// Delay before reconnect attempt number `attempt` (zero-based)
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-channel telemetry, written only by the owning manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// Last successful join
    pub connected_at: Option<DateTime<Utc>>,
    /// Last loss or deliberate disconnect
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Attempts since the last successful join
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// Round trip of the last heartbeat
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Option<Duration>,
}

fn serialize_millis<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Connected,
    Disconnected,
    Error(String),
    ReconnectScheduled { attempt: u32, delay: Duration },
    Latency(Duration),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection manager destroyed")]
    Destroyed,

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Transport(#[from] TransportError),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

enum Command {
    Connect(oneshot::Sender<ConnectionResult<()>>),
    Disconnect(oneshot::Sender<()>),
    Destroy(oneshot::Sender<()>),
}

struct Shared {
    state: ConnectionState,
    stats: ConnectionStats,
    channel: Option<Arc<dyn RealtimeChannel>>,
    destroyed: bool,
}

type EventSender = Arc<Mutex<Option<broadcast::Sender<ConnectionEvent>>>>;

/// Handle onto one channel's lifecycle task
pub struct ConnectionManager {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
    events: EventSender,
}

impl ConnectionManager {
    /// Spawn the lifecycle task. Nothing connects until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, transport: Arc<dyn RealtimeTransport>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let events: EventSender = Arc::new(Mutex::new(Some(event_tx)));
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Disconnected,
            stats: ConnectionStats::default(),
            channel: None,
            destroyed: false,
        }));

        let name = config.channel_name.clone();
        let actor = Actor {
            config,
            transport,
            shared: shared.clone(),
            events: events.clone(),
            channel: None,
            owns_channel: false,
            channel_events: None,
            heartbeat: None,
            reconnect_at: None,
            attempts: 0,
            destroyed: false,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            name,
            commands,
            shared,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the channel. No-op while connecting or connected.
    pub async fn connect(&self) -> ConnectionResult<()> {
        if self.shared.lock().destroyed {
            return Err(ConnectionError::Destroyed);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply))
            .map_err(|_| ConnectionError::Destroyed)?;
        rx.await.unwrap_or(Err(ConnectionError::Destroyed))
    }

    /// Leave the channel and cancel timers. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnect for good and release event listeners
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats.clone()
    }

    /// The underlying channel while one is attached
    pub fn channel(&self) -> Option<Arc<dyn RealtimeChannel>> {
        self.shared.lock().channel.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Lifecycle events. After destroy the receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        match self.events.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

struct Actor {
    config: ConnectionConfig,
    transport: Arc<dyn RealtimeTransport>,
    shared: Arc<Mutex<Shared>>,
    events: EventSender,
    channel: Option<Arc<dyn RealtimeChannel>>,
    /// Whether `channel` was created here rather than reused
    owns_channel: bool,
    channel_events: Option<broadcast::Receiver<ChannelEvent>>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    attempts: u32,
    destroyed: bool,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(reply)) => {
                        let result = self.connect().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Disconnect(reply)) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Destroy(reply)) => {
                        self.destroy().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // every handle dropped
                        self.disconnect().await;
                        break;
                    }
                },
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    debug!("Reconnecting {} (attempt {})", self.config.channel_name, self.attempts);
                    let _ = self.attempt().await;
                }
                _ = tick_opt(&mut self.heartbeat) => {
                    self.heartbeat().await;
                }
                event = recv_opt(&mut self.channel_events) => {
                    self.on_channel_event(event).await;
                }
            }
        }
        debug!("Connection task for {} stopped", self.config.channel_name);
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut shared = self.shared.lock();
            let changed = shared.state != state;
            shared.state = state;
            changed
        };
        if changed {
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    async fn connect(&mut self) -> ConnectionResult<()> {
        if self.destroyed {
            return Err(ConnectionError::Destroyed);
        }
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            _ => {}
        }
        self.reconnect_at = None;
        self.attempt().await
    }

    async fn attempt(&mut self) -> ConnectionResult<()> {
        self.set_state(ConnectionState::Connecting);

        let name = self.config.channel_name.clone();
        let (channel, owned) = match self.transport.find_active_channel(&name) {
            Some(existing) => {
                debug!("Reusing live channel {}", name);
                (existing, false)
            }
            None => (self.transport.channel(&name), true),
        };

        for filter in &self.config.change_filters {
            channel.listen_postgres_changes(filter.clone());
        }

        let events = channel.events();
        let joined = match tokio::time::timeout(self.config.connect_timeout, channel.subscribe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Transport(e)),
            Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout)),
        };

        match joined {
            Ok(()) => {
                self.channel = Some(channel.clone());
                self.owns_channel = owned;
                self.channel_events = Some(events);
                self.attempts = 0;

                let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
                let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);

                {
                    let mut shared = self.shared.lock();
                    shared.channel = Some(channel);
                    shared.stats.connected_at = Some(Utc::now());
                    shared.stats.reconnect_attempts = 0;
                }
                self.set_state(ConnectionState::Connected);
                self.emit(ConnectionEvent::Connected);
                info!("Channel {} connected", name);
                Ok(())
            }
            Err(err) => {
                warn!("Channel {} failed to connect: {}", name, err);
                if channel.status().is_active() {
                    let _ = channel.unsubscribe().await;
                }
                if owned {
                    self.transport.remove_channel(channel.id());
                }
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Record an error, enter `Error` and schedule the next attempt
    fn fail(&mut self, message: String) {
        self.shared.lock().stats.last_error = Some(message.clone());
        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::Error(message));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.auto_reconnect || self.destroyed {
            return;
        }

        if self.attempts >= self.config.max_reconnect_attempts {
            let message = format!(
                "gave up on {} after {} reconnect attempts",
                self.config.channel_name, self.attempts
            );
            error!("{}", message);
            self.shared.lock().stats.last_error = Some(message.clone());
            self.set_state(ConnectionState::Error);
            self.emit(ConnectionEvent::Error(message));
            return;
        }

        let delay = backoff_delay(
            self.config.reconnect_delay,
            self.attempts,
            self.config.max_reconnect_delay,
        );
        self.attempts += 1;
        self.shared.lock().stats.reconnect_attempts = self.attempts;
        self.reconnect_at = Some(Instant::now() + delay);
        debug!(
            "Reconnect {} of {} for {} in {:?}",
            self.attempts, self.config.max_reconnect_attempts, self.config.channel_name, delay
        );
        self.emit(ConnectionEvent::ReconnectScheduled {
            attempt: self.attempts,
            delay,
        });
    }

    async fn heartbeat(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        if channel.status() != ChannelStatus::Joined {
            self.connection_lost("heartbeat found channel not joined").await;
            return;
        }

        let started = Instant::now();
        let ping = json!({ "sent_at": Utc::now().timestamp_millis() });
        match channel.send_broadcast(HEARTBEAT_EVENT, ping).await {
            Ok(()) => {
                let latency = started.elapsed();
                self.shared.lock().stats.latency = Some(latency);
                self.emit(ConnectionEvent::Latency(latency));
            }
            Err(e) => {
                self.connection_lost(&format!("heartbeat failed: {}", e)).await;
            }
        }
    }

    async fn on_channel_event(&mut self, event: Result<ChannelEvent, broadcast::error::RecvError>) {
        match event {
            Ok(ChannelEvent::Status(status))
                if matches!(status, ChannelStatus::Errored | ChannelStatus::Closed)
                    && self.state() == ConnectionState::Connected =>
            {
                self.connection_lost(&format!("channel reported {:?}", status)).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Connection task lagged {} channel events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.channel_events = None;
            }
        }
    }

    /// Tear down after a silent drop and try again if allowed
    async fn connection_lost(&mut self, reason: &str) {
        warn!("Channel {} lost: {}", self.config.channel_name, reason);
        self.release_channel().await;
        self.shared.lock().stats.last_error = Some(reason.to_string());
        self.mark_disconnected();
        self.schedule_reconnect();
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.attempts = 0;
        self.release_channel().await;
        self.mark_disconnected();
    }

    async fn destroy(&mut self) {
        self.destroyed = true;
        self.shared.lock().destroyed = true;
        self.disconnect().await;
        // dropping the sender closes every listener
        self.events.lock().take();
        info!("Connection manager for {} destroyed", self.config.channel_name);
    }

    fn mark_disconnected(&mut self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.shared.lock().stats.disconnected_at = Some(Utc::now());
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    async fn release_channel(&mut self) {
        self.heartbeat = None;
        self.channel_events = None;

        let Some(channel) = self.channel.take() else {
            return;
        };
        self.shared.lock().channel = None;

        if channel.status().is_active() {
            if let Err(e) = channel.unsubscribe().await {
                warn!("Unsubscribe from {} failed: {}", channel.name(), e);
            }
        }
        if self.owns_channel {
            self.transport.remove_channel(channel.id());
        }
        self.owns_channel = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    fn manager(transport: Arc<MemoryTransport>, config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager::new(config, transport)
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<ConnectionEvent>, f: F) -> ConnectionEvent
    where
        F: Fn(&ConnectionEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if f(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, 0, cap), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2, cap), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 5, cap), cap);
        assert_eq!(backoff_delay(base, 40, cap), cap);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = Arc::new(MemoryTransport::standalone());
        let mgr = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));

        mgr.connect().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert!(mgr.stats().connected_at.is_some());
        assert_eq!(transport.joined_count("company:c1"), 1);

        mgr.disconnect().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.channel().is_none());
        assert_eq!(transport.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::standalone());
        let mgr = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));
        mgr.connect().await.unwrap();

        let mut events = mgr.subscribe();
        mgr.disconnect().await;
        let stats_once = mgr.stats();
        mgr.disconnect().await;

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.stats().disconnected_at, stats_once.disconnected_at);

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if event == ConnectionEvent::Disconnected {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_never_two_joined_channels_per_name() {
        let transport = Arc::new(MemoryTransport::standalone());
        let mgr = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));

        for _ in 0..3 {
            mgr.connect().await.unwrap();
            mgr.connect().await.unwrap();
            assert_eq!(transport.joined_count("company:c1"), 1);
            mgr.disconnect().await;
            assert_eq!(transport.joined_count("company:c1"), 0);
        }
    }

    #[tokio::test]
    async fn test_reuses_live_channel_without_owning_it() {
        let transport = Arc::new(MemoryTransport::standalone());
        let first = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));
        let second = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));

        first.connect().await.unwrap();
        second.connect().await.unwrap();
        assert_eq!(transport.channel_count(), 1);
        assert_eq!(first.channel().unwrap().id(), second.channel().unwrap().id());
    }

    #[tokio::test]
    async fn test_destroy_blocks_connect_and_closes_events() {
        let transport = Arc::new(MemoryTransport::standalone());
        let mgr = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));
        mgr.connect().await.unwrap();

        let mut events = mgr.subscribe();
        mgr.destroy().await;

        assert!(mgr.is_destroyed());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(matches!(mgr.connect().await, Err(ConnectionError::Destroyed)));

        // drain what was sent before the sender went away
        loop {
            match events.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_until_exhausted() {
        let hub = MemoryHub::new();
        hub.set_offline(true);
        let transport = Arc::new(hub.transport());
        let mgr = manager(
            transport,
            ConnectionConfig::for_channel("company:c1").with_reconnect_delay(Duration::from_millis(1000)),
        );
        let mut events = mgr.subscribe();

        assert!(mgr.connect().await.is_err());
        assert_eq!(mgr.state(), ConnectionState::Error);

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::ReconnectScheduled { delay, .. } => delays.push(delay.as_millis()),
                ConnectionEvent::Error(message) if message.starts_with("gave up") => break,
                _ => {}
            }
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(hub.subscribe_attempts(), 6);
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(mgr.stats().last_error.unwrap().starts_with("gave up"));

        // nothing further is scheduled
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hub.subscribe_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transient_failures() {
        let hub = MemoryHub::new();
        hub.fail_next_subscribes(2);
        let transport = Arc::new(hub.transport());
        let mgr = manager(transport.clone(), ConnectionConfig::for_channel("company:c1"));
        let mut events = mgr.subscribe();

        assert!(mgr.connect().await.is_err());
        next_matching(&mut events, |e| *e == ConnectionEvent::Connected).await;

        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.stats().reconnect_attempts, 0);
        assert_eq!(transport.joined_count("company:c1"), 1);
        assert_eq!(transport.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_detects_dropped_channel() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.transport());
        let config = ConnectionConfig::for_channel("company:c1").with_heartbeat_interval(Duration::from_secs(30));
        let mgr = manager(transport.clone(), config);
        mgr.connect().await.unwrap();
        let mut events = mgr.subscribe();

        hub.drop_connections();
        next_matching(&mut events, |e| *e == ConnectionEvent::Disconnected).await;
        next_matching(&mut events, |e| *e == ConnectionEvent::Connected).await;

        assert_eq!(transport.joined_count("company:c1"), 1);
        assert!(mgr.stats().disconnected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_keeps_task_alive() {
        let transport = Arc::new(MemoryTransport::standalone());
        let config = ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            ..ConnectionConfig::for_channel("company:c1")
        };
        let mgr = manager(transport.clone(), config);

        tokio_test::assert_ok!(mgr.connect().await);
        let mut events = mgr.subscribe();
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::Latency(_))).await;

        mgr.disconnect().await;
        tokio_test::assert_ok!(mgr.connect().await);
        assert!(!mgr.is_destroyed());
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(transport.joined_count("company:c1"), 1);

        let clamped = ConnectionConfig::default().with_heartbeat_interval(Duration::ZERO);
        assert_eq!(clamped.heartbeat_interval, MIN_HEARTBEAT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_records_latency() {
        let transport = Arc::new(MemoryTransport::standalone());
        let mgr = manager(transport, ConnectionConfig::for_channel("company:c1"));
        mgr.connect().await.unwrap();
        let mut events = mgr.subscribe();

        next_matching(&mut events, |e| matches!(e, ConnectionEvent::Latency(_))).await;
        assert!(mgr.stats().latency.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_send_failure_disconnects() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.transport());
        let config = ConnectionConfig::for_channel("company:c1").with_auto_reconnect(false);
        let mgr = manager(transport, config);
        mgr.connect().await.unwrap();
        let mut events = mgr.subscribe();

        hub.set_fail_sends(true);
        next_matching(&mut events, |e| *e == ConnectionEvent::Disconnected).await;

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.stats().last_error.unwrap().contains("heartbeat failed"));
    }
}
