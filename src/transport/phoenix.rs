//! Phoenix-protocol WebSocket transport for the hosted realtime service.
//!
//! One [`PhoenixSocket`] multiplexes every channel of a transport over a
//! single WebSocket. Frames are JSON objects:
//!
//! ```text
//! { "topic": "realtime:<name>", "event": "phx_join", "payload": {...},
//!   "ref": "7", "join_ref": "7" }
//! ```
//!
//! Pushes that expect an answer register their `ref` and wait for the
//! matching `phx_reply`. The socket keeps itself alive with a `heartbeat`
//! push on the `phoenix` topic and reports a lost connection to every
//! channel as an `Errored` status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{
    ChangeFilter, ChangeKind, ChannelEvent, ChannelStatus, PresenceState, RealtimeChannel,
    RealtimeTransport, RowChange, TrackedMembers, TransportError, TransportResult,
    CHANNEL_EVENT_CAPACITY,
};

/// Topic used for socket-level heartbeats
const PHOENIX_TOPIC: &str = "phoenix";

/// Protocol version announced in the socket URL
const PROTOCOL_VSN: &str = "1.0.0";

/// Meta field carrying the payloads of every consumer sharing a channel
const PRESENCE_MEMBERS: &str = "members";

/// Floor for the socket heartbeat; `interval` rejects a zero period
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the realtime socket
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// `wss://<host>/realtime/v1/websocket`
    pub endpoint: String,
    /// Project API key
    pub api_key: String,
    /// User JWT; the API key is used when absent
    pub access_token: Option<String>,
    /// Socket heartbeat interval
    pub heartbeat_interval: Duration,
    /// How long to wait for a `phx_reply`
    pub push_timeout: Duration,
}

impl PhoenixConfig {
    /// Build from the backend base URL (`https://<ref>.supabase.co`)
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: realtime_endpoint(base_url),
            api_key: api_key.into(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(25),
            push_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    fn socket_url(&self) -> String {
        format!(
            "{}?apikey={}&vsn={}",
            self.endpoint, self.api_key, PROTOCOL_VSN
        )
    }

    fn token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

fn realtime_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };
    format!("{}/realtime/v1/websocket", ws)
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn encode(&self) -> TransportResult<String> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> TransportResult<Self> {
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// Answer to a push
#[derive(Debug, Clone)]
struct Reply {
    status: String,
    response: Value,
}

impl Reply {
    fn from_payload(payload: &Value) -> Self {
        Self {
            status: payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string(),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {}", self.status, self.response))
    }
}

/// A live WebSocket connection and the tasks servicing it
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Shared socket behind every channel of a [`PhoenixTransport`]
pub struct PhoenixSocket {
    config: PhoenixConfig,
    connection: tokio::sync::Mutex<Option<Connection>>,
    generation: AtomicU64,
    refs: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    channels: Mutex<Vec<Weak<PhoenixChannel>>>,
}

impl PhoenixSocket {
    fn new(config: PhoenixConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connection: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            refs: AtomicU64::new(0),
            pending: DashMap::new(),
            channels: Mutex::new(Vec::new()),
        })
    }

    fn next_ref(&self) -> String {
        (self.refs.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn register(&self, channel: &Arc<PhoenixChannel>) {
        self.channels.lock().push(Arc::downgrade(channel));
    }

    fn unregister(&self, id: u64) {
        self.channels
            .lock()
            .retain(|c| c.upgrade().map(|c| c.id != id).unwrap_or(false));
    }

    fn live_channels(&self) -> Vec<Arc<PhoenixChannel>> {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    /// Outbound queue of the current connection, connecting first if needed
    async fn ensure_connected(self: &Arc<Self>) -> TransportResult<mpsc::UnboundedSender<String>> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.outbound.is_closed() {
                return Ok(conn.outbound.clone());
            }
        }

        let url = self.config.socket_url();
        let (stream, _) = tokio::time::timeout(
            self.config.push_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout("socket connect".to_string()))?
        .map_err(|e| TransportError::Connection(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Realtime socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Ok(Message::Text(text)) => socket.dispatch(&text),
                    Ok(Message::Close(frame)) => {
                        debug!("Realtime socket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Realtime socket read failed: {}", e);
                        break;
                    }
                }
            }
            if let Some(socket) = weak.upgrade() {
                socket.connection_lost(generation).await;
            }
        });

        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let heartbeat_tx = outbound.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                let frame = socket.heartbeat_frame();
                drop(socket);
                let sent = match frame {
                    Ok(text) => heartbeat_tx.send(text).is_ok(),
                    Err(e) => {
                        warn!("Failed to encode realtime heartbeat: {}", e);
                        true
                    }
                };
                if !sent {
                    warn!("Realtime socket heartbeat failed: writer closed");
                    if let Some(socket) = weak.upgrade() {
                        socket.connection_lost(generation).await;
                    }
                    return;
                }
            }
        });

        info!("Realtime socket connected to {}", self.config.endpoint);
        *guard = Some(Connection {
            generation,
            outbound: outbound.clone(),
            tasks: vec![writer, reader, heartbeat],
        });
        Ok(outbound)
    }

    /// Tear down connection `generation` and fail every active channel
    async fn connection_lost(&self, generation: u64) {
        let lost = {
            let mut guard = self.connection.lock().await;
            let current = guard
                .as_ref()
                .map(|conn| conn.generation == generation)
                .unwrap_or(false);
            if current {
                guard.take()
            } else {
                None
            }
        };
        let Some(lost) = lost else {
            return;
        };

        warn!("Realtime socket connection lost");
        self.pending.clear();
        for channel in self.live_channels() {
            if channel.status().is_active() {
                channel.set_status(ChannelStatus::Errored);
            }
        }
        drop(lost);
    }

    /// Close the socket deliberately
    async fn close(&self) {
        let conn = self.connection.lock().await.take();
        self.pending.clear();
        for channel in self.live_channels() {
            channel.set_status(ChannelStatus::Closed);
        }
        drop(conn);
    }

    fn dispatch(&self, text: &str) {
        let msg = match PhoenixMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed realtime frame: {}", e);
                return;
            }
        };

        if msg.event == "phx_reply" {
            if let Some(reference) = msg.reference.as_ref() {
                if let Some((_, tx)) = self.pending.remove(reference) {
                    let _ = tx.send(Reply::from_payload(&msg.payload));
                    return;
                }
            }
        }

        for channel in self.live_channels() {
            if channel.topic == msg.topic {
                channel.handle_message(&msg);
            }
        }
    }

    /// Encoded heartbeat; written straight to the outbound queue, replies are ignored
    fn heartbeat_frame(&self) -> TransportResult<String> {
        PhoenixMessage {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(self.next_ref()),
            join_ref: None,
        }
        .encode()
    }

    async fn push(
        self: &Arc<Self>,
        topic: &str,
        event: &str,
        payload: Value,
        join_ref: Option<String>,
    ) -> TransportResult<Reply> {
        let reference = self.next_ref();
        self.push_with_ref(topic, event, payload, reference, join_ref).await
    }

    async fn push_with_ref(
        self: &Arc<Self>,
        topic: &str,
        event: &str,
        payload: Value,
        reference: String,
        join_ref: Option<String>,
    ) -> TransportResult<Reply> {
        let outbound = self.ensure_connected().await?;

        let msg = PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.clone()),
            join_ref,
        };
        let text = msg.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(reference.clone(), tx);

        if outbound.send(text).is_err() {
            self.pending.remove(&reference);
            return Err(TransportError::Connection("socket closed".to_string()));
        }

        match tokio::time::timeout(self.config.push_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Connection(
                "socket closed before reply".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&reference);
                Err(TransportError::Timeout(format!("{} on {}", event, topic)))
            }
        }
    }
}

/// A `realtime:<name>` topic on the shared socket
pub struct PhoenixChannel {
    id: u64,
    name: String,
    topic: String,
    socket: Arc<PhoenixSocket>,
    status: Mutex<ChannelStatus>,
    join_ref: Mutex<Option<String>>,
    /// Identifies this client in the topic's presence state
    presence_key: String,
    filters: Mutex<Vec<ChangeFilter>>,
    /// Consumers' payloads, published together as one presence meta
    tracked: Mutex<TrackedMembers>,
    events: broadcast::Sender<ChannelEvent>,
}

impl PhoenixChannel {
    fn new(id: u64, name: &str, socket: Arc<PhoenixSocket>) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        Arc::new(Self {
            id,
            name: name.to_string(),
            topic: format!("realtime:{}", name),
            socket,
            status: Mutex::new(ChannelStatus::Closed),
            join_ref: Mutex::new(None),
            presence_key: uuid::Uuid::new_v4().to_string(),
            filters: Mutex::new(Vec::new()),
            tracked: Mutex::new(TrackedMembers::default()),
            events,
        })
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

    fn current_join_ref(&self) -> Option<String> {
        self.join_ref.lock().clone()
    }

    fn ensure_joined(&self) -> TransportResult<()> {
        if *self.status.lock() == ChannelStatus::Joined {
            Ok(())
        } else {
            Err(TransportError::NotJoined(self.name.clone()))
        }
    }

    fn join_payload(&self) -> Value {
        let changes: Vec<Value> = self
            .filters
            .lock()
            .iter()
            .map(|f| {
                let mut entry = json!({
                    "event": f.event.map(ChangeKind::as_str).unwrap_or("*"),
                    "schema": f.schema,
                    "table": f.table,
                });
                if let Some(filter) = &f.filter {
                    entry["filter"] = json!(filter);
                }
                entry
            })
            .collect();

        json!({
            "config": {
                "broadcast": { "ack": true, "self": false },
                "presence": { "key": self.presence_key },
                "postgres_changes": changes,
            },
            "access_token": self.socket.config.token(),
        })
    }

    /// Publish the current member list, or withdraw the meta when empty
    async fn push_presence(&self, presences: Vec<Value>) -> TransportResult<()> {
        if presences.is_empty() {
            self.push("presence", json!({ "type": "presence", "event": "untrack" }))
                .await
        } else {
            self.push(
                "presence",
                json!({
                    "type": "presence",
                    "event": "track",
                    "payload": { PRESENCE_MEMBERS: presences },
                }),
            )
            .await
        }
    }

    async fn push(&self, event: &str, payload: Value) -> TransportResult<()> {
        let reply = self
            .socket
            .push(&self.topic, event, payload, self.current_join_ref())
            .await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(TransportError::SendFailed(reply.reason()))
        }
    }

    fn handle_message(&self, msg: &PhoenixMessage) {
        if let (Some(incoming), Some(current)) = (msg.join_ref.as_ref(), self.current_join_ref()) {
            if *incoming != current {
                return;
            }
        }

        match msg.event.as_str() {
            "postgres_changes" => match parse_postgres_change(&msg.payload) {
                Some(change) => self.deliver(ChannelEvent::PostgresChange(change)),
                None => warn!("Dropping malformed change payload on {}", self.topic),
            },
            "presence_state" => {
                self.deliver(ChannelEvent::PresenceSync(parse_presence_map(&msg.payload)));
            }
            "presence_diff" => {
                for (key, presences) in parse_presence_map(&msg.payload["joins"]) {
                    self.deliver(ChannelEvent::PresenceJoin { key, presences });
                }
                for (key, presences) in parse_presence_map(&msg.payload["leaves"]) {
                    self.deliver(ChannelEvent::PresenceLeave { key, presences });
                }
            }
            "broadcast" => {
                let event = msg.payload["event"].as_str().unwrap_or_default().to_string();
                let payload = msg.payload.get("payload").cloned().unwrap_or(Value::Null);
                self.deliver(ChannelEvent::Broadcast { event, payload });
            }
            "phx_error" => {
                warn!("Realtime channel {} errored", self.topic);
                self.set_status(ChannelStatus::Errored);
            }
            "phx_close" => self.set_status(ChannelStatus::Closed),
            other => debug!("Ignoring realtime event {} on {}", other, self.topic),
        }
    }
}

fn parse_postgres_change(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let non_null = |key: &str| data.get(key).filter(|v| !v.is_null()).cloned();

    Some(RowChange {
        schema: data.get("schema")?.as_str()?.to_string(),
        table: data.get("table")?.as_str()?.to_string(),
        kind: ChangeKind::parse(data.get("type")?.as_str()?)?,
        record: non_null("record"),
        old_record: non_null("old_record"),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

fn parse_presence_map(value: &Value) -> PresenceState {
    let Some(entries) = value.as_object() else {
        return PresenceState::new();
    };

    entries
        .iter()
        .map(|(key, entry)| {
            let metas = entry
                .get("metas")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .flat_map(|mut meta| {
                    if let Some(obj) = meta.as_object_mut() {
                        obj.remove("phx_ref");
                        obj.remove("phx_ref_prev");
                    }
                    match meta.get(PRESENCE_MEMBERS).and_then(Value::as_array) {
                        Some(members) => members.clone(),
                        None => vec![meta],
                    }
                })
                .collect();
            (key.clone(), metas)
        })
        .collect()
}

#[async_trait]
impl RealtimeChannel for PhoenixChannel {
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
        let join_ref = self.socket.next_ref();
        *self.join_ref.lock() = Some(join_ref.clone());

        let result = self
            .socket
            .push_with_ref(
                &self.topic,
                "phx_join",
                self.join_payload(),
                join_ref.clone(),
                Some(join_ref),
            )
            .await;

        match result {
            Ok(reply) if reply.is_ok() => {
                debug!("Joined realtime topic {}", self.topic);
                self.set_status(ChannelStatus::Joined);
                Ok(())
            }
            Ok(reply) => {
                self.set_status(ChannelStatus::Errored);
                Err(TransportError::SubscribeFailed(reply.reason()))
            }
            Err(e) => {
                self.set_status(ChannelStatus::Errored);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self) -> TransportResult<()> {
        if self.status() == ChannelStatus::Closed {
            return Ok(());
        }

        self.set_status(ChannelStatus::Leaving);
        if let Err(e) = self.push("phx_leave", json!({})).await {
            debug!("Leave of {} not acknowledged: {}", self.topic, e);
        }
        *self.join_ref.lock() = None;
        self.tracked.lock().clear();
        self.set_status(ChannelStatus::Closed);
        Ok(())
    }

    async fn track(&self, member: &str, payload: Value) -> TransportResult<()> {
        self.ensure_joined()?;
        let (previous, presences) = {
            let mut tracked = self.tracked.lock();
            let previous = tracked.set(member, payload);
            (previous, tracked.payloads())
        };

        let result = self.push_presence(presences).await;
        if result.is_err() {
            let mut tracked = self.tracked.lock();
            match previous {
                Some(previous) => {
                    tracked.set(member, previous);
                }
                None => {
                    tracked.remove(member);
                }
            }
        }
        result
    }

    async fn untrack(&self, member: &str) -> TransportResult<()> {
        self.ensure_joined()?;
        let presences = {
            let mut tracked = self.tracked.lock();
            if tracked.remove(member).is_none() {
                return Ok(());
            }
            tracked.payloads()
        };
        self.push_presence(presences).await
    }

    async fn send_broadcast(&self, event: &str, payload: Value) -> TransportResult<()> {
        self.ensure_joined()?;
        self.push(
            "broadcast",
            json!({ "type": "broadcast", "event": event, "payload": payload }),
        )
        .await
    }
}

/// Channel registry over one shared realtime socket
pub struct PhoenixTransport {
    socket: Arc<PhoenixSocket>,
    channels: Mutex<Vec<Arc<PhoenixChannel>>>,
    next_id: AtomicU64,
}

impl PhoenixTransport {
    pub fn new(config: PhoenixConfig) -> Self {
        Self {
            socket: PhoenixSocket::new(config),
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Close the socket; channels report `Closed`
    pub async fn disconnect(&self) {
        self.socket.close().await;
    }
}

impl RealtimeTransport for PhoenixTransport {
    fn channel(&self, name: &str) -> Arc<dyn RealtimeChannel> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = PhoenixChannel::new(id, name, self.socket.clone());
        self.socket.register(&channel);
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
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| c.id != id);
        let removed = channels.len() != before;
        drop(channels);

        if removed {
            self.socket.unregister(id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_endpoint() {
        assert_eq!(
            realtime_endpoint("https://abc.supabase.co/"),
            "wss://abc.supabase.co/realtime/v1/websocket"
        );
        assert_eq!(
            realtime_endpoint("http://localhost:54321"),
            "ws://localhost:54321/realtime/v1/websocket"
        );
    }

    #[test]
    fn test_heartbeat_frame_uses_socket_topic() {
        let socket = PhoenixSocket::new(PhoenixConfig::new("https://abc.supabase.co", "anon"));
        let first = PhoenixMessage::decode(&socket.heartbeat_frame().unwrap()).unwrap();
        let second = PhoenixMessage::decode(&socket.heartbeat_frame().unwrap()).unwrap();

        assert_eq!(first.topic, "phoenix");
        assert_eq!(first.event, "heartbeat");
        assert_eq!(first.payload, json!({}));
        assert!(first.join_ref.is_none());
        assert_ne!(first.reference, second.reference);
        // nothing waits on a heartbeat reply
        assert!(socket.pending.is_empty());
    }

    #[test]
    fn test_zero_heartbeat_interval_is_clamped() {
        let config = PhoenixConfig::new("https://abc.supabase.co", "anon")
            .with_heartbeat_interval(Duration::ZERO);
        assert_eq!(config.heartbeat_interval, MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_socket_url_carries_key_and_version() {
        let config = PhoenixConfig::new("https://abc.supabase.co", "anon");
        assert_eq!(
            config.socket_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(config.token(), "anon");
        assert_eq!(config.with_access_token("jwt").token(), "jwt");
    }

    #[test]
    fn test_message_wire_format() {
        let msg = PhoenixMessage {
            topic: "realtime:company:c1".to_string(),
            event: "phx_join".to_string(),
            payload: json!({}),
            reference: Some("1".to_string()),
            join_ref: Some("1".to_string()),
        };
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(encoded["ref"], "1");
        assert_eq!(encoded["join_ref"], "1");

        let decoded = PhoenixMessage::decode(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"3"}"#,
        )
        .unwrap();
        assert_eq!(decoded.reference.as_deref(), Some("3"));
        assert!(decoded.join_ref.is_none());
    }

    #[test]
    fn test_parse_postgres_change() {
        let payload = json!({
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "interviews",
                "type": "UPDATE",
                "commit_timestamp": "2024-03-01T10:00:00Z",
                "record": {"id": "i-1", "project_id": "p-1"},
                "old_record": {"id": "i-1"},
                "errors": null
            }
        });
        let change = parse_postgres_change(&payload).unwrap();
        assert_eq!(change.table, "interviews");
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.record.unwrap()["project_id"], "p-1");
        assert!(change.commit_timestamp.is_some());

        assert!(parse_postgres_change(&json!({"data": {"table": "x"}})).is_none());
    }

    #[test]
    fn test_parse_presence_map_strips_refs() {
        let payload = json!({
            "abc": { "metas": [ { "phx_ref": "F1", "user_id": "u-1" } ] }
        });
        let state = parse_presence_map(&payload);
        assert_eq!(state["abc"].len(), 1);
        assert!(state["abc"][0].get("phx_ref").is_none());
        assert_eq!(state["abc"][0]["user_id"], "u-1");
    }

    #[test]
    fn test_parse_presence_map_flattens_members() {
        let payload = json!({
            "abc": { "metas": [ {
                "phx_ref": "F2",
                "members": [ { "user_id": "u-1" }, { "user_id": "u-2" } ]
            } ] }
        });
        let state = parse_presence_map(&payload);
        assert_eq!(state["abc"], vec![json!({"user_id": "u-1"}), json!({"user_id": "u-2"})]);
    }

    #[test]
    fn test_join_payload_lists_filters() {
        let transport = PhoenixTransport::new(PhoenixConfig::new("https://abc.supabase.co", "anon"));
        let channel = PhoenixChannel::new(1, "company:c1", transport.socket.clone());
        channel.listen_postgres_changes(ChangeFilter::table("interviews").with_eq("project_id", "p-1"));
        channel.listen_postgres_changes(ChangeFilter::table("interview_notes"));

        let payload = channel.join_payload();
        let changes = payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["filter"], "project_id=eq.p-1");
        assert_eq!(changes[1]["event"], "*");
        assert_eq!(payload["access_token"], "anon");
        assert_eq!(payload["config"]["presence"]["key"].as_str().map(str::len), Some(36));
    }

    #[test]
    fn test_stale_join_ref_messages_are_ignored() {
        let transport = PhoenixTransport::new(PhoenixConfig::new("https://abc.supabase.co", "anon"));
        let channel = PhoenixChannel::new(1, "company:c1", transport.socket.clone());
        *channel.join_ref.lock() = Some("5".to_string());
        let mut rx = channel.events();

        let stale = PhoenixMessage {
            topic: "realtime:company:c1".to_string(),
            event: "phx_close".to_string(),
            payload: json!({}),
            reference: None,
            join_ref: Some("2".to_string()),
        };
        channel.handle_message(&stale);
        assert!(rx.try_recv().is_err());

        let current = PhoenixMessage {
            join_ref: Some("5".to_string()),
            event: "phx_error".to_string(),
            ..stale
        };
        channel.handle_message(&current);
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::Status(ChannelStatus::Errored)));
    }
}
