//! Process-wide cache of connection managers.
//!
//! The registry owns every [`ConnectionManager`]; callers only hold
//! [`ChannelHandle`]s. Managers are keyed by tenant and optional project, shared
//! by reference count, and kept around after release until idle eviction or
//! explicit close.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionStats,
};
use crate::transport::{ChangeFilter, RealtimeChannel, RealtimeTransport};

/// Configuration for the channel registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cached managers, referenced or not
    pub max_channels: usize,
    /// Unreferenced channels idle this long are eligible for eviction
    pub max_idle: Duration,
    /// Period of the background idle sweep
    pub sweep_interval: Duration,
    /// Polls while another caller's connect is in flight
    pub wait_attempts: u32,
    pub wait_interval: Duration,
    /// Share of capacity freed by one eviction pass
    pub eviction_fraction: f64,
    /// Template for new managers; the channel name is filled in per key
    pub connection: ConnectionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: 50,
            max_idle: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            wait_attempts: 50,
            wait_interval: Duration::from_millis(100),
            eviction_fraction: 0.2,
            connection: ConnectionConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle = idle;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry at capacity ({0} channels, all referenced)")]
    AtCapacity(usize),

    #[error("Timed out waiting for channel {0} to connect")]
    ConnectTimeout(String),

    #[error("Channel {0} was closed")]
    Closed(String),
}

/// Deterministic channel name for a tenant and optional project
pub fn channel_key(tenant_id: &str, project_id: Option<&str>) -> String {
    match project_id {
        Some(project) => format!("company:{}:project:{}", tenant_id, project),
        None => format!("company:{}", tenant_id),
    }
}

/// Opaque reference to a registry-owned channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelHandle {
    id: u64,
    key: String,
}

impl ChannelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Diagnostics row for one cached channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatsEntry {
    pub key: String,
    pub state: ConnectionState,
    /// Handles currently held by callers
    pub ref_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub connection: ConnectionStats,
}

struct Entry {
    id: u64,
    manager: Arc<ConnectionManager>,
    ref_count: usize,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    last_accessed: Instant,
}

impl Entry {
    fn handle(&self, key: &str) -> ChannelHandle {
        ChannelHandle {
            id: self.id,
            key: key.to_string(),
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.last_accessed_at = Utc::now();
    }
}

pub struct ChannelRegistry {
    config: RegistryConfig,
    transport: Arc<dyn RealtimeTransport>,
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig, transport: Arc<dyn RealtimeTransport>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            transport,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Get the shared channel for a key, creating and connecting it if needed.
    ///
    /// Each successful call takes one reference that must be returned with
    /// [`release_channel`](Self::release_channel). A channel whose first
    /// connect fails is still returned; its manager keeps retrying.
    pub async fn get_or_create_channel(
        &self,
        tenant_id: &str,
        project_id: Option<&str>,
    ) -> Result<ChannelHandle, RegistryError> {
        self.get_or_create_channel_with(tenant_id, project_id, Vec::new()).await
    }

    /// Like [`get_or_create_channel`](Self::get_or_create_channel), registering
    /// `filters` on a newly created channel before its first join
    pub async fn get_or_create_channel_with(
        &self,
        tenant_id: &str,
        project_id: Option<&str>,
        filters: Vec<ChangeFilter>,
    ) -> Result<ChannelHandle, RegistryError> {
        let key = channel_key(tenant_id, project_id);

        let (handle, manager, evicted) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.ref_count += 1;
                    entry.touch();
                    (entry.handle(&key), entry.manager.clone(), Vec::new())
                }
                None => {
                    let mut evicted = Vec::new();
                    if entries.len() >= self.config.max_channels {
                        for victim in self.select_evictions(&entries, Instant::now()) {
                            if let Some(entry) = entries.remove(&victim) {
                                evicted.push((victim, entry.manager));
                            }
                        }
                    }
                    if entries.len() >= self.config.max_channels {
                        return Err(RegistryError::AtCapacity(self.config.max_channels));
                    }

                    let mut config = self.config.connection.clone().with_channel_name(key.clone());
                    config.change_filters.extend(filters);
                    let manager = Arc::new(ConnectionManager::new(config, self.transport.clone()));
                    let now = Utc::now();
                    let entry = Entry {
                        id: self.next_id.fetch_add(1, Ordering::SeqCst),
                        manager: manager.clone(),
                        ref_count: 1,
                        created_at: now,
                        last_accessed_at: now,
                        last_accessed: Instant::now(),
                    };
                    let handle = entry.handle(&key);
                    entries.insert(key.clone(), entry);
                    debug!("Created channel {}", key);
                    (handle, manager, evicted)
                }
            }
        };

        for (victim, manager) in evicted {
            info!("Evicting idle channel {}", victim);
            manager.destroy().await;
        }

        match manager.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => {
                if !self.wait_until_settled(&manager).await {
                    self.release_handle(&handle);
                    return Err(RegistryError::ConnectTimeout(key));
                }
            }
            _ => match manager.connect().await {
                Ok(()) => {}
                Err(ConnectionError::Destroyed) => {
                    self.release_handle(&handle);
                    return Err(RegistryError::Closed(key));
                }
                Err(e) => warn!("Channel {} not connected yet: {}", key, e),
            },
        }

        Ok(handle)
    }

    async fn wait_until_settled(&self, manager: &ConnectionManager) -> bool {
        for _ in 0..self.config.wait_attempts {
            tokio::time::sleep(self.config.wait_interval).await;
            if manager.state() != ConnectionState::Connecting {
                return true;
            }
        }
        false
    }

    /// Unreferenced channels to drop so a new one fits
    fn select_evictions(&self, entries: &HashMap<String, Entry>, now: Instant) -> Vec<String> {
        let budget = ((self.config.max_channels as f64 * self.config.eviction_fraction).ceil() as usize).max(1);

        let mut idle: Vec<(&String, Instant)> = entries
            .iter()
            .filter(|(_, e)| {
                e.ref_count == 0 && now.saturating_duration_since(e.last_accessed) >= self.config.max_idle
            })
            .map(|(k, e)| (k, e.last_accessed))
            .collect();
        idle.sort_by_key(|(_, accessed)| *accessed);

        let mut victims: Vec<String> = idle.into_iter().take(budget).map(|(k, _)| k.clone()).collect();

        if victims.is_empty() {
            // nothing past the idle window: take the least recently used unreferenced channel
            if let Some((key, _)) = entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.last_accessed)
            {
                victims.push(key.clone());
            }
        }
        victims
    }

    /// Drop one reference. The channel stays cached for reuse.
    pub fn release_channel(&self, tenant_id: &str, project_id: Option<&str>) -> bool {
        let key = channel_key(tenant_id, project_id);
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Drop the reference taken for `handle`
    pub fn release_handle(&self, handle: &ChannelHandle) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&handle.key) {
            Some(entry) if entry.id == handle.id => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.touch();
                true
            }
            _ => false,
        }
    }

    /// Destroy and forget one channel regardless of references
    pub async fn close_channel(&self, tenant_id: &str, project_id: Option<&str>) -> bool {
        let key = channel_key(tenant_id, project_id);
        let removed = self.entries.lock().remove(&key);
        match removed {
            Some(entry) => {
                entry.manager.destroy().await;
                info!("Closed channel {}", key);
                true
            }
            None => false,
        }
    }

    pub async fn close_all_channels(&self) {
        let drained: Vec<(String, Entry)> = self.entries.lock().drain().collect();
        for (key, entry) in drained {
            entry.manager.destroy().await;
            debug!("Closed channel {}", key);
        }
        info!("All channels closed");
    }

    /// Evict unreferenced channels idle past the window; returns how many went
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let removed: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| {
                    e.ref_count == 0 && now.saturating_duration_since(e.last_accessed) > self.config.max_idle
                })
                .map(|(k, _)| k.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let count = removed.len();
        for (key, entry) in removed {
            info!("Sweeping idle channel {}", key);
            entry.manager.destroy().await;
        }
        count
    }

    pub fn get_channel_stats(&self) -> Vec<ChannelStatsEntry> {
        let now = Instant::now();
        let mut stats: Vec<ChannelStatsEntry> = self
            .entries
            .lock()
            .iter()
            .map(|(key, e)| ChannelStatsEntry {
                key: key.clone(),
                state: e.manager.state(),
                ref_count: e.ref_count,
                created_at: e.created_at,
                last_accessed_at: e.last_accessed_at,
                idle_secs: now.saturating_duration_since(e.last_accessed).as_secs(),
                connection: e.manager.stats(),
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    fn manager(&self, handle: &ChannelHandle) -> Option<Arc<ConnectionManager>> {
        self.entries
            .lock()
            .get(&handle.key)
            .filter(|e| e.id == handle.id)
            .map(|e| e.manager.clone())
    }

    pub fn state(&self, handle: &ChannelHandle) -> Option<ConnectionState> {
        self.manager(handle).map(|m| m.state())
    }

    pub fn channel(&self, handle: &ChannelHandle) -> Option<Arc<dyn RealtimeChannel>> {
        self.manager(handle).and_then(|m| m.channel())
    }

    pub fn subscribe_events(&self, handle: &ChannelHandle) -> Option<broadcast::Receiver<ConnectionEvent>> {
        self.manager(handle).map(|m| m.subscribe())
    }

    pub fn ref_count(&self, handle: &ChannelHandle) -> Option<usize> {
        self.entries
            .lock()
            .get(&handle.key)
            .filter(|e| e.id == handle.id)
            .map(|e| e.ref_count)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the sweep task
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start the periodic idle sweep
    pub fn start_cleanup_task(self: Arc<Self>) -> JoinHandle<()> {
        let registry = self;
        let sweep_interval = registry.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
            let mut shutdown = registry.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = registry.sweep_idle().await;
                        if swept > 0 {
                            debug!("Swept {} idle channels", swept);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Channel sweep task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    fn registry(transport: Arc<MemoryTransport>, config: RegistryConfig) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::new(config, transport))
    }

    #[test]
    fn test_channel_key() {
        assert_eq!(channel_key("c1", None), "company:c1");
        assert_eq!(channel_key("c1", Some("p9")), "company:c1:project:p9");
    }

    #[tokio::test]
    async fn test_get_or_create_connects_once() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());

        let a = reg.get_or_create_channel("c1", Some("p1")).await.unwrap();
        let b = reg.get_or_create_channel("c1", Some("p1")).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(reg.ref_count(&a), Some(2));
        assert_eq!(reg.state(&a), Some(ConnectionState::Connected));
        assert_eq!(transport.joined_count("company:c1:project:p1"), 1);
        assert!(reg.channel(&a).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_manager() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                reg.get_or_create_channel("c1", Some("p1")).await.unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert!(handles.iter().all(|h| *h == handles[0]));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ref_count(&handles[0]), Some(8));
        assert_eq!(transport.channel_count(), 1);

        for _ in 0..3 {
            reg.release_channel("c1", Some("p1"));
        }
        assert_eq!(reg.ref_count(&handles[0]), Some(5));
    }

    async fn until_joining(hub: &MemoryHub) {
        while hub.subscribe_attempts() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_caller_times_out_and_releases() {
        let hub = MemoryHub::new();
        hub.set_stall_subscribes(true);
        let reg = registry(Arc::new(hub.transport()), RegistryConfig::default());

        let first = tokio::spawn({
            let reg = reg.clone();
            async move { reg.get_or_create_channel("c1", Some("p1")).await }
        });
        until_joining(&hub).await;
        assert_eq!(reg.get_channel_stats()[0].state, ConnectionState::Connecting);

        let started = Instant::now();
        let err = tokio_test::assert_err!(reg.get_or_create_channel("c1", Some("p1")).await);
        assert!(matches!(err, RegistryError::ConnectTimeout(ref key) if key == "company:c1:project:p1"));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(reg.get_channel_stats()[0].ref_count, 1);

        // the first caller's own attempt hits the connect timeout and keeps its handle
        let handle = tokio_test::assert_ok!(first.await.unwrap());
        assert_eq!(reg.ref_count(&handle), Some(1));
        assert_ne!(reg.state(&handle), Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_caller_shares_settled_connect() {
        let hub = MemoryHub::new();
        hub.set_stall_subscribes(true);
        let reg = registry(Arc::new(hub.transport()), RegistryConfig::default());

        let first = tokio::spawn({
            let reg = reg.clone();
            async move { reg.get_or_create_channel("c1", Some("p1")).await }
        });
        until_joining(&hub).await;
        let second = tokio::spawn({
            let reg = reg.clone();
            async move { reg.get_or_create_channel("c1", Some("p1")).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        hub.set_stall_subscribes(false);

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.ref_count(&a), Some(2));
        assert_eq!(reg.state(&a), Some(ConnectionState::Connected));
        assert_eq!(hub.subscribe_attempts(), 1);
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport, RegistryConfig::default());
        let handle = reg.get_or_create_channel("c1", None).await.unwrap();

        assert!(reg.release_handle(&handle));
        assert!(reg.release_handle(&handle));
        assert!(reg.release_channel("c1", None));
        assert_eq!(reg.ref_count(&handle), Some(0));
        // still cached
        assert_eq!(reg.state(&handle), Some(ConnectionState::Connected));
        assert!(!reg.release_channel("c2", None));
    }

    #[tokio::test]
    async fn test_close_channel_destroys_manager() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());
        let handle = reg.get_or_create_channel("c1", Some("p1")).await.unwrap();

        assert!(reg.close_channel("c1", Some("p1")).await);
        assert_eq!(reg.state(&handle), None);
        assert_eq!(transport.channel_count(), 0);

        // a new channel under the same key gets a new identity
        let again = reg.get_or_create_channel("c1", Some("p1")).await.unwrap();
        assert_ne!(again.id(), handle.id());
        assert_eq!(reg.ref_count(&handle), None);
    }

    #[tokio::test]
    async fn test_close_all_channels() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());
        reg.get_or_create_channel("c1", Some("p1")).await.unwrap();
        reg.get_or_create_channel("c1", Some("p2")).await.unwrap();

        reg.close_all_channels().await;
        assert!(reg.is_empty());
        assert_eq!(transport.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());

        for i in 0..50 {
            let project = format!("p{}", i);
            reg.get_or_create_channel("c1", Some(&project)).await.unwrap();
            reg.release_channel("c1", Some(&project));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(reg.len(), 50);

        reg.get_or_create_channel("c1", Some("p50")).await.unwrap();

        assert_eq!(reg.len(), 50);
        let keys: Vec<String> = reg.get_channel_stats().into_iter().map(|s| s.key).collect();
        assert!(!keys.contains(&"company:c1:project:p0".to_string()));
        assert!(keys.contains(&"company:c1:project:p50".to_string()));
        assert_eq!(transport.channel_count(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_idle_batch() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());

        for i in 0..50 {
            let project = format!("p{}", i);
            reg.get_or_create_channel("c1", Some(&project)).await.unwrap();
            reg.release_channel("c1", Some(&project));
        }
        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        reg.get_or_create_channel("c1", Some("p50")).await.unwrap();

        // 20% of capacity freed in one pass, then one added
        assert_eq!(reg.len(), 41);
    }

    #[tokio::test]
    async fn test_at_capacity_when_all_referenced() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport, RegistryConfig::default().with_max_channels(2));
        reg.get_or_create_channel("c1", Some("p1")).await.unwrap();
        reg.get_or_create_channel("c1", Some("p2")).await.unwrap();

        let result = reg.get_or_create_channel("c1", Some("p3")).await;
        assert!(matches!(result, Err(RegistryError::AtCapacity(2))));
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_evicts_idle_channels() {
        let transport = Arc::new(MemoryTransport::standalone());
        let reg = registry(transport.clone(), RegistryConfig::default());
        let kept = reg.get_or_create_channel("c1", Some("p1")).await.unwrap();
        reg.get_or_create_channel("c1", Some("p2")).await.unwrap();
        reg.release_channel("c1", Some("p2"));

        let task = reg.clone().start_cleanup_task();
        tokio::time::sleep(Duration::from_secs(41 * 60)).await;

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ref_count(&kept), Some(1));

        reg.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_connect_still_returns_handle() {
        let transport = Arc::new(MemoryTransport::standalone());
        transport.hub().fail_next_subscribes(1);
        let reg = registry(transport, RegistryConfig::default());

        let handle = reg.get_or_create_channel("c1", None).await.unwrap();
        assert_eq!(reg.ref_count(&handle), Some(1));
        assert_ne!(reg.state(&handle), Some(ConnectionState::Connected));
        reg.close_all_channels().await;
    }
}
