//! Client facade.
//!
//! [`RealtimeClient`] is what a UI layer talks to. It follows one project at
//! a time: it takes a shared channel from the registry, points a data sync
//! manager and a presence manager at it, and republishes everything as one
//! [`ClientSnapshot`] on a watch channel. Connection errors and incoming
//! batches feed the strategy selector.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::data::LocalChange;
use super::presence::PresenceMap;
use super::{
    recv_opt, ChannelHandle, ChannelRegistry, ConnectionEvent, ConnectionState, DataSyncConfig,
    DataSyncEvent, DataSyncManager, PresenceConfig, PresenceManager, PresenceUser, ProjectId,
    StrategySelector, SyncError, SyncResult, SyncStrategy, TenantId,
};
use crate::storage::{Interview, ProjectDataSource};

/// Strategy feature name used for project data
pub const SYNC_FEATURE: &str = "interviews";

/// Everything a UI needs to render a project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub project_id: Option<ProjectId>,
    pub interviews: Vec<Interview>,
    pub presence: PresenceMap,
    pub connection_state: ConnectionState,
    pub is_loading: bool,
    pub error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub strategy: SyncStrategy,
}

impl ClientSnapshot {
    fn idle(strategy: SyncStrategy) -> Self {
        Self {
            project_id: None,
            interviews: Vec::new(),
            presence: PresenceMap::new(),
            connection_state: ConnectionState::Disconnected,
            is_loading: false,
            error: None,
            last_synced_at: None,
            strategy,
        }
    }
}

/// One followed project
struct Subscription {
    project_id: ProjectId,
    handle: ChannelHandle,
    data: Arc<DataSyncManager>,
    presence: Arc<PresenceManager>,
    /// Id of the channel object the managers listen on
    attached: Mutex<Option<u64>>,
}

impl Subscription {
    /// Point both managers at the registry's current channel
    fn attach(&self, registry: &ChannelRegistry) -> bool {
        let Some(channel) = registry.channel(&self.handle) else {
            return false;
        };
        let mut attached = self.attached.lock();
        if *attached == Some(channel.id()) {
            return false;
        }

        self.data.attach_to_channel(&channel);
        self.presence.attach_to_channel(&channel);
        *attached = Some(channel.id());
        true
    }

    /// Catch up after the connection came back
    async fn resync(&self, registry: &ChannelRegistry) {
        if self.attach(registry) {
            debug!("Re-attached {} to a new channel", self.project_id);
        }
        if self.presence.local_user().is_some() {
            if let Err(e) = self.presence.reannounce().await {
                warn!("Presence re-announce after reconnect failed: {}", e);
            }
        }
        if let Err(e) = self.data.force_sync().await {
            warn!("Resync of {} after reconnect failed: {}", self.project_id, e);
        }
    }

    fn snapshot(&self, registry: &ChannelRegistry, strategy: SyncStrategy) -> ClientSnapshot {
        let state = self.data.sync_state();
        ClientSnapshot {
            project_id: Some(self.project_id.clone()),
            interviews: self.data.snapshot().interviews,
            presence: self.presence.get_all_presence(),
            connection_state: registry
                .state(&self.handle)
                .unwrap_or(ConnectionState::Disconnected),
            is_loading: state.is_loading,
            error: state.error,
            last_synced_at: state.last_synced_at,
            strategy,
        }
    }
}

struct Active {
    subscription: Arc<Subscription>,
    forwarder: JoinHandle<()>,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    selector: Arc<StrategySelector>,
    snapshot_tx: watch::Sender<ClientSnapshot>,
}

impl Shared {
    fn publish(&self, subscription: Option<&Subscription>) {
        let strategy = self.selector.strategy(SYNC_FEATURE);
        let snapshot = match subscription {
            Some(sub) => sub.snapshot(&self.registry, strategy),
            None => ClientSnapshot::idle(strategy),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Relay manager events into the snapshot and strategy signals
async fn forward(
    shared: Arc<Shared>,
    sub: Arc<Subscription>,
    mut connection: Option<broadcast::Receiver<ConnectionEvent>>,
) {
    let mut data_events = sub.data.subscribe();
    let mut presence_events = sub.presence.subscribe();
    let mut data_watch = sub.data.watch_snapshot();
    let mut strategy_events = shared.selector.subscribe();

    loop {
        tokio::select! {
            event = recv_opt(&mut connection) => match event {
                Ok(ConnectionEvent::Connected) => sub.resync(&shared.registry).await,
                Ok(ConnectionEvent::Error(message)) => {
                    shared.selector.track_error(SYNC_FEATURE, &message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Connection events for {} closed", sub.project_id);
                    connection = None;
                }
            },
            event = data_events.recv() => match event {
                Ok(DataSyncEvent::BatchInsert { .. })
                | Ok(DataSyncEvent::BatchUpdate { .. })
                | Ok(DataSyncEvent::BatchDelete { .. }) => {
                    shared.selector.track_message(SYNC_FEATURE);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = presence_events.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    break;
                }
            }
            changed = data_watch.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = strategy_events.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    break;
                }
            }
        }
        shared.publish(Some(&sub));
    }
}

/// UI-facing entry point for following one project
pub struct RealtimeClient {
    tenant_id: TenantId,
    source: Arc<dyn ProjectDataSource>,
    data_config: DataSyncConfig,
    presence_config: PresenceConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<Active>>,
    /// Serializes subscribe/unsubscribe
    op_lock: tokio::sync::Mutex<()>,
}

impl RealtimeClient {
    pub fn new(
        tenant_id: impl Into<String>,
        registry: Arc<ChannelRegistry>,
        source: Arc<dyn ProjectDataSource>,
    ) -> Self {
        let selector = Arc::new(StrategySelector::default());
        let (snapshot_tx, _) = watch::channel(ClientSnapshot::idle(SyncStrategy::None));
        Self {
            tenant_id: tenant_id.into(),
            source,
            data_config: DataSyncConfig::default(),
            presence_config: PresenceConfig::default(),
            shared: Arc::new(Shared {
                registry,
                selector,
                snapshot_tx,
            }),
            active: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_data_config(mut self, config: DataSyncConfig) -> Self {
        self.data_config = config;
        self
    }

    pub fn with_presence_config(mut self, config: PresenceConfig) -> Self {
        self.presence_config = config;
        self
    }

    /// Share a selector, e.g. one whose monitoring loop is already running
    pub fn with_strategy_selector(mut self, selector: Arc<StrategySelector>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.selector = selector;
        }
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.shared.registry
    }

    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.shared.selector
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.current().map(|sub| sub.project_id.clone())
    }

    fn current(&self) -> Option<Arc<Subscription>> {
        self.active.lock().as_ref().map(|a| a.subscription.clone())
    }

    /// Follow `project_id`, replacing any current subscription.
    ///
    /// A failed initial load is returned but the subscription stays in place;
    /// the error is also visible in the snapshot.
    pub async fn subscribe_to_project(&self, project_id: &str) -> SyncResult<ClientSnapshot> {
        let _op = self.op_lock.lock().await;

        if self.project_id().as_deref() == Some(project_id) {
            return Ok(self.snapshot());
        }
        self.teardown().await;

        let registry = &self.shared.registry;
        let handle = registry
            .get_or_create_channel_with(
                &self.tenant_id,
                Some(project_id),
                DataSyncManager::change_filters(project_id),
            )
            .await?;

        let subscription = Arc::new(Subscription {
            project_id: project_id.to_string(),
            data: Arc::new(DataSyncManager::new(
                project_id,
                self.source.clone(),
                self.data_config.clone(),
            )),
            presence: Arc::new(PresenceManager::new(self.presence_config.clone())),
            attached: Mutex::new(None),
            handle,
        });
        subscription.attach(registry);
        self.shared.selector.track_connection(SYNC_FEATURE);

        let events = registry.subscribe_events(&subscription.handle);
        let forwarder = tokio::spawn(forward(self.shared.clone(), subscription.clone(), events));
        *self.active.lock() = Some(Active {
            subscription: subscription.clone(),
            forwarder,
        });
        info!("Subscribed to project {}", project_id);

        let loaded = subscription.data.load_initial_data().await;
        self.shared.publish(Some(&subscription));
        loaded.map(|_| self.snapshot())
    }

    /// Stop following the current project. The channel stays cached in the registry.
    pub async fn unsubscribe(&self) {
        let _op = self.op_lock.lock().await;
        self.teardown().await;
        self.shared.publish(None);
    }

    async fn teardown(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.forwarder.abort();

        let sub = active.subscription;
        if let Err(e) = sub.presence.untrack_user().await {
            debug!("Presence withdraw on unsubscribe failed: {}", e);
        }
        sub.presence.detach();
        sub.data.detach();
        self.shared.registry.release_handle(&sub.handle);
        self.shared.selector.untrack_connection(SYNC_FEATURE);
        info!("Unsubscribed from project {}", sub.project_id);
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let strategy = self.shared.selector.strategy(SYNC_FEATURE);
        match self.current() {
            Some(sub) => sub.snapshot(&self.shared.registry, strategy),
            None => ClientSnapshot::idle(strategy),
        }
    }

    pub fn watch(&self) -> watch::Receiver<ClientSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Presence for one interview of the current project
    pub fn interview_presence(&self, interview_id: &str) -> Vec<PresenceUser> {
        self.current()
            .map(|sub| sub.presence.get_interview_presence(interview_id))
            .unwrap_or_default()
    }

    /// Announce the local user on an interview. Failures are logged, not returned.
    pub async fn track_presence(&self, user: PresenceUser, interview_id: &str) {
        let Some(sub) = self.current() else {
            warn!("Cannot track presence without a project subscription");
            return;
        };
        if let Err(e) = sub.presence.track_user(user, interview_id).await {
            warn!("Failed to track presence on {}: {}", interview_id, e);
        }
    }

    pub async fn untrack_presence(&self) {
        let Some(sub) = self.current() else {
            return;
        };
        if let Err(e) = sub.presence.untrack_user().await {
            warn!("Failed to untrack presence: {}", e);
        }
    }

    /// Apply buffered changes and reload the project
    pub async fn refresh(&self) -> SyncResult<ClientSnapshot> {
        let sub = self.current().ok_or(SyncError::NotSubscribed)?;
        let result = sub.data.force_sync().await;
        self.shared.publish(Some(&sub));
        result.map(|_| self.snapshot())
    }

    /// Apply `change` now and roll it back if `request` fails
    pub async fn apply_optimistic<R, E, Fut>(&self, change: LocalChange, request: Fut) -> Result<R, E>
    where
        E: From<SyncError>,
        Fut: Future<Output = Result<R, E>>,
    {
        let sub = self.current().ok_or(SyncError::NotSubscribed)?;
        let result = sub.data.apply_optimistic(change, request).await;
        self.shared.publish(Some(&sub));
        result
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.shared.selector.strategy(SYNC_FEATURE)
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        self.shared.selector.polling_interval(SYNC_FEATURE)
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            active.forwarder.abort();
            active.subscription.data.detach();
            active.subscription.presence.detach();
            self.shared.registry.release_handle(&active.subscription.handle);
            self.shared.selector.untrack_connection(SYNC_FEATURE);
        }
    }
}
