//! Realtime synchronization core.
//!
//! This module keeps a project's interviews, notes, replies and presence in
//! step with the hosted backend:
//! - one connection manager per channel (connect, heartbeat, backoff reconnect)
//! - a registry sharing managers between consumers with ref counts and idle eviction
//! - batched row-change handling on top of an initial bulk load
//! - presence tracking with periodic re-announcement and staleness filtering
//! - an adaptive selector choosing push, polling or nothing per feature
//!
//! Components talk through typed broadcast/watch channels, never by calling
//! into each other. [`client::RealtimeClient`] wires them together.

pub mod client;
pub mod connection;
pub mod data;
pub mod optimistic;
pub mod presence;
pub mod registry;
pub mod strategy;

pub use client::{ClientSnapshot, RealtimeClient, SYNC_FEATURE};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionStats, MIN_HEARTBEAT_INTERVAL,
};
pub use data::{
    DataSyncConfig, DataSyncEvent, DataSyncManager, LocalChange, ProjectSnapshot, RecordType, SyncState,
};
pub use optimistic::PendingMutation;
pub use presence::{
    PresenceConfig, PresenceError, PresenceEvent, PresenceManager, PresenceMap, PresenceUser,
};
pub use registry::{ChannelHandle, ChannelRegistry, ChannelStatsEntry, RegistryConfig, RegistryError};
pub use strategy::{
    FeatureStatus, StrategyConfig, StrategyEvent, StrategySelector, StrategyTransition, SyncStrategy,
};

pub use crate::storage::{InterviewId, ProjectId, UserId};

use std::future::pending;
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval};

use crate::storage::FetchError;
use crate::transport::TransportError;

/// Tenant (company) identifier
pub type TenantId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not subscribed to a project")]
    NotSubscribed,

    #[error("Manager stopped")]
    Stopped,
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Next tick of an optional interval
pub(crate) async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

/// Receive from an optional broadcast receiver
pub(crate) async fn recv_opt<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::from(FetchError::Unavailable("offline".to_string()));
        assert_eq!(err.to_string(), "Fetch failed: Data source unavailable: offline");
        assert_eq!(SyncError::NotSubscribed.to_string(), "Not subscribed to a project");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_opt_without_deadline_never_fires() {
        let fired = tokio::time::timeout(Duration::from_secs(3600), sleep_until_opt(None)).await;
        assert!(fired.is_err());

        let deadline = Instant::now() + Duration::from_millis(5);
        sleep_until_opt(Some(deadline)).await;
        assert!(Instant::now() >= deadline);
    }
}
