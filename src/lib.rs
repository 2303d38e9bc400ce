//! Insight Sync - realtime data synchronization for interview projects
//!
//! Keeps a client-side view of a project's interviews, notes and replies in
//! step with a hosted Postgres backend:
//! - shared, ref-counted realtime channels per (company, project)
//! - reconnect with exponential backoff and heartbeat-based loss detection
//! - initial bulk load plus batched row-change application
//! - per-interview presence with staleness filtering
//! - adaptive fallback from push to polling when the connection degrades
//!
//! ```no_run
//! use std::sync::Arc;
//! use insight_sync::storage::InMemoryDataSource;
//! use insight_sync::sync::{ChannelRegistry, RealtimeClient, RegistryConfig};
//! use insight_sync::transport::MemoryTransport;
//!
//! # async fn run() -> Result<(), insight_sync::sync::SyncError> {
//! let registry = Arc::new(ChannelRegistry::new(
//!     RegistryConfig::default(),
//!     Arc::new(MemoryTransport::standalone()),
//! ));
//! let client = RealtimeClient::new("company-1", registry, Arc::new(InMemoryDataSource::new()));
//! let snapshot = client.subscribe_to_project("project-1").await?;
//! println!("{} interviews", snapshot.interviews.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use sync::{ClientSnapshot, RealtimeClient, SyncError, SyncResult};
