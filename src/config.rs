//! Environment-driven configuration.
//!
//! Every component has its own config struct with sensible defaults;
//! [`ClientConfig`] collects them and overrides the handful of knobs exposed
//! through environment variables.

use std::time::Duration;

use crate::storage::PostgrestConfig;
use crate::sync::{
    ConnectionConfig, DataSyncConfig, PresenceConfig, RegistryConfig, StrategyConfig,
};
use crate::transport::PhoenixConfig;

pub const DEFAULT_DIAGNOSTICS_PORT: u16 = 5055;

/// Errors raised while reading configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Full configuration for a realtime client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL, `https://<ref>.supabase.co`
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    /// User JWT; the anon key is used when absent
    pub access_token: Option<String>,
    /// Tenant whose channels are followed
    pub company_id: Option<String>,
    /// Project to follow at startup
    pub project_id: Option<String>,
    /// Port of the diagnostics HTTP surface
    pub diagnostics_port: u16,
    pub registry: RegistryConfig,
    pub data: DataSyncConfig,
    pub presence: PresenceConfig,
    pub strategy: StrategyConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            access_token: None,
            company_id: None,
            project_id: None,
            diagnostics_port: DEFAULT_DIAGNOSTICS_PORT,
            registry: RegistryConfig::default(),
            data: DataSyncConfig::default(),
            presence: PresenceConfig::default(),
            strategy: StrategyConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Read from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut connection = ConnectionConfig::default();
        if let Some(ms) = parse_var(&get, "SYNC_HEARTBEAT_INTERVAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    name: "SYNC_HEARTBEAT_INTERVAL_MS",
                    value: "0".to_string(),
                });
            }
            connection = connection.with_heartbeat_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&get, "SYNC_RECONNECT_DELAY_MS")? {
            connection = connection.with_reconnect_delay(Duration::from_millis(ms));
        }
        if let Some(attempts) = parse_var(&get, "SYNC_MAX_RECONNECT_ATTEMPTS")? {
            connection = connection.with_max_reconnect_attempts(attempts);
        }

        let mut registry = RegistryConfig::default().with_connection(connection);
        if let Some(max) = parse_var(&get, "SYNC_MAX_CHANNELS")? {
            if max == 0 {
                return Err(ConfigError::Invalid {
                    name: "SYNC_MAX_CHANNELS",
                    value: "0".to_string(),
                });
            }
            registry = registry.with_max_channels(max);
        }

        let mut data = DataSyncConfig::default();
        if let Some(ms) = parse_var(&get, "SYNC_BATCH_WINDOW_MS")? {
            data = data.with_batch_window(Duration::from_millis(ms));
        }

        Ok(Self {
            supabase_url: get("SUPABASE_URL"),
            anon_key: get("SUPABASE_ANON_KEY"),
            access_token: get("SUPABASE_ACCESS_TOKEN"),
            company_id: get("SYNC_COMPANY_ID"),
            project_id: get("SYNC_PROJECT_ID"),
            diagnostics_port: parse_var(&get, "DIAGNOSTICS_PORT")?.unwrap_or(DEFAULT_DIAGNOSTICS_PORT),
            registry,
            data,
            presence: PresenceConfig::default(),
            strategy: StrategyConfig::default(),
        })
    }

    pub fn company_id(&self) -> Result<&str, ConfigError> {
        self.company_id.as_deref().ok_or(ConfigError::Missing("SYNC_COMPANY_ID"))
    }

    fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        let url = self.supabase_url.as_deref().ok_or(ConfigError::Missing("SUPABASE_URL"))?;
        let key = self.anon_key.as_deref().ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?;
        Ok((url, key))
    }

    /// Realtime socket settings for the hosted backend
    pub fn phoenix_config(&self) -> Result<PhoenixConfig, ConfigError> {
        let (url, key) = self.credentials()?;
        let mut config = PhoenixConfig::new(url, key)
            .with_heartbeat_interval(self.registry.connection.heartbeat_interval);
        if let Some(token) = &self.access_token {
            config = config.with_access_token(token.clone());
        }
        Ok(config)
    }

    /// REST settings for the hosted backend
    pub fn postgrest_config(&self) -> Result<PostgrestConfig, ConfigError> {
        let (url, key) = self.credentials()?;
        let mut config = PostgrestConfig::new(url, key);
        if let Some(token) = &self.access_token {
            config = config.with_access_token(token.clone());
        }
        Ok(config)
    }
}

fn parse_var<T, G>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.diagnostics_port, 5055);
        assert_eq!(config.registry.max_channels, 50);
        assert_eq!(config.registry.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.registry.connection.reconnect_delay, Duration::from_millis(1000));
        assert_eq!(config.registry.connection.max_reconnect_attempts, 5);
        assert_eq!(config.data.batch_window, Duration::from_millis(100));
        assert!(config.supabase_url.is_none());
        assert_eq!(config.company_id(), Err(ConfigError::Missing("SYNC_COMPANY_ID")));
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("SYNC_COMPANY_ID", "c-1"),
            ("SYNC_HEARTBEAT_INTERVAL_MS", "15000"),
            ("SYNC_MAX_RECONNECT_ATTEMPTS", "8"),
            ("SYNC_MAX_CHANNELS", "10"),
            ("SYNC_BATCH_WINDOW_MS", "250"),
            ("DIAGNOSTICS_PORT", "9000"),
        ]))
        .unwrap();

        assert_eq!(config.company_id(), Ok("c-1"));
        assert_eq!(config.registry.connection.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.registry.connection.max_reconnect_attempts, 8);
        assert_eq!(config.registry.max_channels, 10);
        assert_eq!(config.data.batch_window, Duration::from_millis(250));
        assert_eq!(config.diagnostics_port, 9000);

        let rest = tokio_test::assert_ok!(config.postgrest_config());
        assert_eq!(rest.rest_url, "https://demo.supabase.co/rest/v1");
        tokio_test::assert_ok!(config.phoenix_config());
    }

    #[test]
    fn test_invalid_number() {
        let err = ClientConfig::from_lookup(lookup(&[("SYNC_MAX_CHANNELS", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "SYNC_MAX_CHANNELS",
                value: "lots".to_string()
            }
        );
        assert!(ClientConfig::from_lookup(lookup(&[("SYNC_MAX_CHANNELS", "0")])).is_err());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let err = tokio_test::assert_err!(ClientConfig::from_lookup(lookup(&[(
            "SYNC_HEARTBEAT_INTERVAL_MS",
            "0"
        )])));
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "SYNC_HEARTBEAT_INTERVAL_MS",
                value: "0".to_string()
            }
        );

        let config =
            ClientConfig::from_lookup(lookup(&[("SYNC_HEARTBEAT_INTERVAL_MS", "1")])).unwrap();
        assert!(config.registry.connection.heartbeat_interval >= crate::sync::MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_missing_credentials() {
        let config = ClientConfig::from_lookup(lookup(&[("SUPABASE_URL", "https://x")])).unwrap();
        assert!(matches!(
            config.phoenix_config(),
            Err(ConfigError::Missing("SUPABASE_ANON_KEY"))
        ));
        // blank values count as unset
        let config = ClientConfig::from_lookup(lookup(&[("SUPABASE_URL", "  ")])).unwrap();
        assert!(config.supabase_url.is_none());
    }
}
