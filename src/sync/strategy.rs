//! Adaptive sync strategy selection.
//!
//! Each named feature (e.g. `"interviews"`) runs one of push, polling or
//! nothing. Consumers feed connection, message and error signals in; a
//! monitoring loop re-evaluates every feature on a fixed period and announces
//! each change exactly once, through observers and a broadcast channel.
//!
//! Decision order for a feature:
//! 1. network offline, or no tracked connections: `None`
//! 2. `failure_threshold` or more errors inside `evaluation_window`: `Polling`
//! 3. currently `Polling` and the last error is within `recovery_cooldown`: `Polling`
//! 4. otherwise the preferred push strategy
//!
//! Before these rules run, `recovery_messages` messages received since the
//! last error count as proof of recovery: the recorded errors are cleared,
//! which ends polling without waiting out the window or the cooldown.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// History entries kept per feature
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    #[serde(rename = "websocket")]
    WebSocket,
    Sse,
    Polling,
    None,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStrategy::WebSocket => "websocket",
            SyncStrategy::Sse => "sse",
            SyncStrategy::Polling => "polling",
            SyncStrategy::None => "none",
        }
    }

    /// Server-pushed updates
    pub fn is_push(self) -> bool {
        matches!(self, SyncStrategy::WebSocket | SyncStrategy::Sse)
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the strategy selector
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Period of the evaluation loop
    pub monitor_interval: Duration,
    /// Errors older than this no longer count
    pub evaluation_window: Duration,
    /// Errors inside the window that trigger polling
    pub failure_threshold: usize,
    /// Error-free time required before leaving polling
    pub recovery_cooldown: Duration,
    /// Messages after the last error that clear the error record; 0 disables
    pub recovery_messages: u64,
    pub degraded_poll_interval: Duration,
    /// Used once errors reach twice the threshold
    pub severe_poll_interval: Duration,
    pub preferred: SyncStrategy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            evaluation_window: Duration::from_secs(60),
            failure_threshold: 3,
            recovery_cooldown: Duration::from_secs(30),
            recovery_messages: 5,
            degraded_poll_interval: Duration::from_secs(30),
            severe_poll_interval: Duration::from_secs(60),
            preferred: SyncStrategy::WebSocket,
        }
    }
}

impl StrategyConfig {
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_cooldown(mut self, cooldown: Duration) -> Self {
        self.recovery_cooldown = cooldown;
        self
    }

    pub fn with_recovery_messages(mut self, messages: u64) -> Self {
        self.recovery_messages = messages;
        self
    }

    pub fn with_preferred(mut self, preferred: SyncStrategy) -> Self {
        self.preferred = preferred;
        self
    }
}

/// One strategy change for one feature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyTransition {
    pub feature: String,
    pub from: SyncStrategy,
    pub to: SyncStrategy,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    Transition(StrategyTransition),
}

type Observer = Arc<dyn Fn(&StrategyTransition) + Send + Sync>;

struct FeatureState {
    strategy: SyncStrategy,
    connections: usize,
    messages: u64,
    messages_since_error: u64,
    last_message_at: Option<Instant>,
    errors: VecDeque<Instant>,
    last_error: Option<String>,
    history: Vec<StrategyTransition>,
}

impl FeatureState {
    fn new() -> Self {
        Self {
            strategy: SyncStrategy::None,
            connections: 0,
            messages: 0,
            messages_since_error: 0,
            last_message_at: None,
            errors: VecDeque::new(),
            last_error: None,
            history: Vec::new(),
        }
    }

    fn prune_errors(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.errors.front() {
            if now.saturating_duration_since(oldest) > window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Read-only view of a feature, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct FeatureStatus {
    pub feature: String,
    pub strategy: SyncStrategy,
    /// Consumers currently tracking the feature
    pub connections: usize,
    /// Messages seen since the feature was first tracked
    pub messages: u64,
    /// Errors inside the evaluation window
    pub recent_errors: usize,
    pub last_error: Option<String>,
}

/// Picks a sync mechanism per feature from observed health
pub struct StrategySelector {
    config: StrategyConfig,
    features: Mutex<HashMap<String, FeatureState>>,
    online: AtomicBool,
    observers: Mutex<Vec<Observer>>,
    events: broadcast::Sender<StrategyEvent>,
    shutdown: broadcast::Sender<()>,
}

impl StrategySelector {
    pub fn new(config: StrategyConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            features: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            observers: Mutex::new(Vec::new()),
            events,
            shutdown,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StrategyEvent> {
        self.events.subscribe()
    }

    /// Register a callback run once per transition
    pub fn on_transition<F>(&self, observer: F)
    where
        F: Fn(&StrategyTransition) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    /// Current strategy; untracked features run nothing
    pub fn strategy(&self, feature: &str) -> SyncStrategy {
        self.features
            .lock()
            .get(feature)
            .map(|f| f.strategy)
            .unwrap_or(SyncStrategy::None)
    }

    /// How often a consumer should poll, if at all
    pub fn polling_interval(&self, feature: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut features = self.features.lock();
        let state = features.get_mut(feature)?;
        if state.strategy != SyncStrategy::Polling {
            return None;
        }

        state.prune_errors(now, self.config.evaluation_window);
        if state.errors.len() >= self.config.failure_threshold * 2 {
            Some(self.config.severe_poll_interval)
        } else {
            Some(self.config.degraded_poll_interval)
        }
    }

    pub fn history(&self, feature: &str) -> Vec<StrategyTransition> {
        self.features
            .lock()
            .get(feature)
            .map(|f| f.history.clone())
            .unwrap_or_default()
    }

    pub fn feature_status(&self) -> Vec<FeatureStatus> {
        let now = Instant::now();
        let window = self.config.evaluation_window;
        let mut features = self.features.lock();
        let mut statuses: Vec<FeatureStatus> = features
            .iter_mut()
            .map(|(name, state)| {
                state.prune_errors(now, window);
                FeatureStatus {
                    feature: name.clone(),
                    strategy: state.strategy,
                    connections: state.connections,
                    messages: state.messages,
                    recent_errors: state.errors.len(),
                    last_error: state.last_error.clone(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.feature.cmp(&b.feature));
        statuses
    }

    pub fn track_connection(&self, feature: &str) {
        self.features
            .lock()
            .entry(feature.to_string())
            .or_insert_with(FeatureState::new)
            .connections += 1;
        self.evaluate_feature(feature);
    }

    pub fn untrack_connection(&self, feature: &str) {
        if let Some(state) = self.features.lock().get_mut(feature) {
            state.connections = state.connections.saturating_sub(1);
        }
        self.evaluate_feature(feature);
    }

    pub fn track_message(&self, feature: &str) {
        let mut features = self.features.lock();
        let state = features
            .entry(feature.to_string())
            .or_insert_with(FeatureState::new);
        state.messages += 1;
        state.messages_since_error += 1;
        state.last_message_at = Some(Instant::now());
    }

    /// Record a failure; picked up by the next evaluation
    pub fn track_error(&self, feature: &str, error: &str) {
        let now = Instant::now();
        let mut features = self.features.lock();
        let state = features
            .entry(feature.to_string())
            .or_insert_with(FeatureState::new);
        state.errors.push_back(now);
        state.messages_since_error = 0;
        state.prune_errors(now, self.config.evaluation_window);
        state.last_error = Some(error.to_string());
        debug!("{} error recorded ({} recent): {}", feature, state.errors.len(), error);
    }

    pub fn set_network_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!("Network {}", if online { "online" } else { "offline" });
            self.evaluate_now();
        }
    }

    pub fn is_network_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Re-evaluate every feature, announcing changes
    pub fn evaluate_now(&self) {
        let names: Vec<String> = self.features.lock().keys().cloned().collect();
        let transitions: Vec<StrategyTransition> = names
            .iter()
            .filter_map(|name| self.decide(name))
            .collect();
        self.announce(transitions);
    }

    fn evaluate_feature(&self, feature: &str) {
        let transitions: Vec<StrategyTransition> = self.decide(feature).into_iter().collect();
        self.announce(transitions);
    }

    /// Apply the decision rules to one feature, returning the transition if any
    fn decide(&self, feature: &str) -> Option<StrategyTransition> {
        let now = Instant::now();
        let online = self.is_network_online();
        let config = &self.config;

        let mut features = self.features.lock();
        let state = features.get_mut(feature)?;
        state.prune_errors(now, config.evaluation_window);

        let traffic_recovered = config.recovery_messages > 0
            && !state.errors.is_empty()
            && state.messages_since_error >= config.recovery_messages;
        if traffic_recovered {
            debug!(
                "{} received {} messages since its last error; clearing {} errors",
                feature,
                state.messages_since_error,
                state.errors.len()
            );
            state.errors.clear();
        }

        let last_error_recent = state
            .errors
            .back()
            .map(|&at| now.saturating_duration_since(at) < config.recovery_cooldown)
            .unwrap_or(false);

        let (next, reason) = if !online {
            (SyncStrategy::None, "network offline".to_string())
        } else if state.connections == 0 {
            (SyncStrategy::None, "no active connections".to_string())
        } else if state.errors.len() >= config.failure_threshold {
            (
                SyncStrategy::Polling,
                format!("{} errors within {:?}", state.errors.len(), config.evaluation_window),
            )
        } else if state.strategy == SyncStrategy::Polling && last_error_recent {
            (SyncStrategy::Polling, "recovery cooldown".to_string())
        } else if traffic_recovered {
            (config.preferred, "messages flowing again".to_string())
        } else {
            (config.preferred, "connection healthy".to_string())
        };

        if next == state.strategy {
            return None;
        }

        let transition = StrategyTransition {
            feature: feature.to_string(),
            from: state.strategy,
            to: next,
            at: Utc::now(),
            reason,
        };
        state.strategy = next;
        state.history.push(transition.clone());
        if state.history.len() > MAX_HISTORY {
            state.history.remove(0);
        }
        Some(transition)
    }

    fn announce(&self, transitions: Vec<StrategyTransition>) {
        if transitions.is_empty() {
            return;
        }

        let observers: Vec<Observer> = self.observers.lock().clone();
        for transition in transitions {
            if transition.to == SyncStrategy::Polling {
                warn!(
                    "{} degraded {} -> {} ({})",
                    transition.feature, transition.from, transition.to, transition.reason
                );
            } else {
                info!(
                    "{} strategy {} -> {} ({})",
                    transition.feature, transition.from, transition.to, transition.reason
                );
            }
            for observer in &observers {
                observer(&transition);
            }
            let _ = self.events.send(StrategyEvent::Transition(transition));
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop the monitoring loop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Start the periodic evaluation loop
    pub fn start_monitoring(self: Arc<Self>) -> JoinHandle<()> {
        let selector = self;
        let period = selector.config.monitor_interval.max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            let mut shutdown = selector.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        selector.evaluate_now();
                    }
                    _ = shutdown.recv() => {
                        info!("Strategy monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(StrategyConfig::default())
    }
}
