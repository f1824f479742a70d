//! Automatic reconnection with exponential backoff.
//!
//! Each server has at most one pending reconnection task. The task sleeps for
//! the current backoff delay, makes one attempt, and re-arms itself with a
//! longer delay until the server is back or the attempt ceiling is reached.
//! Cancelling stops the pending sleep; an attempt already in flight runs to
//! completion but does not re-arm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use toolmesh_core::MonitoringConfig;

use super::events::{EventEmitter, ReconnectionEvent};
use crate::error::McpError;
use crate::session::SessionProvider;

/// Upper bound of the random jitter, as a fraction of the delay.
pub const JITTER_RATIO: f64 = 0.1;

/// Backoff and retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectionConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Pause between closing the stale session and opening a new one.
    pub settle_delay: Duration,
}

impl From<&MonitoringConfig> for ReconnectionConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            base_delay: config.reconnect_interval(),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_reconnect_attempts,
            settle_delay: config.reconnect_settle(),
        }
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

/// Un-jittered delay before attempt `attempt + 1`.
pub fn base_backoff(config: &ReconnectionConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let millis = (config.base_delay.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(config.max_delay)
}

/// Record of one reconnection attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionAttempt {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Reconnection progress for one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStatus {
    pub server_id: String,
    pub is_reconnecting: bool,
    /// Attempts since the last success or reset.
    pub total_attempts: u32,
    pub last_attempt: Option<ReconnectionAttempt>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Delay of the most recently scheduled attempt (ms).
    pub backoff_delay: u64,
    pub max_attempts_reached: bool,
}

impl ReconnectionStatus {
    fn new(server_id: &str, config: &ReconnectionConfig) -> Self {
        Self {
            server_id: server_id.to_string(),
            is_reconnecting: false,
            total_attempts: 0,
            last_attempt: None,
            next_attempt_at: None,
            backoff_delay: config.base_delay.as_millis() as u64,
            max_attempts_reached: false,
        }
    }
}

enum AttemptOutcome {
    Connected,
    Retry,
    Abandoned,
}

struct PendingReconnect {
    generation: u64,
    cancel: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

struct Inner {
    provider: Arc<dyn SessionProvider>,
    config: ReconnectionConfig,
    statuses: RwLock<HashMap<String, ReconnectionStatus>>,
    pending: Mutex<HashMap<String, PendingReconnect>>,
    generation: AtomicU64,
    events: EventEmitter<ReconnectionEvent>,
}

/// Schedules and runs reconnection attempts per server.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<Inner>,
}

impl ReconnectionManager {
    pub fn new(provider: Arc<dyn SessionProvider>, config: ReconnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                config,
                statuses: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                events: EventEmitter::new(),
            }),
        }
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventEmitter<ReconnectionEvent> {
        &self.inner.events
    }

    /// Start tracking a server. Existing status is kept.
    pub fn register(&self, server_id: &str) {
        self.inner
            .statuses
            .write()
            .entry(server_id.to_string())
            .or_insert_with(|| ReconnectionStatus::new(server_id, &self.inner.config));
    }

    /// Jittered backoff delay before attempt `attempt + 1`.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = base_backoff(&self.inner.config, attempt);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_RATIO));
        base + jitter
    }

    /// Arm a reconnection timer. Returns false if the server is unknown,
    /// already reconnecting, or has exhausted its attempts.
    pub fn schedule_reconnection(&self, server_id: &str) -> bool {
        let scheduled = {
            let mut statuses = self.inner.statuses.write();
            let Some(status) = statuses.get_mut(server_id) else {
                warn!(server = %server_id, "Cannot schedule reconnection for unknown server");
                return false;
            };
            if status.is_reconnecting {
                debug!(server = %server_id, "Reconnection already scheduled");
                return false;
            }
            if status.max_attempts_reached {
                debug!(server = %server_id, "Reconnection attempts exhausted, not scheduling");
                return false;
            }

            status.is_reconnecting = true;
            let (delay, attempt) = self.plan_next(status);
            self.spawn_pending(server_id, delay);
            (delay, attempt)
        };

        self.announce(server_id, scheduled);
        true
    }

    fn plan_next(&self, status: &mut ReconnectionStatus) -> (Duration, u32) {
        let delay = self.calculate_backoff_delay(status.total_attempts);
        status.backoff_delay = delay.as_millis() as u64;
        status.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        (delay, status.total_attempts + 1)
    }

    fn announce(&self, server_id: &str, (delay, attempt): (Duration, u32)) {
        let delay_ms = delay.as_millis() as u64;
        info!(server = %server_id, attempt, delay_ms, "Reconnection scheduled");
        self.inner.events.emit(ReconnectionEvent::Started {
            server_id: server_id.to_string(),
            attempt,
        });
        self.inner.events.emit(ReconnectionEvent::BackoffDelay {
            server_id: server_id.to_string(),
            delay_ms,
            attempt,
        });
    }

    fn spawn_pending(&self, server_id: &str, delay: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = watch::channel(false);
        let manager = self.clone();
        let id = server_id.to_string();
        let handle = tokio::spawn(async move {
            manager.run_pending(id, delay, cancelled, generation).await;
        });

        let previous = self.inner.pending.lock().insert(
            server_id.to_string(),
            PendingReconnect {
                generation,
                cancel,
                _handle: handle,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
        }
    }

    async fn run_pending(
        self,
        server_id: String,
        mut delay: Duration,
        mut cancelled: watch::Receiver<bool>,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.changed() => break,
            }

            if let Some(status) = self.inner.statuses.write().get_mut(&server_id) {
                status.next_attempt_at = None;
            }

            match self.try_reconnect(&server_id).await {
                AttemptOutcome::Connected | AttemptOutcome::Abandoned => break,
                AttemptOutcome::Retry => {}
            }
            if *cancelled.borrow() {
                break;
            }

            match self.rearm(&server_id) {
                Some(next) => delay = next,
                None => break,
            }
        }

        let mut pending = self.inner.pending.lock();
        if pending
            .get(&server_id)
            .is_some_and(|p| p.generation == generation)
        {
            pending.remove(&server_id);
        }
    }

    fn rearm(&self, server_id: &str) -> Option<Duration> {
        let next = {
            let mut statuses = self.inner.statuses.write();
            let status = statuses.get_mut(server_id)?;
            if status.max_attempts_reached {
                status.is_reconnecting = false;
                return None;
            }
            status.is_reconnecting = true;
            self.plan_next(status)
        };
        self.announce(server_id, next);
        Some(next.0)
    }

    /// Make one reconnection attempt. On a retryable failure a new attempt
    /// is scheduled unless one is already pending.
    pub async fn attempt_reconnection(&self, server_id: &str) -> bool {
        match self.try_reconnect(server_id).await {
            AttemptOutcome::Connected => true,
            AttemptOutcome::Abandoned => false,
            AttemptOutcome::Retry => {
                if !self.inner.pending.lock().contains_key(server_id) {
                    if let Some(status) = self.inner.statuses.write().get_mut(server_id) {
                        status.is_reconnecting = false;
                    }
                    self.schedule_reconnection(server_id);
                }
                false
            }
        }
    }

    async fn try_reconnect(&self, server_id: &str) -> AttemptOutcome {
        let attempt = {
            let mut statuses = self.inner.statuses.write();
            let Some(status) = statuses.get_mut(server_id) else {
                warn!(server = %server_id, "Reconnection attempt for unknown server");
                return AttemptOutcome::Abandoned;
            };
            status.total_attempts += 1;
            status.total_attempts
        };

        info!(server = %server_id, attempt, "Attempting reconnection");

        if let Err(e) = self.inner.provider.close_session(server_id).await {
            debug!(server = %server_id, error = %e, "Ignoring error closing stale session");
        }
        tokio::time::sleep(self.inner.config.settle_delay).await;

        let outcome = match self.inner.provider.create_session(server_id, true).await {
            Ok(_) if self.inner.provider.is_connected(server_id).await => Ok(()),
            Ok(_) => Err(McpError::NotConnected(server_id.to_string())),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.record_success(server_id, attempt);
                AttemptOutcome::Connected
            }
            Err(e) => self.record_failure(server_id, attempt, e.to_string()),
        }
    }

    fn record_success(&self, server_id: &str, attempt: u32) {
        if let Some(status) = self.inner.statuses.write().get_mut(server_id) {
            status.total_attempts = 0;
            status.is_reconnecting = false;
            status.max_attempts_reached = false;
            status.next_attempt_at = None;
            status.backoff_delay = self.inner.config.base_delay.as_millis() as u64;
            status.last_attempt = Some(ReconnectionAttempt {
                attempt,
                timestamp: Utc::now(),
                success: true,
                error: None,
            });
        }

        info!(server = %server_id, attempts = attempt, "Reconnected");
        self.inner.events.emit(ReconnectionEvent::Success {
            server_id: server_id.to_string(),
            attempts: attempt,
        });
    }

    fn record_failure(&self, server_id: &str, attempt: u32, error: String) -> AttemptOutcome {
        let abandoned = {
            let mut statuses = self.inner.statuses.write();
            match statuses.get_mut(server_id) {
                Some(status) => {
                    status.last_attempt = Some(ReconnectionAttempt {
                        attempt,
                        timestamp: Utc::now(),
                        success: false,
                        error: Some(error.clone()),
                    });
                    if status.total_attempts >= self.inner.config.max_attempts {
                        status.max_attempts_reached = true;
                        status.is_reconnecting = false;
                        status.next_attempt_at = None;
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };

        warn!(server = %server_id, attempt, error = %error, "Reconnection attempt failed");
        self.inner.events.emit(ReconnectionEvent::Failed {
            server_id: server_id.to_string(),
            error,
            attempt,
        });

        if abandoned {
            error!(server = %server_id, attempts = attempt, "Giving up on reconnection");
            self.inner.events.emit(ReconnectionEvent::Abandoned {
                server_id: server_id.to_string(),
                attempts: attempt,
            });
            AttemptOutcome::Abandoned
        } else {
            AttemptOutcome::Retry
        }
    }

    /// Cancel any pending timer, clear the attempt budget and try once now.
    pub async fn reconnect_server(&self, server_id: &str) -> bool {
        if !self.inner.statuses.read().contains_key(server_id) {
            warn!(server = %server_id, "Manual reconnection for unknown server");
            return false;
        }
        self.reset_reconnection_status(server_id);
        self.attempt_reconnection(server_id).await
    }

    /// Stop the pending timer for a server, if any.
    pub fn cancel_reconnection(&self, server_id: &str) {
        if let Some(status) = self.inner.statuses.write().get_mut(server_id) {
            status.is_reconnecting = false;
            status.next_attempt_at = None;
        }
        if let Some(pending) = self.inner.pending.lock().remove(server_id) {
            let _ = pending.cancel.send(true);
            debug!(server = %server_id, "Cancelled pending reconnection");
        }
    }

    /// Cancel and return the server to a fresh status.
    pub fn reset_reconnection_status(&self, server_id: &str) {
        self.cancel_reconnection(server_id);
        if let Some(status) = self.inner.statuses.write().get_mut(server_id) {
            *status = ReconnectionStatus::new(server_id, &self.inner.config);
        }
    }

    pub fn get_status(&self, server_id: &str) -> Option<ReconnectionStatus> {
        self.inner.statuses.read().get(server_id).cloned()
    }

    pub fn is_reconnecting(&self, server_id: &str) -> bool {
        self.inner
            .statuses
            .read()
            .get(server_id)
            .is_some_and(|s| s.is_reconnecting)
    }

    /// True once automatic reconnection gave up on the server. Cleared by a
    /// successful attempt or a reset.
    pub fn is_abandoned(&self, server_id: &str) -> bool {
        self.inner
            .statuses
            .read()
            .get(server_id)
            .is_some_and(|s| s.max_attempts_reached)
    }

    /// Number of servers with a pending reconnection task.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Cancel every pending timer and forget all statuses.
    pub fn shutdown(&self) {
        let pending: Vec<PendingReconnect> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.cancel.send(true);
        }
        self.inner.statuses.write().clear();
        debug!("Reconnection manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvider;

    fn config(max_attempts: u32) -> ReconnectionConfig {
        ReconnectionConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts,
            settle_delay: Duration::from_millis(10),
        }
    }

    fn manager(provider: Arc<FakeProvider>, max_attempts: u32) -> ReconnectionManager {
        let manager = ReconnectionManager::new(provider, config(max_attempts));
        manager.register("fs");
        manager
    }

    fn record_events(manager: &ReconnectionManager) -> Arc<Mutex<Vec<ReconnectionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.events().on(move |e| sink.lock().push(e.clone()));
        seen
    }

    fn count(events: &[ReconnectionEvent], f: impl Fn(&ReconnectionEvent) -> bool) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    async fn settle_for(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[test]
    fn test_base_backoff_doubles_and_caps() {
        let config = config(5);
        assert_eq!(base_backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(base_backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(base_backoff(&config, 3), Duration::from_millis(800));
        assert_eq!(base_backoff(&config, 4), Duration::from_millis(1000));
        assert_eq!(base_backoff(&config, 60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_jitter_stays_within_ten_percent() {
        let manager = manager(FakeProvider::with_servers(&["fs"]), 5);
        for attempt in 0..6 {
            let base = base_backoff(manager.config(), attempt);
            for _ in 0..50 {
                let delay = manager.calculate_backoff_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.0 + JITTER_RATIO));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.set_reachable("fs", false);
        let manager = manager(provider, 5);
        let events = record_events(&manager);

        assert!(manager.schedule_reconnection("fs"));
        assert!(!manager.schedule_reconnection("fs"));
        assert!(manager.is_reconnecting("fs"));
        assert_eq!(manager.pending_count(), 1);

        let events = events.lock();
        assert_eq!(
            count(&events, |e| matches!(e, ReconnectionEvent::Started { .. })),
            1
        );
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_schedule_unknown_server() {
        let manager = manager(FakeProvider::with_servers(&["fs"]), 5);
        assert!(!manager.schedule_reconnection("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failures() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.script_opens("fs", &[false, false, true]);
        let manager = manager(provider.clone(), 5);
        let events = record_events(&manager);

        assert!(manager.schedule_reconnection("fs"));
        settle_for(Duration::from_secs(10)).await;

        let status = manager.get_status("fs").unwrap();
        assert!(!status.is_reconnecting);
        assert_eq!(status.total_attempts, 0);
        assert!(status.last_attempt.unwrap().success);
        assert_eq!(manager.pending_count(), 0);
        assert!(provider.server("fs").connected);

        let events = events.lock();
        assert_eq!(count(&events, |e| matches!(e, ReconnectionEvent::Started { .. })), 3);
        assert_eq!(count(&events, |e| matches!(e, ReconnectionEvent::Failed { .. })), 2);
        assert_eq!(
            count(&events, |e| matches!(e, ReconnectionEvent::Success { attempts: 3, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_after_max_attempts() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.set_reachable("fs", false);
        let manager = manager(provider, 3);
        let events = record_events(&manager);

        assert!(manager.schedule_reconnection("fs"));
        settle_for(Duration::from_secs(30)).await;

        let status = manager.get_status("fs").unwrap();
        assert!(status.max_attempts_reached);
        assert!(!status.is_reconnecting);
        assert_eq!(status.total_attempts, 3);
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.schedule_reconnection("fs"));

        let events = events.lock();
        assert_eq!(count(&events, |e| matches!(e, ReconnectionEvent::Started { .. })), 3);
        assert_eq!(
            count(&events, |e| matches!(e, ReconnectionEvent::Abandoned { attempts: 3, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.set_reachable("fs", false);
        let manager = manager(provider, 4);
        let events = record_events(&manager);

        manager.schedule_reconnection("fs");
        settle_for(Duration::from_secs(30)).await;

        let delays: Vec<u64> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReconnectionEvent::BackoffDelay { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays.len(), 4);
        for (i, delay) in delays.iter().enumerate() {
            let base = 100u64 << i;
            assert!(*delay >= base && *delay <= base + base / 10, "delay {} = {}", i, delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_attempt() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.set_reachable("fs", false);
        let manager = manager(provider.clone(), 5);

        manager.schedule_reconnection("fs");
        manager.cancel_reconnection("fs");
        settle_for(Duration::from_secs(10)).await;

        let status = manager.get_status("fs").unwrap();
        assert!(!status.is_reconnecting);
        assert_eq!(status.total_attempts, 0);
        assert_eq!(provider.server("fs").closes, 0);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_budget() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.set_reachable("fs", false);
        let manager = manager(provider.clone(), 2);

        manager.schedule_reconnection("fs");
        settle_for(Duration::from_secs(10)).await;
        assert!(manager.get_status("fs").unwrap().max_attempts_reached);
        assert!(manager.is_abandoned("fs"));

        provider.set_reachable("fs", true);
        assert!(manager.reconnect_server("fs").await);
        assert!(!manager.is_abandoned("fs"));

        let status = manager.get_status("fs").unwrap();
        assert!(!status.max_attempts_reached);
        assert_eq!(status.total_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_without_live_transport_is_failure() {
        let provider = FakeProvider::with_servers(&["fs"]);
        provider.update("fs", |s| s.live_after_open = false);
        let manager = manager(provider, 1);

        assert!(!manager.reconnect_server("fs").await);
        let status = manager.get_status("fs").unwrap();
        assert!(status.max_attempts_reached);
        assert!(status.last_attempt.unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_unknown_server() {
        let manager = manager(FakeProvider::with_servers(&["fs"]), 5);
        assert!(!manager.reconnect_server("ghost").await);
    }
}
