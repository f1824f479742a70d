//! Health and reconnection events.
//!
//! [`EventEmitter`] fans each event out to synchronous listeners and to a
//! broadcast channel. A panicking listener is logged and skipped; it never
//! reaches the emitter or the other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::error;

use super::types::HealthStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the health monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    ServerHealthy {
        server_id: String,
        previous: HealthStatus,
    },
    ServerUnhealthy {
        server_id: String,
        consecutive_failures: u32,
    },
    ServerDisconnected {
        server_id: String,
        error: String,
    },
    ServerReconnected {
        server_id: String,
    },
    CircuitBreakerOpened {
        server_id: String,
        consecutive_failures: u32,
    },
    CircuitBreakerClosed {
        server_id: String,
    },
    HealthCheckFailed {
        server_id: String,
        error: String,
    },
    ReconnectionFailed {
        server_id: String,
        error: String,
        attempt: u32,
    },
}

impl HealthEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::ServerHealthy { server_id, .. }
            | Self::ServerUnhealthy { server_id, .. }
            | Self::ServerDisconnected { server_id, .. }
            | Self::ServerReconnected { server_id }
            | Self::CircuitBreakerOpened { server_id, .. }
            | Self::CircuitBreakerClosed { server_id }
            | Self::HealthCheckFailed { server_id, .. }
            | Self::ReconnectionFailed { server_id, .. } => server_id,
        }
    }

    /// Kebab-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerHealthy { .. } => "server-healthy",
            Self::ServerUnhealthy { .. } => "server-unhealthy",
            Self::ServerDisconnected { .. } => "server-disconnected",
            Self::ServerReconnected { .. } => "server-reconnected",
            Self::CircuitBreakerOpened { .. } => "circuit-breaker-opened",
            Self::CircuitBreakerClosed { .. } => "circuit-breaker-closed",
            Self::HealthCheckFailed { .. } => "health-check-failed",
            Self::ReconnectionFailed { .. } => "reconnection-failed",
        }
    }
}

impl std::fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name(), self.server_id())?;
        match self {
            Self::ServerHealthy { previous, .. } => write!(f, " (was {})", previous),
            Self::ServerUnhealthy {
                consecutive_failures,
                ..
            }
            | Self::CircuitBreakerOpened {
                consecutive_failures,
                ..
            } => write!(f, " after {} failures", consecutive_failures),
            Self::ServerDisconnected { error, .. } | Self::HealthCheckFailed { error, .. } => {
                write!(f, ": {}", error)
            }
            Self::ReconnectionFailed { error, attempt, .. } => {
                write!(f, " attempt {}: {}", attempt, error)
            }
            _ => Ok(()),
        }
    }
}

/// Events published by the reconnection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionEvent {
    Started {
        server_id: String,
        attempt: u32,
    },
    BackoffDelay {
        server_id: String,
        delay_ms: u64,
        attempt: u32,
    },
    Success {
        server_id: String,
        attempts: u32,
    },
    Failed {
        server_id: String,
        error: String,
        attempt: u32,
    },
    Abandoned {
        server_id: String,
        attempts: u32,
    },
}

impl ReconnectionEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::Started { server_id, .. }
            | Self::BackoffDelay { server_id, .. }
            | Self::Success { server_id, .. }
            | Self::Failed { server_id, .. }
            | Self::Abandoned { server_id, .. } => server_id,
        }
    }
}

/// Handle returned by [`EventEmitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Typed subject with isolated listeners and a broadcast stream.
pub struct EventEmitter<E: Clone> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + std::fmt::Debug> EventEmitter<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a listener. It runs on the emitting task and must not block.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() < before
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn emit(&self, event: E) {
        // Snapshot so listeners may call on/off without deadlocking
        let listeners: Vec<(ListenerId, Listener<E>)> = self.listeners.read().clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(listener = id.0, event = ?event, "Event listener panicked");
            }
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl<E: Clone + std::fmt::Debug> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn reconnected(id: &str) -> HealthEvent {
        HealthEvent::ServerReconnected {
            server_id: id.to_string(),
        }
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let emitter: EventEmitter<HealthEvent> = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.on(|_| panic!("bad subscriber"));
        let counter = Arc::clone(&calls);
        emitter.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(reconnected("fs"));
        emitter.emit(reconnected("fs"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_removes_listener() {
        let emitter: EventEmitter<HealthEvent> = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = emitter.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(emitter.listener_count(), 1);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));

        emitter.emit(reconnected("fs"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let emitter: EventEmitter<HealthEvent> = EventEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit(reconnected("search"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "server-reconnected");
        assert_eq!(event.server_id(), "search");
    }

    #[test]
    fn test_event_display() {
        let event = HealthEvent::ReconnectionFailed {
            server_id: "fs".to_string(),
            error: "connection refused".to_string(),
            attempt: 2,
        };
        assert_eq!(
            event.to_string(),
            "reconnection-failed [fs] attempt 2: connection refused"
        );

        let event = HealthEvent::ServerHealthy {
            server_id: "fs".to_string(),
            previous: HealthStatus::Unhealthy,
        };
        assert_eq!(event.to_string(), "server-healthy [fs] (was unhealthy)");
    }
}
