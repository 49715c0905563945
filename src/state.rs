//! Shared tunnel connection state and lifecycle event history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Instant;

use tokio::sync::Mutex;

/// Tunnel connection event types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    Disconnected,
    PongTimeout,
    WriterFailed,
    ReconnectAttempt,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::PongTimeout => "pong_timeout",
            Self::WriterFailed => "writer_failed",
            Self::ReconnectAttempt => "reconnect_attempt",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Tunnel connection statistics — atomics for lock-free hot-path updates,
/// Mutex only for the event log (cold path).
pub struct TunnelStats {
    /// True exactly while a request pump is running on a live socket.
    pub connected: AtomicBool,
    /// Number of dial attempts that followed a failure or disconnect.
    pub reconnects: AtomicU64,
    /// Response frames written to the tunnel.
    pub messages_sent: AtomicU64,
    /// Request frames read from the tunnel.
    pub messages_received: AtomicU64,
    /// Epoch for computing relative timestamps in events.
    pub epoch: Instant,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            epoch: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
        }
    }

    /// Push a connection event, evicting the oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// Snapshot of the retained lifecycle events, oldest first.
    pub async fn recent_events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().await.iter().cloned().collect()
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
