use std::{sync::Arc, time::Duration};

use capsync_core::ToggleRequest;
use metrics::{counter, gauge};
use tracing::debug;

use crate::{
    broadcast::{BroadcastReport, Broadcaster},
    registry::ConnectionRegistry,
    state::SharedState,
};

const DEFAULT_SEND_BUFFER: usize = 64;
/// An observer's greeting is two frames queued back to back.
pub const MIN_SEND_BUFFER: usize = 2;

/// Timing and sizing knobs for the synchronisation engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the reconciler samples the flag.
    pub reconcile_interval: Duration,
    /// How often each observer receives a fresh participant count.
    pub observer_interval: Duration,
    /// Depth of each connection's outbound queue. A peer that falls this far
    /// behind is evicted.
    pub send_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(50),
            observer_interval: Duration::from_secs(5),
            send_buffer: DEFAULT_SEND_BUFFER,
        }
    }
}

/// Everything the sessions and the reconciler share.
pub struct SyncHub {
    state: SharedState,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    config: SyncConfig,
}

impl SyncHub {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        Arc::new(Self {
            state: SharedState::new(),
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            config,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Applies a participant's toggle. Fans out only when the flag actually
    /// moved; returns `None` for a no-op.
    pub fn toggle(&self, request: ToggleRequest) -> Option<BroadcastReport> {
        let Some(snapshot) = self.state.transition(request.enabled) else {
            counter!("capsync_toggles_suppressed_total", 1);
            debug!(enabled = request.enabled, "toggle matches current value");
            return None;
        };

        counter!("capsync_toggles_total", 1, "value" => request.as_str());
        gauge!("capsync_flag_enabled", f64::from(u8::from(snapshot.enabled)));
        Some(self.broadcaster.broadcast_state(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Connection;
    use capsync_core::{ConnectionId, StatusMessage};
    use tokio::sync::mpsc;

    #[test_timeout::timeout]
    fn toggle_broadcasts_only_on_change() {
        let hub = SyncHub::new(SyncConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        hub.registry()
            .register_participant(Connection::new(ConnectionId::new(), None, tx))
            .unwrap();

        let report = hub.toggle(ToggleRequest::new(true)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(true));

        assert!(hub.toggle(ToggleRequest::new(true)).is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.broadcaster().fanout_count(), 1);
    }

    #[test_timeout::timeout]
    fn default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_millis(50));
        assert_eq!(config.observer_interval, Duration::from_secs(5));
        assert_eq!(config.send_buffer, DEFAULT_SEND_BUFFER);
    }
}
