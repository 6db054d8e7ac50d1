use std::sync::Arc;

use metrics::counter;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{broadcast::BroadcastReport, hub::SyncHub};

/// Periodic re-sync of the flag.
///
/// Remembers the last value it pushed and fans out again whenever the flag no
/// longer matches, so a client that registered between a toggle's commit and
/// its fan-out still converges within one period. Connections that already
/// hold the current version skip the frame.
pub struct Reconciler {
    hub: Arc<SyncHub>,
    last_broadcast: Option<bool>,
}

impl Reconciler {
    pub fn new(hub: Arc<SyncHub>) -> Self {
        Self {
            hub,
            last_broadcast: None,
        }
    }

    pub fn last_broadcast(&self) -> Option<bool> {
        self.last_broadcast
    }

    /// One sampling step. Returns the fan-out report when it re-broadcast.
    pub fn tick(&mut self) -> Option<BroadcastReport> {
        let snapshot = self.hub.state().snapshot();
        if self.last_broadcast == Some(snapshot.enabled) {
            return None;
        }
        self.last_broadcast = Some(snapshot.enabled);

        let report = self.hub.broadcaster().broadcast_state(snapshot);
        counter!("capsync_reconcile_resyncs_total", 1);
        debug!(
            enabled = snapshot.enabled,
            version = snapshot.version,
            delivered = report.delivered,
            skipped = report.skipped,
            "reconciled flag"
        );
        Some(report)
    }
}

/// Runs a [`Reconciler`] every `reconcile_interval` until the handle is
/// aborted.
pub fn spawn_reconciler(hub: Arc<SyncHub>) -> JoinHandle<()> {
    let period = hub.config().reconcile_interval;
    let mut reconciler = Reconciler::new(hub);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?period, "starting reconciler");
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            reconciler.tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hub::SyncConfig, registry::Connection};
    use capsync_core::{ConnectionId, StatusMessage};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn participant(hub: &SyncHub) -> mpsc::Receiver<StatusMessage> {
        let (tx, rx) = mpsc::channel(8);
        hub.registry()
            .register_participant(Connection::new(ConnectionId::new(), None, tx))
            .unwrap();
        rx
    }

    #[test_timeout::timeout]
    fn first_tick_pushes_current_value() {
        let hub = SyncHub::new(SyncConfig::default());
        let mut rx = participant(&hub);
        let mut reconciler = Reconciler::new(Arc::clone(&hub));

        let report = reconciler.tick().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(false));
        assert_eq!(reconciler.last_broadcast(), Some(false));

        assert!(reconciler.tick().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn unbroadcast_write_is_picked_up() {
        let hub = SyncHub::new(SyncConfig::default());
        let mut reconciler = Reconciler::new(Arc::clone(&hub));
        reconciler.tick();

        let mut rx = participant(&hub);
        // Write without fan-out, as if the toggle's broadcast never reached
        // this client.
        assert!(hub.state().set_if_different(true));

        let report = reconciler.tick().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(true));
    }

    #[test_timeout::timeout]
    fn clients_already_current_are_skipped() {
        let hub = SyncHub::new(SyncConfig::default());
        let mut rx = participant(&hub);
        let mut reconciler = Reconciler::new(Arc::clone(&hub));
        reconciler.tick();
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(false));

        hub.toggle(capsync_core::ToggleRequest::new(true));
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(true));

        let report = reconciler.tick().unwrap();
        assert_eq!(report.skipped, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn spawned_loop_converges_within_a_period() {
        let hub = SyncHub::new(SyncConfig {
            reconcile_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        });
        let mut rx = participant(&hub);
        let handle = spawn_reconciler(Arc::clone(&hub));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(StatusMessage::State(false)));

        hub.state().set_if_different(true);
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(next, Some(StatusMessage::State(true)));

        handle.abort();
    }
}
