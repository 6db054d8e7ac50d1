//! Fan-out of status frames to registered connections.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::counter;
use tracing::{debug, warn};

use crate::{
    registry::{CloseNotice, Connection, ConnectionRegistry, Delivery, DeliveryError},
    state::FlagSnapshot,
};

/// Which registered connections a broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Participants,
    Observers,
    /// Participants and observers.
    Everyone,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Participants => "participants",
            Audience::Observers => "observers",
            Audience::Everyone => "everyone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    State(FlagSnapshot),
    /// Participant count.
    Count(usize),
}

/// What one fan-out did. Informational only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub evicted: usize,
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    state_fanouts: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            state_fanouts: AtomicU64::new(0),
        }
    }

    /// Offers `payload` to every connection in `audience`.
    ///
    /// Each connection is tried independently. One whose queue is closed or
    /// full is unregistered and told to shut down; the rest still get the
    /// frame. Nothing is retried: an evicted client reconnects and receives
    /// the current value on join.
    pub fn broadcast(&self, audience: Audience, payload: Payload) -> BroadcastReport {
        let recipients = match audience {
            Audience::Participants => self.registry.snapshot_participants(),
            Audience::Observers => self.registry.snapshot_observers(),
            Audience::Everyone => self.registry.snapshot_all(),
        };

        let mut report = BroadcastReport::default();
        for connection in &recipients {
            let outcome = match payload {
                Payload::State(snapshot) => connection.offer_state(snapshot),
                Payload::Count(count) => connection.offer_count(count),
            };
            match outcome {
                Ok(Delivery::Sent) => report.delivered += 1,
                Ok(Delivery::Skipped) => report.skipped += 1,
                Err(err) => {
                    self.evict(connection, err);
                    report.evicted += 1;
                }
            }
        }

        if matches!(payload, Payload::State(_)) {
            self.state_fanouts.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "capsync_broadcasts_total",
            1,
            "audience" => audience.as_str()
        );
        counter!(
            "capsync_messages_delivered_total",
            report.delivered as u64
        );
        debug!(
            audience = audience.as_str(),
            ?payload,
            recipients = recipients.len(),
            delivered = report.delivered,
            skipped = report.skipped,
            evicted = report.evicted,
            "broadcast"
        );

        report
    }

    pub fn broadcast_state(&self, snapshot: FlagSnapshot) -> BroadcastReport {
        self.broadcast(Audience::Everyone, Payload::State(snapshot))
    }

    /// Pushes the current participant count to observers.
    pub fn broadcast_count(&self) -> BroadcastReport {
        let count = self.registry.participant_count();
        self.broadcast(Audience::Observers, Payload::Count(count))
    }

    /// Number of flag fan-outs performed since startup.
    pub fn fanout_count(&self) -> u64 {
        self.state_fanouts.load(Ordering::Relaxed)
    }

    fn evict(&self, connection: &Connection, error: DeliveryError) {
        let role = self.registry.unregister(connection.id());
        connection.close(CloseNotice::EVICTED);
        if let Some(role) = role {
            counter!(
                "capsync_evictions_total",
                1,
                "reason" => error.metric_label()
            );
            warn!(
                connection_id = %connection.id(),
                remote_addr = ?connection.remote_addr(),
                role = role.as_str(),
                error = %error,
                "evicting connection after failed send"
            );
        }
    }
}
