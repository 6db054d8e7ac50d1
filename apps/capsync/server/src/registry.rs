use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use axum::extract::ws::{close_code, CloseFrame};
use capsync_core::{ConnectionId, Role, StatusMessage};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::state::FlagSnapshot;

/// Handle to one live socket, shared between its session, its writer task and
/// the registry. Cloning is cheap.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    sender: mpsc::Sender<StatusMessage>,
    /// Version of the last flag value queued for this socket. Held across the
    /// enqueue so two racing fan-outs cannot reorder versions in the queue.
    queued_version: Mutex<Option<u64>>,
    shutdown: CancellationToken,
    close_notice: OnceLock<CloseNotice>,
}

/// Outcome of offering a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection already has this flag version (or a newer one) queued.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

impl DeliveryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Closed => "closed",
            DeliveryError::Full => "full",
        }
    }
}

/// Close frame the writer sends once the connection's shutdown fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseNotice {
    pub const NORMAL: CloseNotice = CloseNotice {
        code: close_code::NORMAL,
        reason: "closing",
    };
    pub const EVICTED: CloseNotice = CloseNotice {
        code: close_code::POLICY,
        reason: "evicted",
    };
    pub const DUPLICATE: CloseNotice = CloseNotice {
        code: close_code::ERROR,
        reason: "duplicate connection",
    };

    pub fn frame(self) -> CloseFrame<'static> {
        CloseFrame {
            code: self.code,
            reason: Cow::Borrowed(self.reason),
        }
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        sender: mpsc::Sender<StatusMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                remote_addr,
                sender,
                queued_version: Mutex::new(None),
                shutdown: CancellationToken::new(),
                close_notice: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Queues the flag value unless this connection already holds `snapshot`'s
    /// version or a later one.
    pub fn offer_state(&self, snapshot: FlagSnapshot) -> Result<Delivery, DeliveryError> {
        let mut queued = self.inner.queued_version.lock();
        if matches!(*queued, Some(version) if version >= snapshot.version) {
            return Ok(Delivery::Skipped);
        }
        self.enqueue(StatusMessage::State(snapshot.enabled))?;
        *queued = Some(snapshot.version);
        Ok(Delivery::Sent)
    }

    pub fn offer_count(&self, participants: usize) -> Result<Delivery, DeliveryError> {
        self.enqueue(StatusMessage::Count(participants))
            .map(|()| Delivery::Sent)
    }

    fn enqueue(&self, message: StatusMessage) -> Result<(), DeliveryError> {
        self.inner.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Fires the shutdown signal. The first notice wins; later calls only
    /// re-fire the (already cancelled) token.
    pub fn close(&self, notice: CloseNotice) {
        let _ = self.inner.close_notice.set(notice);
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn close_notice(&self) -> CloseNotice {
        self.inner
            .close_notice
            .get()
            .copied()
            .unwrap_or(CloseNotice::NORMAL)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {id} is already registered as {existing}")]
    DuplicateConnection { id: ConnectionId, existing: Role },
}

/// Live connections split by role.
///
/// The lock is only held to insert, remove or copy; fan-out iterates a
/// snapshot so a slow socket never holds up joins and leaves.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    participants: RoleTable,
    observers: RoleTable,
}

#[derive(Default)]
struct RoleTable {
    slab: Slab<Connection>,
    index_map: HashMap<ConnectionId, usize>,
}

impl RoleTable {
    fn insert(&mut self, connection: Connection) -> usize {
        let id = connection.id();
        let key = self.slab.insert(connection);
        self.index_map.insert(id, key);
        self.slab.len()
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        match self.index_map.remove(&id) {
            Some(key) => {
                self.slab.remove(key);
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.index_map.contains_key(&id)
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.slab.iter().map(|(_, conn)| conn.clone()).collect()
    }

    fn len(&self) -> usize {
        self.slab.len()
    }
}

impl RegistryInner {
    fn table(&self, role: Role) -> &RoleTable {
        match role {
            Role::Participant => &self.participants,
            Role::Observer => &self.observers,
        }
    }

    fn table_mut(&mut self, role: Role) -> &mut RoleTable {
        match role {
            Role::Participant => &mut self.participants,
            Role::Observer => &mut self.observers,
        }
    }

    fn role_of(&self, id: ConnectionId) -> Option<Role> {
        if self.participants.contains(id) {
            Some(Role::Participant)
        } else if self.observers.contains(id) {
            Some(Role::Observer)
        } else {
            None
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the participant count after insertion.
    pub fn register_participant(&self, connection: Connection) -> Result<usize, RegistryError> {
        self.register(Role::Participant, connection)
    }

    /// Returns the observer count after insertion.
    pub fn register_observer(&self, connection: Connection) -> Result<usize, RegistryError> {
        self.register(Role::Observer, connection)
    }

    pub fn register(&self, role: Role, connection: Connection) -> Result<usize, RegistryError> {
        let mut guard = self.inner.write();
        let id = connection.id();
        if let Some(existing) = guard.role_of(id) {
            return Err(RegistryError::DuplicateConnection { id, existing });
        }
        Ok(guard.table_mut(role).insert(connection))
    }

    /// Removes `id` from whichever role holds it. Absent ids are ignored so an
    /// eviction racing the session's own teardown is harmless.
    pub fn unregister(&self, id: ConnectionId) -> Option<Role> {
        let mut guard = self.inner.write();
        let role = guard.role_of(id)?;
        guard.table_mut(role).remove(id);
        Some(role)
    }

    pub fn snapshot_participants(&self) -> Vec<Connection> {
        self.inner.read().participants.snapshot()
    }

    pub fn snapshot_observers(&self) -> Vec<Connection> {
        self.inner.read().observers.snapshot()
    }

    /// Participants followed by observers, copied under one read lock.
    pub fn snapshot_all(&self) -> Vec<Connection> {
        let guard = self.inner.read();
        let mut all = guard.participants.snapshot();
        all.extend(guard.observers.snapshot());
        all
    }

    pub fn participant_count(&self) -> usize {
        self.inner.read().participants.len()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.read().observers.len()
    }

    pub fn total_count(&self) -> usize {
        let guard = self.inner.read();
        guard.participants.len() + guard.observers.len()
    }

    pub fn count(&self, role: Role) -> usize {
        self.inner.read().table(role).len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.role_of(id).is_some()
    }

    pub fn role_of(&self, id: ConnectionId) -> Option<Role> {
        self.inner.read().role_of(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::Receiver<StatusMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Connection::new(ConnectionId::new(), None, tx), rx)
    }

    fn snapshot(enabled: bool, version: u64) -> FlagSnapshot {
        FlagSnapshot { enabled, version }
    }

    #[test_timeout::timeout]
    fn registers_into_separate_roles() {
        let registry = ConnectionRegistry::new();
        let (p1, _rx1) = connection();
        let (p2, _rx2) = connection();
        let (o1, _rx3) = connection();

        assert_eq!(registry.register_participant(p1.clone()).unwrap(), 1);
        assert_eq!(registry.register_participant(p2).unwrap(), 2);
        assert_eq!(registry.register_observer(o1.clone()).unwrap(), 1);

        assert_eq!(registry.participant_count(), 2);
        assert_eq!(registry.observer_count(), 1);
        assert_eq!(registry.total_count(), 3);
        assert_eq!(registry.role_of(p1.id()), Some(Role::Participant));
        assert_eq!(registry.role_of(o1.id()), Some(Role::Observer));
    }

    #[test_timeout::timeout]
    fn duplicate_id_is_rejected_across_roles() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection();
        registry.register_participant(conn.clone()).unwrap();

        let err = registry.register_observer(conn.clone()).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateConnection {
                existing: Role::Participant,
                ..
            }
        ));
        let err = registry.register_participant(conn.clone()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateConnection { .. }));

        // Never in both mappings, never overwritten.
        assert_eq!(registry.participant_count(), 1);
        assert_eq!(registry.observer_count(), 0);
    }

    #[test_timeout::timeout]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (keep, _rx1) = connection();
        let (drop_me, _rx2) = connection();
        registry.register_participant(keep.clone()).unwrap();
        registry.register_observer(drop_me.clone()).unwrap();

        assert_eq!(registry.unregister(drop_me.id()), Some(Role::Observer));
        assert_eq!(registry.unregister(drop_me.id()), None);
        assert_eq!(registry.unregister(ConnectionId::new()), None);

        assert!(registry.contains(keep.id()));
        assert_eq!(registry.total_count(), 1);
    }

    #[test_timeout::timeout]
    fn snapshot_is_detached_from_live_mapping() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = connection();
        let (b, _rx2) = connection();
        registry.register_participant(a.clone()).unwrap();
        registry.register_participant(b.clone()).unwrap();

        let snapshot = registry.snapshot_participants();
        registry.unregister(a.id());
        let (c, _rx3) = connection();
        registry.register_participant(c).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|conn| conn.id() == a.id()));
        assert_eq!(registry.participant_count(), 2);
    }

    #[test_timeout::timeout]
    fn slab_slots_are_reused_without_confusing_ids() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = connection();
        let (b, _rx2) = connection();
        registry.register_participant(a.clone()).unwrap();
        registry.unregister(a.id());
        registry.register_participant(b.clone()).unwrap();

        // `a` must not remove `b` even though `b` took over its slot.
        assert_eq!(registry.unregister(a.id()), None);
        assert!(registry.contains(b.id()));
    }

    #[test_timeout::timeout]
    fn snapshot_all_lists_participants_first() {
        let registry = ConnectionRegistry::new();
        let (o, _rx1) = connection();
        let (p, _rx2) = connection();
        registry.register_observer(o.clone()).unwrap();
        registry.register_participant(p.clone()).unwrap();

        let ids: Vec<_> = registry.snapshot_all().iter().map(Connection::id).collect();
        assert_eq!(ids, vec![p.id(), o.id()]);
    }

    #[test_timeout::timeout]
    fn stale_versions_are_skipped() {
        let (conn, mut rx) = connection();
        assert_eq!(conn.offer_state(snapshot(true, 2)).unwrap(), Delivery::Sent);
        assert_eq!(
            conn.offer_state(snapshot(false, 1)).unwrap(),
            Delivery::Skipped
        );
        assert_eq!(
            conn.offer_state(snapshot(true, 2)).unwrap(),
            Delivery::Skipped
        );
        assert_eq!(conn.offer_count(4).unwrap(), Delivery::Sent);

        assert_eq!(rx.try_recv().unwrap(), StatusMessage::State(true));
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::Count(4));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn offer_reports_full_and_closed_queues() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), None, tx);
        conn.offer_count(1).unwrap();
        assert_eq!(conn.offer_count(2), Err(DeliveryError::Full));
        assert_eq!(
            conn.offer_state(snapshot(true, 1)),
            Err(DeliveryError::Full)
        );

        // A failed enqueue does not advance the queued version.
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::Count(1));
        assert_eq!(conn.offer_state(snapshot(true, 1)).unwrap(), Delivery::Sent);

        drop(rx);
        assert_eq!(
            conn.offer_state(snapshot(false, 2)),
            Err(DeliveryError::Closed)
        );
    }

    #[test_timeout::timeout]
    fn first_close_notice_wins() {
        let (conn, _rx) = connection();
        assert!(!conn.is_closed());
        conn.close(CloseNotice::EVICTED);
        conn.close(CloseNotice::NORMAL);
        assert!(conn.is_closed());
        assert_eq!(conn.close_notice(), CloseNotice::EVICTED);
    }
}
