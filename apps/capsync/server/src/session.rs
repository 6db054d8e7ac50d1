//! Per-connection handlers for the participant (`/ws`) and observer
//! (`/status`) channels.
//!
//! Each accepted socket gets one session task (reads frames, applies toggles)
//! and one writer task (drains the connection's outbound queue into the
//! socket). Both halves are generic over `Stream`/`Sink` so the handlers run
//! against axum's split `WebSocket` in production and plain channels in tests.

use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use capsync_core::{ConnectionId, ProtocolError, Role, StatusMessage, ToggleRequest};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    hub::SyncHub,
    registry::{CloseNotice, Connection, DeliveryError, RegistryError},
};

/// How long a closing session waits for its writer to flush the close frame.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(1);
const MAX_LOGGED_PAYLOAD_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Open,
    Closed,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    StreamEnded,
    ReadError,
    WriterFinished,
    Evicted,
    DeliveryFailed,
    Duplicate,
    Dropped,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::StreamEnded => "stream_ended",
            CloseReason::ReadError => "read_error",
            CloseReason::WriterFinished => "writer_finished",
            CloseReason::Evicted => "evicted",
            CloseReason::DeliveryFailed => "delivery_failed",
            CloseReason::Duplicate => "duplicate",
            CloseReason::Dropped => "dropped",
        }
    }

    fn notice(self) -> CloseNotice {
        match self {
            CloseReason::Evicted | CloseReason::DeliveryFailed => CloseNotice::EVICTED,
            CloseReason::Duplicate => CloseNotice::DUPLICATE,
            _ => CloseNotice::NORMAL,
        }
    }
}

/// `Connecting → Open → Closed` for one connection.
///
/// `close` is the only teardown path. It runs at most once, whichever exit
/// fires first, and also runs from `Drop` so an aborted session task still
/// leaves the registry.
pub struct Lifecycle {
    hub: Arc<SyncHub>,
    connection: Connection,
    role: Role,
    phase: SessionPhase,
    opened_at: Option<Instant>,
}

impl Lifecycle {
    pub fn new(hub: Arc<SyncHub>, connection: Connection, role: Role) -> Self {
        Self {
            hub,
            connection,
            role,
            phase: SessionPhase::Connecting,
            opened_at: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn open(&mut self) -> Result<(), RegistryError> {
        if self.phase != SessionPhase::Connecting {
            return Ok(());
        }
        let role_count = self
            .hub
            .registry()
            .register(self.role, self.connection.clone())?;
        self.phase = SessionPhase::Open;
        self.opened_at = Some(Instant::now());

        counter!(
            "capsync_connections_total",
            1,
            "role" => self.role.as_str()
        );
        self.record_active();
        info!(
            connection_id = %self.connection.id(),
            remote_addr = ?self.connection.remote_addr(),
            role = self.role.as_str(),
            role_count,
            total = self.hub.registry().total_count(),
            "connection opened"
        );

        if self.role == Role::Participant {
            self.hub.broadcaster().broadcast_count();
        }
        Ok(())
    }

    pub fn close(&mut self, reason: CloseReason) {
        let was_open = match self.phase {
            SessionPhase::Closed => return,
            SessionPhase::Open => true,
            SessionPhase::Connecting => false,
        };
        self.phase = SessionPhase::Closed;
        self.connection.close(reason.notice());

        // Never registered: the id may belong to someone else's entry.
        if !was_open {
            return;
        }

        self.hub.registry().unregister(self.connection.id());
        if self.role == Role::Participant {
            self.hub.broadcaster().broadcast_count();
        }

        counter!(
            "capsync_connections_closed_total",
            1,
            "role" => self.role.as_str()
        );
        self.record_active();
        if let Some(opened_at) = self.opened_at {
            histogram!(
                "capsync_connection_duration_seconds",
                opened_at.elapsed().as_secs_f64(),
                "role" => self.role.as_str()
            );
        }
        info!(
            connection_id = %self.connection.id(),
            remote_addr = ?self.connection.remote_addr(),
            role = self.role.as_str(),
            reason = reason.as_str(),
            remaining = self.hub.registry().total_count(),
            "connection closed"
        );
    }

    fn record_active(&self) {
        gauge!(
            "capsync_connections_active",
            self.hub.registry().count(self.role) as f64,
            "role" => self.role.as_str()
        );
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

/// Drives one participant socket until it closes.
pub async fn run_participant<S, E, K>(
    hub: Arc<SyncHub>,
    stream: S,
    sink: K,
    remote_addr: Option<SocketAddr>,
) where
    S: Stream<Item = Result<Message, E>> + Send,
    E: Display + Send,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let Some((mut lifecycle, mut writer)) =
        start(&hub, Role::Participant, sink, remote_addr).await
    else {
        return;
    };
    let connection = lifecycle.connection().clone();

    let shutdown = connection.shutdown_token();
    tokio::pin!(stream);
    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break CloseReason::Evicted,
            _ = &mut writer => break CloseReason::WriterFinished,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => apply_toggle(&hub, &connection, &text),
                Some(Ok(Message::Binary(bytes))) => {
                    reject_input(&connection, &ProtocolError::NotText, &format!("<{} bytes>", bytes.len()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        connection_id = %connection.id(),
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break CloseReason::ClientClosed;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(connection_id = %connection.id(), error = %err, "error receiving message");
                    break CloseReason::ReadError;
                }
                None => break CloseReason::StreamEnded,
            },
        }
    };

    finish(&mut lifecycle, writer, reason).await;
}

/// Drives one observer socket until it closes. Inbound frames other than
/// close are ignored.
pub async fn run_observer<S, E, K>(
    hub: Arc<SyncHub>,
    stream: S,
    sink: K,
    remote_addr: Option<SocketAddr>,
) where
    S: Stream<Item = Result<Message, E>> + Send,
    E: Display + Send,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let Some((mut lifecycle, mut writer)) = start(&hub, Role::Observer, sink, remote_addr).await
    else {
        return;
    };
    let connection = lifecycle.connection().clone();

    let period = hub.config().observer_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = connection.shutdown_token();
    tokio::pin!(stream);
    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break CloseReason::Evicted,
            _ = &mut writer => break CloseReason::WriterFinished,
            _ = ticker.tick() => {
                let participants = hub.registry().participant_count();
                if let Err(err) = connection.offer_count(participants) {
                    warn!(connection_id = %connection.id(), error = %err, "failed to send count");
                    break CloseReason::DeliveryFailed;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                Some(Ok(_)) => {
                    debug!(connection_id = %connection.id(), "ignoring inbound frame on status channel");
                }
                Some(Err(err)) => {
                    warn!(connection_id = %connection.id(), error = %err, "error receiving message");
                    break CloseReason::ReadError;
                }
                None => break CloseReason::StreamEnded,
            },
        }
    };

    finish(&mut lifecycle, writer, reason).await;
}

/// Spawns the writer, queues the greeting, then registers. A duplicate id is
/// refused: the writer sends a close frame and the session never opens.
async fn start<K>(
    hub: &Arc<SyncHub>,
    role: Role,
    sink: K,
    remote_addr: Option<SocketAddr>,
) -> Option<(Lifecycle, JoinHandle<()>)>
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let (tx, rx) = mpsc::channel(hub.config().send_buffer);
    let connection = Connection::new(ConnectionId::new(), remote_addr, tx);
    let writer = tokio::spawn(write_loop(sink, rx, connection.clone()));

    let mut lifecycle = Lifecycle::new(Arc::clone(hub), connection.clone(), role);
    if let Err(err) = queue_greeting(hub, role, &connection) {
        warn!(connection_id = %connection.id(), error = %err, "failed to queue greeting");
        finish(&mut lifecycle, writer, CloseReason::DeliveryFailed).await;
        return None;
    }
    if let Err(err) = lifecycle.open() {
        counter!("capsync_duplicate_registrations_total", 1);
        error!(
            connection_id = %lifecycle.connection().id(),
            role = role.as_str(),
            error = %err,
            "refusing connection"
        );
        lifecycle.close(CloseReason::Duplicate);
        return None;
    }
    if let Err(err) = catch_up(hub, &connection) {
        warn!(connection_id = %connection.id(), error = %err, "failed to send current state");
        finish(&mut lifecycle, writer, CloseReason::DeliveryFailed).await;
        return None;
    }
    Some((lifecycle, writer))
}

async fn finish(lifecycle: &mut Lifecycle, mut writer: JoinHandle<()>, reason: CloseReason) {
    lifecycle.close(reason);
    if reason == CloseReason::WriterFinished {
        return;
    }
    if tokio::time::timeout(WRITER_CLOSE_GRACE, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

async fn write_loop<K>(mut sink: K, mut outbound: mpsc::Receiver<StatusMessage>, connection: Connection)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let shutdown = connection.shutdown_token();
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => return,
            },
        };
        if let Err(err) = sink.send(Message::Text(message.to_string())).await {
            debug!(connection_id = %connection.id(), error = %err, "socket write failed");
            return;
        }
    }

    let frame = connection.close_notice().frame();
    if let Err(err) = sink.send(Message::Close(Some(frame))).await {
        debug!(connection_id = %connection.id(), error = %err, "close frame not delivered");
    }
}

/// Opening frames, queued while the connection is still unregistered so no
/// fan-out can overtake them: the flag for participants, count then flag for
/// observers.
fn queue_greeting(hub: &SyncHub, role: Role, connection: &Connection) -> Result<(), DeliveryError> {
    if role == Role::Observer {
        connection.offer_count(hub.registry().participant_count())?;
    }
    connection.offer_state(hub.state().snapshot())?;
    Ok(())
}

/// A toggle that committed before registration never reached this
/// connection. Re-offer the current value; the version check in
/// `offer_state` skips it when a fan-out already delivered it.
fn catch_up(hub: &SyncHub, connection: &Connection) -> Result<(), DeliveryError> {
    connection.offer_state(hub.state().snapshot())?;
    Ok(())
}

fn apply_toggle(hub: &SyncHub, connection: &Connection, payload: &str) {
    match ToggleRequest::parse(payload) {
        Ok(request) => {
            if let Some(report) = hub.toggle(request) {
                info!(
                    connection_id = %connection.id(),
                    enabled = request.enabled,
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "flag toggled"
                );
            }
        }
        Err(err) => reject_input(connection, &err, payload),
    }
}

fn reject_input(connection: &Connection, error: &ProtocolError, payload: &str) {
    counter!(
        "capsync_invalid_input_total",
        1,
        "reason" => error.metric_label()
    );
    info!(
        connection_id = %connection.id(),
        remote_addr = ?connection.remote_addr(),
        error = %error,
        payload = %truncate_chars(payload, MAX_LOGGED_PAYLOAD_CHARS),
        "ignoring invalid input"
    );
}

fn truncate_chars(payload: &str, max: usize) -> &str {
    match payload.char_indices().nth(max) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}
