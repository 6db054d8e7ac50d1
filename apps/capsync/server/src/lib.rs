//! `capsync` keeps one boolean flag consistent across every connected
//! WebSocket client.
//!
//! Participants (`/ws`) read the flag and toggle it with `"1"`/`"0"` frames;
//! observers (`/status`) watch the flag and the participant count. Every real
//! change fans out to all connections, and a reconciliation task re-pushes the
//! value to anyone who missed it.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod hub;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod state;
pub mod telemetry;

pub use app::{AppState, TransportError};
pub use config::{Cli, ServerConfig};
pub use hub::{SyncConfig, SyncHub};
pub use reconcile::spawn_reconciler;
