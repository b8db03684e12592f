//! # Real-Time Fan-out
//!
//! Listener-facing half of the broadcast: typed event frames, the in-memory
//! listener registry, and the seam the coordinator notifies through.
//!
//! Listener connections are ephemeral. Nothing here is persisted;
//! after a restart listeners simply reconnect and receive a fresh snapshot.

pub mod broadcaster;
pub mod event;

pub use broadcaster::{Broadcaster, PublishReport, Subscription};
pub use event::{EventKind, ListenerEvent};

use crate::session::PublicState;
use async_trait::async_trait;

/// Receiver of committed session transitions.
///
/// A failing sink never rolls back the transition that triggered it; the
/// session store stays the source of truth and listeners can re-query.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, kind: EventKind, state: &PublicState) -> anyhow::Result<()>;
}
