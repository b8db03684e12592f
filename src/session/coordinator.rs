//! # Session Coordinator
//!
//! The authority over the single on-air slot. Every presenter command, every
//! dropped presenter connection and every emergency override goes through here.
//!
//! ## State Machine:
//! ```text
//!            start                pause
//!  OFFLINE ─────────▶ LIVE ◀──────────────▶ PAUSED
//!     ▲               │    resume/reconnect   │
//!     └───── stop ────┴────────── stop ───────┘
//!                 (connection drop: LIVE → PAUSED)
//! ```
//!
//! ## Ordering guarantees:
//! - Commands are serialised by one async mutex, so no two transitions are ever
//!   mid-flight at the same time
//! - Each transition is written to the `SessionStore` before listeners are told
//!   about it; a failed notification is logged and never rolls the write back
//! - Listener notification happens while the gate is still held, so listeners
//!   see transitions in the order they were committed

use super::model::{BroadcastSession, BroadcastStatus, OwnerToken, PublicState};
use super::store::SessionStore;
use crate::auth::{Identity, Role};
use crate::clock::Clock;
use crate::fanout::{Broadcaster, EventKind, EventSink, Subscription};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// A presenter command, already validated at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        title: Option<String>,
        presenter: Option<String>,
    },
    Pause,
    Resume,
    Stop,
    Reconnect,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::Reconnect => "reconnect",
        }
    }
}

/// Why a command was refused.
#[derive(Debug)]
pub enum CoordinatorError {
    /// Someone else holds the slot.
    OwnershipConflict { command: &'static str },
    /// The command does not apply in the current state.
    InvalidTransition {
        command: &'static str,
        status: BroadcastStatus,
    },
    /// Emergency stop attempted without the privileged role.
    NotPrivileged,
    /// The session store failed or the record changed underneath us.
    Store(anyhow::Error),
}

impl CoordinatorError {
    /// Stable wire code for presenters and API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::OwnershipConflict { command: "start" } => "ALREADY_LIVE",
            CoordinatorError::OwnershipConflict { .. } => "NOT_OWNER",
            CoordinatorError::InvalidTransition { .. } => "INVALID_STATE",
            CoordinatorError::NotPrivileged => "FORBIDDEN",
            CoordinatorError::Store(_) => "STORE_ERROR",
        }
    }
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::OwnershipConflict { command: "start" } => {
                write!(f, "A broadcast is already live under another presenter")
            }
            CoordinatorError::OwnershipConflict { command } => {
                write!(f, "Cannot {}: the broadcast belongs to another presenter", command)
            }
            CoordinatorError::InvalidTransition { command, status } => {
                write!(f, "Cannot {} while the broadcast is {}", command, status)
            }
            CoordinatorError::NotPrivileged => write!(f, "Emergency stop requires an admin identity"),
            CoordinatorError::Store(e) => write!(f, "Session store failure: {:#}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<anyhow::Error> for CoordinatorError {
    fn from(err: anyhow::Error) -> Self {
        CoordinatorError::Store(err)
    }
}

/// Tunables that come from configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorPolicy {
    /// Advertised to listeners while on air
    pub stream_url: String,
    /// After a connection drop, how long before another presenter may take
    /// over. `None` means never without an explicit stop.
    pub reclaim_grace: Option<Duration>,
}

/// What an emergency stop ended, for the operator's audit display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedBroadcast {
    pub terminated: bool,
    pub title: Option<String>,
    pub presenter: Option<String>,
    pub owner: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// State held under the command gate.
#[derive(Debug, Default)]
struct Gate {
    /// Presenter connection that last drove the session
    attached: Option<Uuid>,
}

pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    broadcaster: Broadcaster,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    policy: CoordinatorPolicy,
    gate: Mutex<Gate>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        broadcaster: Broadcaster,
        clock: Arc<dyn Clock>,
        policy: CoordinatorPolicy,
    ) -> Self {
        Self {
            store,
            sink: Arc::new(broadcaster.clone()),
            broadcaster,
            clock,
            policy,
            gate: Mutex::new(Gate::default()),
        }
    }

    /// Route notifications somewhere other than the local broadcaster.
    #[cfg(test)]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn stream_url(&self) -> &str {
        &self.policy.stream_url
    }

    /// Current record, created as OFFLINE on first read.
    pub async fn current(&self) -> Result<BroadcastSession, CoordinatorError> {
        Ok(self
            .store
            .create_if_absent(BroadcastSession::offline(self.clock.now()))
            .await?)
    }

    pub async fn public_state(&self) -> Result<PublicState, CoordinatorError> {
        let session = self.current().await?;
        Ok(PublicState::from_session(&session, &self.policy.stream_url))
    }

    /// Subscribe a listener with a snapshot that cannot race a transition.
    pub async fn subscribe(&self) -> Result<Subscription, CoordinatorError> {
        let _gate = self.gate.lock().await;
        let state = self.public_state().await?;
        Ok(self.broadcaster.subscribe(state))
    }

    /// Bring the record in line with a process that has no presenter
    /// connections yet: a session found LIVE is paused as if its connection
    /// had dropped, so the owner can reconnect.
    pub async fn rehydrate(&self) -> Result<BroadcastSession, CoordinatorError> {
        let _gate = self.gate.lock().await;
        let session = self.current().await?;
        if session.status != BroadcastStatus::Live {
            info!(status = %session.status, "session rehydrated");
            return Ok(session);
        }

        let now = self.clock.now();
        let mut next = session.clone();
        next.status = BroadcastStatus::Paused;
        next.paused_at = Some(now);
        next.disconnected_at = Some(now);
        warn!("session was live at startup; paused until its owner reconnects");
        self.commit(&session, next, EventKind::BroadcastMute).await
    }

    /// Run one presenter command.
    ///
    /// `connection` identifies the presenter socket issuing it; the most recent
    /// one is remembered so a stale socket closing later does not pause a
    /// broadcast that has moved to a newer connection.
    pub async fn execute(
        &self,
        identity: &Identity,
        connection: Option<Uuid>,
        command: Command,
    ) -> Result<BroadcastSession, CoordinatorError> {
        let mut gate = self.gate.lock().await;
        let session = self.current().await?;
        let now = self.clock.now();
        let command_name = command.name();

        let outcome = apply(&session, identity, command, now, &self.policy);
        let (next, event) = match outcome {
            Ok(step) => step,
            Err(e) => {
                warn!(
                    identity = %identity.id,
                    command = command_name,
                    status = %session.status,
                    code = e.code(),
                    "command rejected"
                );
                return Err(e);
            }
        };

        let committed = match event {
            Some(kind) => self.commit(&session, next, kind).await?,
            None => session,
        };

        gate.attached = match committed.status {
            BroadcastStatus::Offline => None,
            _ => connection.or(gate.attached),
        };

        info!(
            identity = %identity.id,
            command = command_name,
            status = %committed.status,
            "command applied"
        );
        Ok(committed)
    }

    /// The presenter's transport closed without an explicit stop.
    ///
    /// A LIVE session owned by `identity` drops to PAUSED with ownership and
    /// `started_at` intact. Nothing else changes; in particular the slot is
    /// never released here. Returns the new record if a transition happened.
    pub async fn handle_disconnect(
        &self,
        identity: &str,
        connection: Uuid,
    ) -> Result<Option<BroadcastSession>, CoordinatorError> {
        let mut gate = self.gate.lock().await;
        if gate.attached.is_some_and(|c| c != connection) {
            info!(identity, %connection, "stale presenter connection closed; ignoring");
            return Ok(None);
        }
        gate.attached = None;

        let session = self.current().await?;
        if !session.is_owned_by(identity) {
            return Ok(None);
        }

        let now = self.clock.now();
        match session.status {
            BroadcastStatus::Live => {
                let mut next = session.clone();
                next.status = BroadcastStatus::Paused;
                next.paused_at = Some(now);
                next.disconnected_at = Some(now);
                warn!(identity, "presenter connection dropped; broadcast paused");
                let committed = self.commit(&session, next, EventKind::BroadcastMute).await?;
                Ok(Some(committed))
            }
            BroadcastStatus::Paused if session.disconnected_at.is_none() => {
                // Already muted by hand; start the reclaim clock silently.
                let mut next = session.clone();
                next.disconnected_at = Some(now);
                next.updated_at = now;
                let committed = self.write(&session, next).await?;
                Ok(Some(committed))
            }
            _ => Ok(None),
        }
    }

    /// Moderation override: end whatever is on air, regardless of owner.
    pub async fn force_stop(&self, identity: &Identity) -> Result<TerminatedBroadcast, CoordinatorError> {
        if !identity.is(Role::Admin) {
            return Err(CoordinatorError::NotPrivileged);
        }

        let mut gate = self.gate.lock().await;
        let session = self.current().await?;
        let report = TerminatedBroadcast {
            terminated: session.status != BroadcastStatus::Offline,
            title: session.title.clone(),
            presenter: session.presenter_name.clone(),
            owner: session.owner.as_ref().map(|o| o.identity.clone()),
            started_at: session.started_at,
        };
        if !report.terminated {
            return Ok(report);
        }

        let mut next = session.clone();
        next.reset(self.clock.now());
        self.commit(&session, next, EventKind::BroadcastStop).await?;
        gate.attached = None;

        warn!(
            operator = %identity.id,
            owner = report.owner.as_deref().unwrap_or("-"),
            title = report.title.as_deref().unwrap_or("-"),
            "broadcast force-stopped"
        );
        Ok(report)
    }

    /// Persist `next`, then tell listeners.
    async fn commit(
        &self,
        current: &BroadcastSession,
        next: BroadcastSession,
        event: EventKind,
    ) -> Result<BroadcastSession, CoordinatorError> {
        let committed = self.write(current, next).await?;

        let state = PublicState::from_session(&committed, &self.policy.stream_url);
        if let Err(e) = self.sink.notify(event, &state).await {
            warn!(?event, "listener notification failed, state already committed: {:#}", e);
        }
        Ok(committed)
    }

    async fn write(
        &self,
        current: &BroadcastSession,
        next: BroadcastSession,
    ) -> Result<BroadcastSession, CoordinatorError> {
        next.check_invariants()
            .map_err(|e| CoordinatorError::Store(anyhow::anyhow!("refusing to write: {}", e)))?;
        self.store
            .compare_and_swap(current.version, next)
            .await?
            .ok_or_else(|| {
                CoordinatorError::Store(anyhow::anyhow!("session record changed concurrently"))
            })
    }
}

/// The transition function. Pure: given a record, a requester and a command,
/// produce the next record and the listener event, or a refusal. `None` for
/// the event means the command was a no-op.
fn apply(
    session: &BroadcastSession,
    identity: &Identity,
    command: Command,
    now: DateTime<Utc>,
    policy: &CoordinatorPolicy,
) -> Result<(BroadcastSession, Option<EventKind>), CoordinatorError> {
    let name = command.name();
    let mut next = session.clone();
    next.updated_at = now;

    if let Command::Start { title, presenter } = command {
        let fresh = session.status == BroadcastStatus::Offline || reclaimable(session, now, policy);
        if fresh {
            if session.status != BroadcastStatus::Offline {
                warn!(
                    previous = session.owner.as_ref().map(|o| o.identity.as_str()).unwrap_or("-"),
                    new = %identity.id,
                    "reclaiming session abandoned past its grace period"
                );
            }
            next.status = BroadcastStatus::Live;
            next.owner = Some(OwnerToken {
                identity: identity.id.clone(),
                issued_at: identity.issued_at,
            });
            next.title = title;
            next.presenter_name = presenter.or_else(|| identity.display_name.clone());
            next.started_at = Some(now);
            next.paused_at = None;
            next.disconnected_at = None;
            return Ok((next, Some(EventKind::BroadcastStart)));
        }

        if !session.is_owned_by(&identity.id) {
            return Err(CoordinatorError::OwnershipConflict { command: name });
        }

        // Same owner starting again: refresh metadata, keep the clock running.
        next.status = BroadcastStatus::Live;
        if title.is_some() {
            next.title = title;
        }
        if presenter.is_some() {
            next.presenter_name = presenter;
        }
        next.paused_at = None;
        next.disconnected_at = None;
        return Ok((next, Some(EventKind::BroadcastStart)));
    }

    if session.status == BroadcastStatus::Offline {
        return Err(CoordinatorError::InvalidTransition {
            command: name,
            status: session.status,
        });
    }
    if !session.is_owned_by(&identity.id) {
        return Err(CoordinatorError::OwnershipConflict { command: name });
    }

    match (command, session.status) {
        (Command::Pause, BroadcastStatus::Live) => {
            next.status = BroadcastStatus::Paused;
            next.paused_at = Some(now);
            Ok((next, Some(EventKind::BroadcastMute)))
        }
        (Command::Resume | Command::Reconnect, BroadcastStatus::Paused) => {
            next.status = BroadcastStatus::Live;
            next.paused_at = None;
            next.disconnected_at = None;
            Ok((next, Some(EventKind::BroadcastUnmute)))
        }
        (Command::Reconnect, BroadcastStatus::Live) => Ok((session.clone(), None)),
        (Command::Stop, _) => {
            next.reset(now);
            Ok((next, Some(EventKind::BroadcastStop)))
        }
        (_, status) => Err(CoordinatorError::InvalidTransition { command: name, status }),
    }
}

fn reclaimable(session: &BroadcastSession, now: DateTime<Utc>, policy: &CoordinatorPolicy) -> bool {
    match (session.status, session.disconnected_at, policy.reclaim_grace) {
        (BroadcastStatus::Paused, Some(dropped), Some(grace)) => {
            grace >= Duration::zero() && now - dropped >= grace
        }
        _ => false,
    }
}
