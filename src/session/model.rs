//! # Broadcast Session Record
//!
//! The single durable record describing the station's on-air slot.
//!
//! ## Lifecycle:
//! 1. **Offline**: nobody holds the slot, no owner, no metadata
//! 2. **Live**: the owner is on air; `started_at` marks the beginning of the broadcast
//! 3. **Paused**: muted, either explicitly or because the presenter's connection dropped;
//!    `started_at` is preserved so elapsed time keeps counting from the original start
//!
//! The record is never deleted. Stopping resets it to the offline defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current status of the on-air slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    Offline,
    Live,
    Paused,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Offline => "offline",
            BroadcastStatus::Live => "live",
            BroadcastStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who holds (or most recently held) the slot, and when their token was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerToken {
    pub identity: String,
    pub issued_at: DateTime<Utc>,
}

/// The singleton broadcast record.
///
/// ## Invariants:
/// - `owner` is `Some` exactly when `status != Offline`
/// - `started_at` is set on entering `Live` from `Offline` and untouched until
///   the session returns to `Offline`
/// - `paused_at` is `Some` exactly when `status == Paused`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSession {
    pub status: BroadcastStatus,
    pub owner: Option<OwnerToken>,
    pub title: Option<String>,
    pub presenter_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Set when the pause was caused by a dropped presenter connection rather
    /// than an explicit pause command.
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every write; used for conditional updates.
    #[serde(default)]
    pub version: u64,
}

impl BroadcastSession {
    /// Fresh offline record.
    pub fn offline(now: DateTime<Utc>) -> Self {
        Self {
            status: BroadcastStatus::Offline,
            owner: None,
            title: None,
            presenter_name: None,
            started_at: None,
            paused_at: None,
            disconnected_at: None,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.owner
            .as_ref()
            .map(|o| o.identity == identity)
            .unwrap_or(false)
    }

    /// Reset to offline defaults, keeping the version counter.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let version = self.version;
        *self = BroadcastSession::offline(now);
        self.version = version;
    }

    /// Check the record's structural invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        let offline = self.status == BroadcastStatus::Offline;
        if offline == self.owner.is_some() {
            return Err(format!(
                "owner presence does not match status {}",
                self.status
            ));
        }
        if offline && (self.started_at.is_some() || self.title.is_some()) {
            return Err("offline session carries broadcast metadata".to_string());
        }
        if !offline && self.started_at.is_none() {
            return Err("on-air session has no start time".to_string());
        }
        if (self.status == BroadcastStatus::Paused) != self.paused_at.is_some() {
            return Err("paused_at does not match status".to_string());
        }
        Ok(())
    }
}

/// The public view of the session: what listeners and the state query see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicState {
    pub is_live: bool,
    pub is_paused: bool,
    pub title: Option<String>,
    pub lecturer: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stream_url: Option<String>,
}

impl PublicState {
    pub fn offline() -> Self {
        Self {
            is_live: false,
            is_paused: false,
            title: None,
            lecturer: None,
            started_at: None,
            stream_url: None,
        }
    }

    /// Project a session record. `is_live` stays true while paused: the
    /// broadcast is still in progress, only muted.
    pub fn from_session(session: &BroadcastSession, stream_url: &str) -> Self {
        if session.status == BroadcastStatus::Offline {
            return Self::offline();
        }
        Self {
            is_live: true,
            is_paused: session.status == BroadcastStatus::Paused,
            title: session.title.clone(),
            lecturer: session.presenter_name.clone(),
            started_at: session.started_at,
            stream_url: Some(stream_url.to_string()),
        }
    }
}
