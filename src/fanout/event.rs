//! Listener event frames.

use crate::session::PublicState;
use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};

/// What happened. Serialised as the frame's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Snapshot sent once to a new subscriber
    Initial,
    BroadcastStart,
    BroadcastStop,
    BroadcastMute,
    BroadcastUnmute,
    /// Periodic keep-alive; carries the last published state
    Heartbeat,
}

/// One frame on the listener stream:
/// `{type, isLive, isPaused, title, lecturer, startedAt, streamUrl}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub state: PublicState,
}

impl ListenerEvent {
    pub fn new(kind: EventKind, state: PublicState) -> Self {
        Self { kind, state }
    }

    /// Server-Sent Events framing: a single `data:` line per frame.
    pub fn to_sse_frame(&self) -> Result<Bytes, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(Bytes::from(format!("data: {}\n\n", json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape() {
        let event = ListenerEvent::new(EventKind::BroadcastMute, PublicState::offline());
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "broadcast_mute");
        assert_eq!(value["isLive"], false);
        assert!(value.get("streamUrl").is_some());
        assert!(value.get("state").is_none());
    }

    #[test]
    fn test_sse_framing() {
        let event = ListenerEvent::new(EventKind::Heartbeat, PublicState::offline());
        let frame = event.to_sse_frame().unwrap();
        let text = std::str::from_utf8(&frame).unwrap();

        assert!(text.starts_with("data: {\"type\":\"heartbeat\""));
        assert!(text.ends_with("\n\n"));
    }
}
