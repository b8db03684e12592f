//! # Listener Fan-out
//!
//! Pushes every coordinator transition to all subscribed listeners.
//!
//! ## Delivery model:
//! - Each listener owns a bounded `mpsc` channel; publishing never awaits, it
//!   uses `try_send`
//! - A closed channel (listener went away) or a full one (listener too slow)
//!   removes that listener and nobody else notices
//! - Frames on one channel arrive in publish order, because `mpsc` is FIFO
//!   and transitions are published one at a time by the coordinator
//!
//! The registry is a `DashMap`, so subscribe/unsubscribe from connection tasks
//! can run while a publish is iterating. Failed listeners are collected during
//! iteration and removed afterwards.

use super::event::{EventKind, ListenerEvent};
use super::EventSink;
use crate::session::PublicState;
use actix_web::web::Bytes;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, Stream};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Listener {
    tx: mpsc::Sender<ListenerEvent>,
    last_activity: Instant,
}

struct Inner {
    listeners: DashMap<Uuid, Listener>,
    buffer: usize,
    /// Last non-heartbeat state, replayed in heartbeats
    last_state: RwLock<PublicState>,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// `buffer` is the per-listener queue depth; it must be at least 1 so the
    /// initial snapshot always fits.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                buffer: buffer.max(1),
                last_state: RwLock::new(PublicState::offline()),
            }),
        }
    }

    /// Register a listener. The `initial` snapshot is queued before the
    /// listener joins the active set, so it is always the first frame.
    pub fn subscribe(&self, initial: PublicState) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = Uuid::new_v4();

        if let Err(e) = tx.try_send(ListenerEvent::new(EventKind::Initial, initial.clone())) {
            warn!(listener = %id, "could not queue initial state: {}", e);
        }
        self.set_last_state(initial);
        self.inner.listeners.insert(
            id,
            Listener {
                tx,
                last_activity: Instant::now(),
            },
        );

        info!(listener = %id, active = self.listener_count(), "listener subscribed");
        Subscription {
            id,
            rx,
            broadcaster: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.inner.listeners.remove(&id).is_some() {
            info!(listener = %id, active = self.listener_count(), "listener unsubscribed");
        }
    }

    /// Deliver a state change to every active listener.
    pub fn publish(&self, kind: EventKind, state: PublicState) -> PublishReport {
        if kind != EventKind::Heartbeat {
            self.set_last_state(state.clone());
        }
        let event = ListenerEvent::new(kind, state);

        let mut report = PublishReport::default();
        let mut dead = Vec::new();
        for mut entry in self.inner.listeners.iter_mut() {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {
                    entry.last_activity = Instant::now();
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        listener = %entry.key(),
                        idle_ms = entry.last_activity.elapsed().as_millis() as u64,
                        "listener too slow, disconnecting"
                    );
                    dead.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(listener = %entry.key(), "listener channel closed");
                    dead.push(*entry.key());
                }
            }
        }

        for id in dead {
            self.inner.listeners.remove(&id);
            report.dropped += 1;
        }

        if kind != EventKind::Heartbeat || report.dropped > 0 {
            debug!(?kind, delivered = report.delivered, dropped = report.dropped, "event published");
        }
        report
    }

    /// Keep-alive frame carrying the last published state.
    pub fn publish_heartbeat(&self) -> PublishReport {
        let state = self.last_state();
        self.publish(EventKind::Heartbeat, state)
    }

    /// Emit heartbeats forever at `interval`.
    pub async fn run_heartbeat(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.publish_heartbeat();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn last_state(&self) -> PublicState {
        self.inner
            .last_state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn set_last_state(&self, state: PublicState) {
        match self.inner.last_state.write() {
            Ok(mut guard) => *guard = state,
            Err(p) => *p.into_inner() = state,
        }
    }
}

#[async_trait]
impl EventSink for Broadcaster {
    async fn notify(&self, kind: EventKind, state: &PublicState) -> anyhow::Result<()> {
        self.publish(kind, state.clone());
        Ok(())
    }
}

/// A listener's end of the fan-out. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<ListenerEvent>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        self.rx.recv().await
    }

    /// SSE body. Ends when the broadcaster drops this listener.
    pub fn into_sse_stream(self) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.rx.recv().await?;
            match event.to_sse_frame() {
                Ok(frame) => Some((Ok(frame), sub)),
                Err(e) => Some((Err(actix_web::error::ErrorInternalServerError(e)), sub)),
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn live_state() -> PublicState {
        PublicState {
            is_live: true,
            is_paused: false,
            title: Some("Tafsir".to_string()),
            lecturer: Some("X".to_string()),
            started_at: Some(chrono::Utc::now()),
            stream_url: Some("http://radio/live".to_string()),
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_first_frame() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe(live_state());

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Initial);
        assert!(first.state.is_live);
    }

    #[tokio::test]
    async fn test_dead_listener_does_not_block_others() {
        let broadcaster = Broadcaster::new(8);
        let mut subs: Vec<Subscription> = (0..5)
            .map(|_| broadcaster.subscribe(PublicState::offline()))
            .collect();

        // Simulate one listener whose connection died: its receiver is closed
        // but the registry entry is still present.
        subs[2].rx.close();
        assert_eq!(broadcaster.listener_count(), 5);

        let report = broadcaster.publish(EventKind::BroadcastStart, live_state());
        assert_eq!(report, PublishReport { delivered: 4, dropped: 1 });
        assert_eq!(broadcaster.listener_count(), 4);

        for (i, sub) in subs.iter_mut().enumerate() {
            if i == 2 {
                continue;
            }
            assert_eq!(sub.recv().await.unwrap().kind, EventKind::Initial);
            assert_eq!(sub.recv().await.unwrap().kind, EventKind::BroadcastStart);
        }
    }

    #[tokio::test]
    async fn test_slow_listener_is_disconnected() {
        let broadcaster = Broadcaster::new(2);
        let _slow = broadcaster.subscribe(PublicState::offline());
        let mut fast = broadcaster.subscribe(PublicState::offline());
        fast.recv().await.unwrap();

        // Buffer of 2 already holds the initial frame for `_slow`.
        broadcaster.publish(EventKind::BroadcastStart, live_state());
        fast.recv().await.unwrap();
        let report = broadcaster.publish(EventKind::BroadcastMute, live_state());

        assert_eq!(report.dropped, 1);
        assert_eq!(broadcaster.listener_count(), 1);
        assert_eq!(fast.recv().await.unwrap().kind, EventKind::BroadcastMute);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let broadcaster = Broadcaster::new(16);
        let mut sub = broadcaster.subscribe(PublicState::offline());

        let kinds = [
            EventKind::BroadcastStart,
            EventKind::BroadcastMute,
            EventKind::BroadcastUnmute,
            EventKind::BroadcastStop,
        ];
        for kind in kinds {
            broadcaster.publish(kind, live_state());
        }

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Initial);
        for kind in kinds {
            assert_eq!(sub.recv().await.unwrap().kind, kind);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_replays_last_state() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe(PublicState::offline());
        sub.recv().await.unwrap();

        broadcaster.publish(EventKind::BroadcastStart, live_state());
        sub.recv().await.unwrap();

        broadcaster.publish_heartbeat();
        let beat = sub.recv().await.unwrap();
        assert_eq!(beat.kind, EventKind::Heartbeat);
        assert_eq!(beat.state.title.as_deref(), Some("Tafsir"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_ticks_on_interval() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe(PublicState::offline());
        sub.recv().await.unwrap();

        let task = tokio::spawn(broadcaster.clone().run_heartbeat(Duration::from_secs(15)));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Heartbeat);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Heartbeat);
        task.abort();
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let broadcaster = Broadcaster::new(8);
        let sub = broadcaster.subscribe(PublicState::offline());
        assert_eq!(broadcaster.listener_count(), 1);

        let mut stream = Box::pin(sub.into_sse_stream());
        let first = stream.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&first).unwrap().contains("\"initial\""));

        drop(stream);
        assert_eq!(broadcaster.listener_count(), 0);
    }
}
