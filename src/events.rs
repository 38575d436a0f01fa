//! Advisory notification channel for Together sessions.
//!
//! One broadcast channel per session. Events are low-latency nudges only:
//! they name the session and the kind of change, never the changed data.
//! Subscribers must re-read the session rows to reconcile, so a lagged or
//! dropped event is harmless as long as a later one arrives.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    RosterChanged,
    SessionStarted,
    SessionUpdated,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::RosterChanged => "roster_changed",
            SessionEventKind::SessionStarted => "session_started",
            SessionEventKind::SessionUpdated => "session_updated",
        }
    }
}

/// A content-free nudge. Intentionally carries no row data: the session row
/// in the database is the single source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub event_id: Uuid,
    pub session_id: i64,
    pub kind: SessionEventKind,
}

#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<i64, broadcast::Sender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicking task elsewhere cannot leave the sender map half-updated,
    /// so a poisoned lock is recovered rather than wedging every later
    /// publish and killing the handler tasks that nudge the bus.
    fn lock_channels(&self) -> MutexGuard<'_, HashMap<i64, broadcast::Sender<SessionEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a nudge to whoever is listening. Sessions without
    /// subscribers drop the event silently; that is fine, a client that
    /// connects later reconciles from the database anyway.
    pub fn publish(&self, session_id: i64, kind: SessionEventKind) {
        let channels = self.lock_channels();
        if let Some(sender) = channels.get(&session_id) {
            let event = SessionEvent {
                event_id: Uuid::new_v4(),
                session_id,
                kind,
            };
            let delivered = sender.send(event).unwrap_or(0);
            debug!(
                "Published {} for session {} to {} subscribers",
                kind.as_str(),
                session_id,
                delivered
            );
        }
    }

    pub fn subscribe(&self, session_id: i64) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.lock_channels();
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drops the channel once a session is completed. Existing receivers see
    /// `Closed` on their next recv.
    pub fn close(&self, session_id: i64) {
        let mut channels = self.lock_channels();
        channels.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);

        bus.publish(1, SessionEventKind::RosterChanged);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, 1);
        assert_eq!(event.kind, SessionEventKind::RosterChanged);
    }

    #[tokio::test]
    async fn events_are_scoped_per_session() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe(1);
        let _rx_b = bus.subscribe(2);

        bus.publish(2, SessionEventKind::SessionUpdated);
        bus.publish(1, SessionEventKind::SessionStarted);

        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.session_id, 1);
        assert_eq!(event.kind, SessionEventKind::SessionStarted);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // must not panic or block
        bus.publish(99, SessionEventKind::SessionUpdated);
    }

    #[tokio::test]
    async fn closed_channel_ends_receivers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);
        bus.close(1);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn bus_outlives_a_panicking_user_task() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            publisher.publish(1, SessionEventKind::RosterChanged);
            panic!("client task died");
        });
        assert!(handle.await.is_err());

        bus.publish(1, SessionEventKind::SessionUpdated);
        assert_eq!(rx.recv().await.unwrap().kind, SessionEventKind::RosterChanged);
        assert_eq!(rx.recv().await.unwrap().kind, SessionEventKind::SessionUpdated);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events() {
        // Events are nudges, not state: missing earlier ones must be safe by
        // construction, because every consumer re-reads the session row.
        let bus = EventBus::new();
        bus.publish(1, SessionEventKind::SessionUpdated);

        let mut rx = bus.subscribe(1);
        bus.publish(1, SessionEventKind::SessionUpdated);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::SessionUpdated);
    }
}
