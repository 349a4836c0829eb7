//! Event Bus: in-process pub/sub keyed by session ref, plus coarse
//! per-user "session updated" events. Routes every emit through the
//! `EventLog` before fan-out ("log-then-fan-out").

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::notify::NotificationDispatcher;
use crate::session::SessionRef;

use super::log::EventLog;
use super::models::{EventEnvelope, SessionEvent, UserEvent};

const REF_CHANNEL_CAPACITY: usize = 512;
const USER_CHANNEL_CAPACITY: usize = 256;

struct RefChannel {
    tx: broadcast::Sender<EventEnvelope>,
    owner_user_id: String,
}

/// In-process pub/sub. Does not own durability — that's `EventLog` — only
/// the transient subscriber lists and the per-ref owner lookup needed to
/// route `UserEvent`s.
#[derive(Clone)]
pub struct EventBus {
    log: EventLog,
    refs: Arc<DashMap<String, RefChannel>>,
    users: Arc<DashMap<String, broadcast::Sender<UserEvent>>>,
    notifier: Arc<NotificationDispatcher>,
}

impl EventBus {
    pub fn new(log: EventLog, notifier: Arc<NotificationDispatcher>) -> Self {
        Self {
            log,
            refs: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
            notifier,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Declares which user owns `ref`, for `UserEvent` routing. Idempotent.
    pub fn register_session(&self, session_ref: &SessionRef) {
        self.refs.entry(session_ref.key()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(REF_CHANNEL_CAPACITY);
            RefChannel {
                tx,
                owner_user_id: session_ref.user_id.clone(),
            }
        });
    }

    /// Assigns a sequence, persists, then fans out to ref- and user-
    /// subscribers, and hands off to the notification dispatcher.
    pub async fn emit(&self, session_ref: &SessionRef, event: SessionEvent) -> Result<EventEnvelope> {
        self.register_session(session_ref);

        let envelope = self.log.append(session_ref, event).await?;

        if let Some(channel) = self.refs.get(&session_ref.key()) {
            // A broadcast send failing with no receivers is expected and not an error.
            let _ = channel.tx.send(envelope.clone());
        }

        if let SessionEvent::SessionStatus { status } = &envelope.event {
            self.emit_user_event(
                &session_ref.user_id,
                UserEvent {
                    session_id: session_ref.session_id.clone(),
                    status: status.clone(),
                },
            );
        }

        if envelope.event.is_notifiable() {
            self.notifier
                .dispatch(&session_ref.user_id, session_ref, &envelope.event)
                .await;
        }

        Ok(envelope)
    }

    fn emit_user_event(&self, user_id: &str, event: UserEvent) {
        if let Some(tx) = self.users.get(user_id) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to live events for a single ref. Returns a broadcast
    /// receiver; dropping it unsubscribes.
    pub fn subscribe(&self, session_ref: &SessionRef) -> broadcast::Receiver<EventEnvelope> {
        self.register_session(session_ref);
        self.refs.get(&session_ref.key()).unwrap().tx.subscribe()
    }

    pub fn subscribe_user(&self, user_id: &str) -> broadcast::Receiver<UserEvent> {
        let tx = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(USER_CHANNEL_CAPACITY).0)
            .clone();
        tx.subscribe()
    }

    /// Drops subscribers and associated transient state for `ref`. Does not
    /// touch persisted events — callers delete those via `EventLog::remove`.
    pub fn remove(&self, session_ref: &SessionRef) {
        self.refs.remove(&session_ref.key());
    }

    pub fn owner_of(&self, session_ref: &SessionRef) -> Option<String> {
        self.refs
            .get(&session_ref.key())
            .map(|c| c.owner_user_id.clone())
    }

    /// Subscribes before querying history, so no event emitted during the
    /// query is lost; returns the live receiver plus the ordered backlog
    /// and the sequence it ends at. Callers write the backlog, then a sync
    /// frame carrying the returned sequence, then forward the receiver
    /// live, skipping anything with `sequence <= last_sequence`.
    pub async fn subscribe_with_replay(
        &self,
        session_ref: &SessionRef,
        after: Option<i64>,
    ) -> Result<(broadcast::Receiver<EventEnvelope>, Vec<EventEnvelope>, i64)> {
        let rx = self.subscribe(session_ref);
        let history = self.log.list(session_ref, after).await?;
        let last_sequence = history
            .last()
            .map(|e| e.sequence)
            .unwrap_or_else(|| after.unwrap_or(0));
        Ok((rx, history, last_sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::notify::{NotificationChannel, NotificationDispatcher};
    use crate::user::UserRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel(Arc<AtomicUsize>);

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        async fn send(&self, _user_id: &str, _event: &SessionEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn bus_with_user(count: Arc<AtomicUsize>) -> (EventBus, UserRepository) {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let sessions = crate::session::SessionRepository::new(db.pool().clone());
        let log = EventLog::new(db.pool().clone());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            users.clone(),
            sessions,
            vec![Arc::new(CountingChannel(count))],
        ));
        (EventBus::new(log, dispatcher), users)
    }

    #[tokio::test]
    async fn emit_delivers_in_sequence_order() {
        let count = Arc::new(AtomicUsize::new(0));
        let (bus, users) = bus_with_user(count).await;
        let session_ref = SessionRef::new("u1", "repo1", "s1");
        users.create("u1").await.unwrap();

        let mut rx = bus.subscribe(&session_ref);

        bus.emit(&session_ref, SessionEvent::SessionStatus { status: "cloning".into() })
            .await
            .unwrap();
        bus.emit(&session_ref, SessionEvent::SessionStatus { status: "running".into() })
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn status_event_also_emits_user_event() {
        let count = Arc::new(AtomicUsize::new(0));
        let (bus, users) = bus_with_user(count).await;
        users.create("u1").await.unwrap();
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        let mut user_rx = bus.subscribe_user("u1");
        bus.emit(&session_ref, SessionEvent::SessionStatus { status: "idle".into() })
            .await
            .unwrap();

        let user_event = user_rx.recv().await.unwrap();
        assert_eq!(user_event.session_id, "s1");
        assert_eq!(user_event.status, "idle");
    }

    #[tokio::test]
    async fn notifiable_event_reaches_dispatcher() {
        let count = Arc::new(AtomicUsize::new(0));
        let (bus, users) = bus_with_user(count.clone()).await;
        users.create("u1").await.unwrap();
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        bus.emit(
            &session_ref,
            SessionEvent::SessionCompleted { summary: "done".into() },
        )
        .await
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
