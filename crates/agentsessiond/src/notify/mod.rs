//! Notification Dispatcher: gates and fans out push notifications for
//! select session events.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::event::SessionEvent;
use crate::session::{SessionRef, SessionRepository};
use crate::user::UserRepository;

/// Extension seam for an actual push/webhook/email transport. The shipped
/// `LogChannel` just records the would-be notification; real transports are
/// an out-of-scope collaborator.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, user_id: &str, event: &SessionEvent) -> Result<()>;
}

pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, user_id: &str, event: &SessionEvent) -> Result<()> {
        tracing::info!(user_id, event = event.type_name(), "notification dispatched");
        Ok(())
    }
}

pub struct NotificationDispatcher {
    users: UserRepository,
    sessions: SessionRepository,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(
        users: UserRepository,
        sessions: SessionRepository,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            users,
            sessions,
            channels,
        }
    }

    /// Effective-enabled = the session's override if set, else the user's
    /// global `notificationsEnabled`. Then gated by the user's event-type
    /// whitelist. Each channel call is independent; a failure is logged and
    /// does not stop the others.
    pub async fn dispatch(&self, user_id: &str, session_ref: &SessionRef, event: &SessionEvent) {
        if !event.is_notifiable() {
            return;
        }

        let user = match self.users.get(user_id).await {
            Ok(Some(u)) => u,
            Ok(None) => {
                tracing::warn!(user_id, "notification dispatch for unknown user");
                return;
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "failed to load user for notification gating");
                return;
            }
        };

        let session_override = self
            .sessions
            .get(session_ref)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.notifications_enabled);

        let effective_enabled = session_override.unwrap_or(user.notifications_enabled);
        if !effective_enabled {
            return;
        }

        if !user.notification_events.iter().any(|e| e == event.type_name()) {
            return;
        }

        for channel in &self.channels {
            if let Err(err) = channel.send(user_id, event).await {
                tracing::warn!(user_id, error = %err, "notification channel failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel(Arc<AtomicUsize>);

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        async fn send(&self, _user_id: &str, _event: &SessionEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn disabled_user_gets_nothing() {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        users.create("u1").await.unwrap();
        users.set_notifications_enabled("u1", false).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = NotificationDispatcher::new(
            users,
            SessionRepository::new(db.pool().clone()),
            vec![Arc::new(CountingChannel(count.clone()))],
        );

        let session_ref = SessionRef::new("u1", "repo1", "s1");
        dispatcher
            .dispatch(
                "u1",
                &session_ref,
                &SessionEvent::SessionCompleted { summary: "ok".into() },
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn whitelist_gates_event_types() {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        users.create("u1").await.unwrap();
        users.set_notifications_enabled("u1", true).await.unwrap();
        users
            .set_notification_events("u1", &["session:error".to_string()])
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = NotificationDispatcher::new(
            users,
            SessionRepository::new(db.pool().clone()),
            vec![Arc::new(CountingChannel(count.clone()))],
        );
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        dispatcher
            .dispatch(
                "u1",
                &session_ref,
                &SessionEvent::SessionCompleted { summary: "ok".into() },
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatcher
            .dispatch(
                "u1",
                &session_ref,
                &SessionEvent::SessionError { error: "boom".into() },
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
