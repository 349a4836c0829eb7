//! Event Log: append-only, per-ref sequenced, persisted event store.
//!
//! Sequence assignment and append are serialized per ref via an in-process
//! lock (multi-process coordination is out of scope) so two concurrent
//! emitters for the same ref never race on `MAX(sequence)+1`.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::session::SessionRef;

use super::models::{EventEnvelope, SessionEvent};

#[derive(sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    event_type: String,
    data: String,
}

fn row_to_envelope(row: EventRow) -> Result<EventEnvelope> {
    let payload: serde_json::Value =
        serde_json::from_str(&row.data).context("parsing stored event data")?;
    let tagged = serde_json::json!({ "type": row.event_type, "data": payload });
    let event: SessionEvent =
        serde_json::from_value(tagged).context("deserializing stored event")?;
    Ok(EventEnvelope {
        sequence: row.sequence,
        event,
    })
}

#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    ref_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            ref_locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, session_ref: &SessionRef) -> Arc<Mutex<()>> {
        self.ref_locks
            .entry(session_ref.key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Assigns the next sequence and persists the event atomically with
    /// respect to other appends for the same ref.
    pub async fn append(
        &self,
        session_ref: &SessionRef,
        event: SessionEvent,
    ) -> Result<EventEnvelope> {
        let lock = self.lock_for(session_ref);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await.context("starting event tx")?;

        let current_max: Option<i64> = sqlx::query_scalar(
            r#"SELECT MAX(sequence) FROM session_events
               WHERE user_id = ? AND repo_id = ? AND session_id = ?"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .fetch_one(&mut *tx)
        .await
        .context("reading max sequence")?;

        let sequence = current_max.unwrap_or(0) + 1;
        let event_type = event.type_name();
        let data = serde_json::to_string(&event.data_json()).context("serializing event data")?;
        let message_id = event.snapshot_message_id();

        sqlx::query(
            r#"INSERT INTO session_events
                (user_id, repo_id, session_id, sequence, event_type, data, message_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(sequence)
        .bind(event_type)
        .bind(&data)
        .bind(message_id)
        .execute(&mut *tx)
        .await
        .context("inserting event")?;

        tx.commit().await.context("committing event tx")?;

        Ok(EventEnvelope { sequence, event })
    }

    /// Events with `sequence > after_seq`, ascending. `after_seq = None`
    /// returns the full history.
    pub async fn list(
        &self,
        session_ref: &SessionRef,
        after_seq: Option<i64>,
    ) -> Result<Vec<EventEnvelope>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"SELECT sequence, event_type, data FROM session_events
               WHERE user_id = ? AND repo_id = ? AND session_id = ? AND sequence > ?
               ORDER BY sequence ASC"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(after_seq.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("listing events")?;

        rows.into_iter().map(row_to_envelope).collect()
    }

    pub async fn remove(&self, session_ref: &SessionRef) -> Result<()> {
        sqlx::query(
            "DELETE FROM session_events WHERE user_id = ? AND repo_id = ? AND session_id = ?",
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("removing session events")?;
        self.ref_locks.remove(&session_ref.key());
        Ok(())
    }

    /// Sequence of the `session:snapshot` event whose stored `message_id`
    /// matches, if any. Indexed via the `message_id` column rather than a
    /// substring scan of serialized event data.
    pub async fn find_snapshot_sequence(
        &self,
        session_ref: &SessionRef,
        message_id: &str,
    ) -> Result<Option<i64>> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"SELECT sequence FROM session_events
               WHERE user_id = ? AND repo_id = ? AND session_id = ?
                 AND event_type = 'session:snapshot' AND message_id = ?"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding snapshot sequence")?;
        Ok(seq)
    }

    /// The highest-sequence `user:message` event at or before `before_seq`
    /// (inclusive) — the start of that turn.
    pub async fn find_turn_boundary(
        &self,
        session_ref: &SessionRef,
        before_seq: i64,
    ) -> Result<Option<i64>> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"SELECT MAX(sequence) FROM session_events
               WHERE user_id = ? AND repo_id = ? AND session_id = ?
                 AND event_type = 'user:message' AND sequence <= ?"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(before_seq)
        .fetch_one(&self.pool)
        .await
        .context("finding turn boundary")?;
        Ok(seq)
    }

    /// Deletes every event with `sequence >= boundary_seq`.
    pub async fn delete_from(&self, session_ref: &SessionRef, boundary_seq: i64) -> Result<()> {
        sqlx::query(
            r#"DELETE FROM session_events
               WHERE user_id = ? AND repo_id = ? AND session_id = ? AND sequence >= ?"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(boundary_seq)
        .execute(&self.pool)
        .await
        .context("deleting events from boundary")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn append_assigns_monotonic_sequence() {
        let db = Database::in_memory().await.unwrap();
        let log = EventLog::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        let e1 = log
            .append(&session_ref, SessionEvent::SessionStatus { status: "cloning".into() })
            .await
            .unwrap();
        let e2 = log
            .append(&session_ref, SessionEvent::SessionStatus { status: "running".into() })
            .await
            .unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[tokio::test]
    async fn list_after_returns_only_newer_events() {
        let db = Database::in_memory().await.unwrap();
        let log = EventLog::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        for status in ["cloning", "running", "idle"] {
            log.append(
                &session_ref,
                SessionEvent::SessionStatus { status: status.into() },
            )
            .await
            .unwrap();
        }

        let after = log.list(&session_ref, Some(1)).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].sequence, 2);
        assert_eq!(after[1].sequence, 3);
    }

    #[tokio::test]
    async fn snapshot_lookup_and_turn_boundary() {
        let db = Database::in_memory().await.unwrap();
        let log = EventLog::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");

        log.append(
            &session_ref,
            SessionEvent::UserMessage { message: "hi".into() },
        )
        .await
        .unwrap(); // seq 1
        let snap = log
            .append(
                &session_ref,
                SessionEvent::SessionSnapshot {
                    message_id: "m1".into(),
                    commit_sha: "abc".into(),
                },
            )
            .await
            .unwrap(); // seq 2
        log.append(
            &session_ref,
            SessionEvent::AgentOutput { text: "working".into(), role: "assistant".into() },
        )
        .await
        .unwrap(); // seq 3

        let snap_seq = log
            .find_snapshot_sequence(&session_ref, "m1")
            .await
            .unwrap();
        assert_eq!(snap_seq, Some(snap.sequence));

        let boundary = log
            .find_turn_boundary(&session_ref, snap.sequence)
            .await
            .unwrap();
        assert_eq!(boundary, Some(1));

        log.delete_from(&session_ref, boundary.unwrap()).await.unwrap();
        let remaining = log.list(&session_ref, None).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn remove_clears_all_events() {
        let db = Database::in_memory().await.unwrap();
        let log = EventLog::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");
        log.append(&session_ref, SessionEvent::SessionStatus { status: "idle".into() })
            .await
            .unwrap();
        log.remove(&session_ref).await.unwrap();
        assert!(log.list(&session_ref, None).await.unwrap().is_empty());
    }
}
