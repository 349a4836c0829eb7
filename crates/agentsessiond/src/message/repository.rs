//! Message Store: per-session user/assistant turns, with an optional
//! pre-turn snapshot commit id.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::session::SessionRef;

use super::models::{Message, MessageRole};

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    user_id: String,
    repo_id: String,
    session_id: String,
    role: String,
    content: String,
    commit_sha: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id,
            user_id: row.user_id,
            repo_id: row.repo_id,
            session_id: row.session_id,
            role: row.role.parse::<MessageRole>()?,
            content: row.content,
            commit_sha: row.commit_sha,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        session_ref: &SessionRef,
        role: MessageRole,
        content: &str,
        commit_sha: Option<&str>,
    ) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO messages (id, user_id, repo_id, session_id, role, content, commit_sha, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(role.to_string())
        .bind(content)
        .bind(commit_sha)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        Ok(Message {
            id,
            user_id: session_ref.user_id.clone(),
            repo_id: session_ref.repo_id.clone(),
            session_id: session_ref.session_id.clone(),
            role,
            content: content.to_string(),
            commit_sha: commit_sha.map(str::to_string),
            created_at: now,
        })
    }

    pub async fn list_by_session(&self, session_ref: &SessionRef) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"SELECT id, user_id, repo_id, session_id, role, content, commit_sha, created_at
               FROM messages WHERE user_id = ? AND repo_id = ? AND session_id = ?
               ORDER BY created_at ASC"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        rows.into_iter().map(Message::try_from).collect()
    }

    pub async fn get_by_id(&self, message_id: &str) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"SELECT id, user_id, repo_id, session_id, role, content, commit_sha, created_at
               FROM messages WHERE id = ?"#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching message")?;

        row.map(Message::try_from).transpose()
    }

    /// Deletes every message in the session strictly after `message_id`'s
    /// `created_at`. Does not delete `message_id` itself.
    pub async fn delete_after(&self, session_ref: &SessionRef, message_id: &str) -> Result<()> {
        let anchor = self
            .get_by_id(message_id)
            .await?
            .context("revert anchor message not found")?;

        sqlx::query(
            r#"DELETE FROM messages
               WHERE user_id = ? AND repo_id = ? AND session_id = ?
                 AND (created_at > ? OR (created_at = ? AND id != ?))"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(anchor.created_at)
        .bind(anchor.created_at)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("deleting messages after anchor")?;
        Ok(())
    }

    pub async fn delete_by_id(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("deleting message")?;
        Ok(())
    }

    pub async fn delete_for_session(&self, session_ref: &SessionRef) -> Result<()> {
        sqlx::query(
            "DELETE FROM messages WHERE user_id = ? AND repo_id = ? AND session_id = ?",
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("deleting session messages")?;
        Ok(())
    }
}
