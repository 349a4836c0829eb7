//! Session Store: CRUD on `Session` keyed by `SessionRef`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{Session, SessionRef, SessionStatus};

/// Raw row shape as sqlx sees it; `status` and timestamps need explicit
/// conversion into the richer domain types.
#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    repo_id: String,
    session_id: String,
    identity_id: String,
    repo_url: String,
    branch: String,
    prompt: String,
    status: String,
    error: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    notifications_enabled: Option<i64>,
    pinned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            user_id: row.user_id,
            repo_id: row.repo_id,
            session_id: row.session_id,
            identity_id: row.identity_id,
            repo_url: row.repo_url,
            branch: row.branch,
            prompt: row.prompt,
            status: row.status.parse::<SessionStatus>()?,
            error: row.error,
            model: row.model,
            provider: row.provider,
            notifications_enabled: row.notifications_enabled.map(|v| v != 0),
            pinned_at: row.pinned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        req: &super::models::CreateSessionRequest,
        session_ref: &SessionRef,
        identity_id: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<Session> {
        let existing = self.get(session_ref).await?;
        if existing.is_some() {
            anyhow::bail!(
                "session already exists for {}/{}/{}",
                session_ref.user_id,
                session_ref.repo_id,
                session_ref.session_id
            );
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO sessions
                (user_id, repo_id, session_id, identity_id, repo_url, branch, prompt,
                 status, error, model, provider, notifications_enabled, pinned_at,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .bind(identity_id)
        .bind(repo_url)
        .bind(branch)
        .bind(&req.prompt)
        .bind(SessionStatus::Pending.to_string())
        .bind(&req.model)
        .bind(&req.provider)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("inserting session")?;

        self.get(session_ref)
            .await?
            .context("session missing immediately after insert")
    }

    pub async fn get(&self, session_ref: &SessionRef) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"SELECT user_id, repo_id, session_id, identity_id, repo_url, branch, prompt,
                      status, error, model, provider, notifications_enabled, pinned_at,
                      created_at, updated_at
               FROM sessions WHERE user_id = ? AND repo_id = ? AND session_id = ?"#,
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        row.map(Session::try_from).transpose()
    }

    /// Resolve a ref across all of a user's repos by `sessionId` alone.
    pub async fn get_by_session_id(&self, user_id: &str, session_id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"SELECT user_id, repo_id, session_id, identity_id, repo_url, branch, prompt,
                      status, error, model, provider, notifications_enabled, pinned_at,
                      created_at, updated_at
               FROM sessions WHERE user_id = ? AND session_id = ?"#,
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("resolving session by id")?;

        row.map(Session::try_from).transpose()
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"SELECT user_id, repo_id, session_id, identity_id, repo_url, branch, prompt,
                      status, error, model, provider, notifications_enabled, pinned_at,
                      created_at, updated_at
               FROM sessions WHERE user_id = ? ORDER BY created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn list_by_repo(&self, user_id: &str, repo_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"SELECT user_id, repo_id, session_id, identity_id, repo_url, branch, prompt,
                      status, error, model, provider, notifications_enabled, pinned_at,
                      created_at, updated_at
               FROM sessions WHERE user_id = ? AND repo_id = ? ORDER BY created_at DESC"#,
        )
        .bind(user_id)
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions by repo")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn update_status(
        &self,
        session_ref: &SessionRef,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE sessions SET status = ?, error = ?, updated_at = ?
               WHERE user_id = ? AND repo_id = ? AND session_id = ?"#,
        )
        .bind(status.to_string())
        .bind(error)
        .bind(now)
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("updating session status")?;
        Ok(())
    }

    pub async fn set_pinned(&self, session_ref: &SessionRef, pinned: bool) -> Result<()> {
        let now = Utc::now();
        let pinned_at = pinned.then_some(now);
        sqlx::query(
            r#"UPDATE sessions SET pinned_at = ?, updated_at = ?
               WHERE user_id = ? AND repo_id = ? AND session_id = ?"#,
        )
        .bind(pinned_at)
        .bind(now)
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("updating pin state")?;
        Ok(())
    }

    pub async fn update_model(&self, session_ref: &SessionRef, model: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE sessions SET model = ?, updated_at = ?
               WHERE user_id = ? AND repo_id = ? AND session_id = ?"#,
        )
        .bind(model)
        .bind(now)
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("updating model")?;
        Ok(())
    }

    /// Deletes the session row; callers are responsible for cascading to
    /// messages/events (see `SessionService::delete`).
    pub async fn delete(&self, session_ref: &SessionRef) -> Result<()> {
        sqlx::query(
            "DELETE FROM sessions WHERE user_id = ? AND repo_id = ? AND session_id = ?",
        )
        .bind(&session_ref.user_id)
        .bind(&session_ref.repo_id)
        .bind(&session_ref.session_id)
        .execute(&self.pool)
        .await
        .context("deleting session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::models::CreateSessionRequest;

    async fn seed_user_and_repo(pool: &SqlitePool) {
        sqlx::query("INSERT INTO users (id, created_at) VALUES ('u1', CURRENT_TIMESTAMP)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO identities (id, owner_user_id, ssh_private_key_path, created_at) VALUES ('id1', 'u1', '/dev/null', CURRENT_TIMESTAMP)",
        )
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO repos (id, owner_user_id, repo_url, default_branch, created_at) VALUES ('repo1', 'u1', 'file:///tmp/origin', 'main', CURRENT_TIMESTAMP)",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        seed_user_and_repo(db.pool()).await;
        let repo = SessionRepository::new(db.pool().clone());

        let session_ref = SessionRef::new("u1", "repo1", "s1");
        let req = CreateSessionRequest {
            id: "s1".to_string(),
            repo_id: "repo1".to_string(),
            identity_id: Some("id1".to_string()),
            branch: Some("main".to_string()),
            prompt: "add README".to_string(),
            model: None,
            provider: None,
        };

        let created = repo
            .create(&req, &session_ref, "id1", "file:///tmp/origin", "main")
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Pending);

        let fetched = repo.get(&session_ref).await.unwrap().unwrap();
        assert_eq!(fetched.prompt, "add README");
    }

    #[tokio::test]
    async fn create_rejects_duplicate() {
        let db = Database::in_memory().await.unwrap();
        seed_user_and_repo(db.pool()).await;
        let repo = SessionRepository::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");
        let req = CreateSessionRequest {
            id: "s1".to_string(),
            repo_id: "repo1".to_string(),
            identity_id: Some("id1".to_string()),
            branch: Some("main".to_string()),
            prompt: "x".to_string(),
            model: None,
            provider: None,
        };
        repo.create(&req, &session_ref, "id1", "file:///tmp/origin", "main")
            .await
            .unwrap();

        let result = repo
            .create(&req, &session_ref, "id1", "file:///tmp/origin", "main")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_status_bumps_updated_at() {
        let db = Database::in_memory().await.unwrap();
        seed_user_and_repo(db.pool()).await;
        let repo = SessionRepository::new(db.pool().clone());
        let session_ref = SessionRef::new("u1", "repo1", "s1");
        let req = CreateSessionRequest {
            id: "s1".to_string(),
            repo_id: "repo1".to_string(),
            identity_id: Some("id1".to_string()),
            branch: Some("main".to_string()),
            prompt: "x".to_string(),
            model: None,
            provider: None,
        };
        let created = repo
            .create(&req, &session_ref, "id1", "file:///tmp/origin", "main")
            .await
            .unwrap();

        repo.update_status(&session_ref, SessionStatus::Running, None)
            .await
            .unwrap();
        let updated = repo.get(&session_ref).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert!(updated.updated_at >= created.updated_at);
    }
}
