//! Minimal user collaborator: just enough persisted state (notification
//! toggle + event whitelist) for the Notification Dispatcher and the
//! `repoId`/`identityId` ownership invariants to be enforceable. Identity
//! and repo CRUD, password handling, and registration are out of scope.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub notifications_enabled: bool,
    pub notification_events: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    notifications_enabled: i64,
    notification_events: String,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            notifications_enabled: row.notifications_enabled != 0,
            notification_events: serde_json::from_str(&row.notification_events)
                .context("parsing notification_events")?,
        })
    }
}

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, id: &str) -> Result<User> {
        sqlx::query("INSERT INTO users (id, created_at) VALUES (?, ?)")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("inserting user")?;
        self.get(id)
            .await?
            .context("user missing immediately after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, notifications_enabled, notification_events FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user")?;
        row.map(User::try_from).transpose()
    }

    pub async fn set_notifications_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE users SET notifications_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating notifications_enabled")?;
        Ok(())
    }

    pub async fn set_notification_events(&self, id: &str, events: &[String]) -> Result<()> {
        let json = serde_json::to_string(events)?;
        sqlx::query("UPDATE users SET notification_events = ? WHERE id = ?")
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating notification_events")?;
        Ok(())
    }
}

/// An SSH identity owned by a user. Key material lives on disk at
/// `ssh_private_key_path`; only the Git Runtime reads its contents, and
/// only for the duration of a single git invocation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Identity {
    pub id: String,
    pub owner_user_id: String,
    pub ssh_private_key_path: String,
}

#[derive(Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, id: &str, owner_user_id: &str, ssh_private_key_path: &str) -> Result<Identity> {
        sqlx::query(
            "INSERT INTO identities (id, owner_user_id, ssh_private_key_path, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(owner_user_id)
        .bind(ssh_private_key_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("inserting identity")?;
        self.get(id)
            .await?
            .context("identity missing immediately after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Identity>> {
        sqlx::query_as("SELECT id, owner_user_id, ssh_private_key_path FROM identities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching identity")
    }

    /// Reads the private key material off disk. Callers must not persist the
    /// returned string; it is only valid for a single git invocation.
    pub async fn read_private_key(&self, id: &str) -> Result<String> {
        let identity = self
            .get(id)
            .await?
            .with_context(|| format!("identity {id} not found"))?;
        tokio::fs::read_to_string(&identity.ssh_private_key_path)
            .await
            .with_context(|| format!("reading ssh key for identity {id}"))
    }
}

/// A remote repository a user can run sessions against.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Repo {
    pub id: String,
    pub owner_user_id: String,
    pub repo_url: String,
    pub default_branch: String,
}

#[derive(Clone)]
pub struct RepoRepository {
    pool: SqlitePool,
}

impl RepoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, id: &str, owner_user_id: &str, repo_url: &str, default_branch: &str) -> Result<Repo> {
        sqlx::query(
            "INSERT INTO repos (id, owner_user_id, repo_url, default_branch, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(owner_user_id)
        .bind(repo_url)
        .bind(default_branch)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("inserting repo")?;
        self.get(id).await?.context("repo missing immediately after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Repo>> {
        sqlx::query_as("SELECT id, owner_user_id, repo_url, default_branch FROM repos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching repo")
    }
}
