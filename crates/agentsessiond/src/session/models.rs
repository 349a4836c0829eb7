//! Session data model: the composite ref, status enum, and the persisted row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite identifier: `sessionId` alone is never unique, only `(userId,
/// repoId, sessionId)` is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub user_id: String,
    pub repo_id: String,
    pub session_id: String,
}

impl SessionRef {
    pub fn new(
        user_id: impl Into<String>,
        repo_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            repo_id: repo_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Stable string key used for in-memory map lookups: `"u/r/s"`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.user_id, self.repo_id, self.session_id)
    }

    /// Deterministic UUIDv5 derived from `key()`, used as the agent
    /// provider's session identifier so resume survives a restart.
    pub fn provider_session_id(&self) -> uuid::Uuid {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, self.key().as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Cloning,
    Running,
    WaitingForInput,
    Idle,
    Completed,
    Failed,
    Reverted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            SessionStatus::Idle | SessionStatus::WaitingForInput | SessionStatus::Reverted
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Cloning => "cloning",
            SessionStatus::Running => "running",
            SessionStatus::WaitingForInput => "waiting_for_input",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Reverted => "reverted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => SessionStatus::Pending,
            "cloning" => SessionStatus::Cloning,
            "running" => SessionStatus::Running,
            "waiting_for_input" => SessionStatus::WaitingForInput,
            "idle" => SessionStatus::Idle,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "reverted" => SessionStatus::Reverted,
            other => anyhow::bail!("unknown session status: {other}"),
        })
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Durable session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub repo_id: String,
    pub session_id: String,
    pub identity_id: String,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Per-session notification override; `None` defers to the user's global toggle.
    pub notifications_enabled: Option<bool>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn session_ref(&self) -> SessionRef {
        SessionRef::new(&self.user_id, &self.repo_id, &self.session_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub id: String,
    #[serde(rename = "repoId")]
    pub repo_id: String,
    #[serde(rename = "identityId")]
    pub identity_id: Option<String>,
    pub branch: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub provider: Option<String>,
}
