//! Session Runner: drives a session through its state machine, owning no
//! persistent state itself — it coordinates the Session Store, Message
//! Store, Event Bus, Git Runtime, and an Agent Provider.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentProvider, EventSink, RunRequest};
use crate::event::{EventBus, SessionEvent};
use crate::git::GitRuntime;
use crate::message::{MessageRepository, MessageRole};
use crate::session::{SessionRef, SessionRepository, SessionStatus};
use crate::user::IdentityRepository;

const SNAPSHOT_AUTHOR_NAME: &str = "agentsessiond";
const SNAPSHOT_AUTHOR_EMAIL: &str = "agentsessiond@localhost";

#[derive(Clone)]
pub struct SessionRunner {
    sessions: SessionRepository,
    messages: MessageRepository,
    identities: IdentityRepository,
    bus: EventBus,
    git: GitRuntime,
    provider: Arc<dyn AgentProvider>,
    worktrees_root: PathBuf,
    /// At-most-one-runner-per-ref guard: holds the live run's cancellation
    /// token while `runAgentLoop` is in flight.
    active: Arc<DashMap<String, CancellationToken>>,
}

impl SessionRunner {
    pub fn new(
        sessions: SessionRepository,
        messages: MessageRepository,
        identities: IdentityRepository,
        bus: EventBus,
        git: GitRuntime,
        provider: Arc<dyn AgentProvider>,
        worktrees_root: PathBuf,
    ) -> Self {
        Self {
            sessions,
            messages,
            identities,
            bus,
            git,
            provider,
            worktrees_root,
            active: Arc::new(DashMap::new()),
        }
    }

    fn worktree_path(&self, session_ref: &SessionRef) -> PathBuf {
        self.worktrees_root
            .join(&session_ref.user_id)
            .join(&session_ref.repo_id)
            .join(&session_ref.session_id)
    }

    async fn set_status(&self, session_ref: &SessionRef, status: SessionStatus, error: Option<&str>) -> Result<()> {
        self.sessions.update_status(session_ref, status, error).await?;
        self.bus
            .emit(session_ref, SessionEvent::SessionStatus { status: status.to_string() })
            .await?;
        Ok(())
    }

    async fn fail(&self, session_ref: &SessionRef, err: &anyhow::Error) {
        tracing::error!(session = %session_ref.key(), error = %err, "session runner error");
        if let Err(set_err) = self.set_status(session_ref, SessionStatus::Failed, Some(&err.to_string())).await {
            tracing::error!(session = %session_ref.key(), error = %set_err, "failed to persist failure status");
        }
    }

    /// Fire-and-forget: spawns the full clone → worktree → snapshot →
    /// agent-loop protocol. Errors become `session:error` + `failed`.
    pub fn start_session(&self, session_ref: SessionRef, prompt: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_start_protocol(&session_ref, &prompt).await {
                this.fail(&session_ref, &err).await;
            }
        });
    }

    async fn run_start_protocol(&self, session_ref: &SessionRef, prompt: &str) -> Result<()> {
        self.bus.register_session(session_ref);
        self.set_status(session_ref, SessionStatus::Cloning, None).await?;

        let session = self
            .sessions
            .get(session_ref)
            .await?
            .context("session not found at start")?;

        let ssh_key = self.identities.read_private_key(&session.identity_id).await?;
        let bare_path = self
            .git
            .ensure_bare_clone(&session.repo_url, &session.identity_id, &ssh_key)
            .await?;
        self.git.fetch(&bare_path, &ssh_key).await?;

        let worktree_path = self.worktree_path(session_ref);
        let branch_name = format!("session/{}", session_ref.session_id);
        self.git
            .create_worktree(&bare_path, &worktree_path, &branch_name, &session.branch)
            .await?;

        self.set_status(session_ref, SessionStatus::Running, None).await?;

        self.snapshot_turn(session_ref, &worktree_path, prompt).await?;

        self.run_agent_loop(session_ref, prompt, &worktree_path, false).await
    }

    /// Captures the pre-turn snapshot, records it on a new user `Message`,
    /// and emits `user:message` followed by an optional `session:snapshot`.
    async fn snapshot_turn(
        &self,
        session_ref: &SessionRef,
        worktree_path: &PathBuf,
        message_text: &str,
    ) -> Result<()> {
        let dirty = self.git.has_uncommitted_changes(worktree_path).await?;
        let sha = if dirty {
            Some(
                self.git
                    .commit(worktree_path, "[snapshot] pre-agent", SNAPSHOT_AUTHOR_NAME, SNAPSHOT_AUTHOR_EMAIL)
                    .await?,
            )
        } else {
            self.git.get_head(worktree_path).await.ok()
        };

        let message = self
            .messages
            .create(session_ref, MessageRole::User, message_text, sha.as_deref())
            .await?;

        self.bus
            .emit(session_ref, SessionEvent::UserMessage { message: message_text.to_string() })
            .await?;

        if let Some(commit_sha) = sha {
            self.bus
                .emit(
                    session_ref,
                    SessionEvent::SessionSnapshot {
                        message_id: message.id,
                        commit_sha,
                    },
                )
                .await?;
        }

        Ok(())
    }

    fn event_sink(&self, session_ref: SessionRef) -> EventSink {
        let bus = self.bus.clone();
        Arc::new(move |event: AgentEvent| {
            let bus = bus.clone();
            let session_ref = session_ref.clone();
            Box::pin(async move {
                let mapped = match event {
                    AgentEvent::Message { text, role } => Some(SessionEvent::AgentOutput { text, role }),
                    AgentEvent::ToolUse { tool, input } => Some(SessionEvent::AgentToolUse { tool, input }),
                    AgentEvent::ToolResult { tool, output } => Some(SessionEvent::AgentToolResult { tool, output }),
                    AgentEvent::WaitingForInput { prompt } => {
                        Some(SessionEvent::SessionWaitingForInput { prompt })
                    }
                    AgentEvent::Completed { summary } => Some(SessionEvent::SessionCompleted { summary }),
                    AgentEvent::Error { message } => Some(SessionEvent::SessionError { error: message }),
                };
                if let Some(event) = mapped {
                    if let Err(err) = bus.emit(&session_ref, event).await {
                        tracing::error!(session = %session_ref.key(), error = %err, "failed to emit agent event");
                    }
                }
            })
        })
    }

    /// Invokes the provider's `run`, mapping each event onto a session event
    /// and handling the status side effects of `completed`/`error`/
    /// `waiting_for_input`.
    async fn run_agent_loop(
        &self,
        session_ref: &SessionRef,
        prompt: &str,
        worktree_path: &PathBuf,
        resume: bool,
    ) -> Result<()> {
        let key = session_ref.key();
        let token = CancellationToken::new();
        self.active.insert(key.clone(), token.clone());

        let provider_session_id = session_ref.provider_session_id();
        let request = RunRequest {
            session_id: provider_session_id,
            prompt: prompt.to_string(),
            cwd: worktree_path.clone(),
            resume,
            model: self.sessions.get(session_ref).await?.and_then(|s| s.model),
        };

        let sink = self.event_sink(session_ref.clone());

        // Events are emitted as they arrive; `completed`/`error`/
        // `waiting_for_input` also drive the status side effects below, by
        // way of a parallel observation channel so the provider's own
        // awaited callback never blocks on a status write it doesn't need.
        let status_sink = self.terminal_status_sink(session_ref.clone());
        let combined: EventSink = {
            let sink = sink.clone();
            Arc::new(move |event: AgentEvent| {
                let sink = sink.clone();
                let status_sink = status_sink.clone();
                Box::pin(async move {
                    status_sink(event.clone()).await;
                    sink(event).await;
                })
            })
        };

        let result = self.provider.run(request, combined, token).await;
        self.active.remove(&key);

        result?;

        if let Some(session) = self.sessions.get(session_ref).await? {
            if session.status == SessionStatus::Running {
                self.set_status(session_ref, SessionStatus::Completed, None).await?;
            }
        }

        Ok(())
    }

    /// Side-channel that persists the status transitions `completed`,
    /// `error`, and `waiting_for_input` imply, independent of the
    /// session-event mapping in `event_sink`.
    fn terminal_status_sink(&self, session_ref: SessionRef) -> EventSink {
        let this = self.clone();
        Arc::new(move |event: AgentEvent| {
            let this = this.clone();
            let session_ref = session_ref.clone();
            Box::pin(async move {
                match event {
                    AgentEvent::Completed { summary } => {
                        if let Err(err) = this.set_status(&session_ref, SessionStatus::Idle, None).await {
                            tracing::error!(error = %err, "failed to persist idle status");
                        }
                        if let Err(err) = this
                            .messages
                            .create(&session_ref, MessageRole::Assistant, &summary, None)
                            .await
                        {
                            tracing::error!(error = %err, "failed to store assistant summary message");
                        }
                    }
                    AgentEvent::Error { message } => {
                        if let Err(err) = this
                            .set_status(&session_ref, SessionStatus::Failed, Some(&message))
                            .await
                        {
                            tracing::error!(error = %err, "failed to persist failed status");
                        }
                    }
                    AgentEvent::WaitingForInput { .. } => {
                        if let Err(err) = this
                            .set_status(&session_ref, SessionStatus::WaitingForInput, None)
                            .await
                        {
                            tracing::error!(error = %err, "failed to persist waiting_for_input status");
                        }
                    }
                    _ => {}
                }
            })
        })
    }

    /// Snapshots, stores the user message, and either injects into a live
    /// run or starts a new one.
    pub async fn send_session_message(&self, session_ref: SessionRef, message: String) -> Result<()> {
        let session = self
            .sessions
            .get(&session_ref)
            .await?
            .context("session not found")?;
        let worktree_path = self.worktree_path(&session_ref);
        let was_reverted = session.status == SessionStatus::Reverted;

        let prior_history = if was_reverted {
            self.messages.list_by_session(&session_ref).await?
        } else {
            Vec::new()
        };

        self.snapshot_turn(&session_ref, &worktree_path, &message).await?;

        self.set_status(&session_ref, SessionStatus::Running, None).await?;

        let provider_session_id = session_ref.provider_session_id();
        if self.provider.is_running(provider_session_id).await {
            self.provider.send_message(provider_session_id, &message).await?;
            return Ok(());
        }

        let this = self.clone();
        // The provider's own conversation state is out-of-sync after a
        // revert, so a fresh `run` gets the full prior transcript prepended.
        let prompt = if was_reverted {
            let mut formatted = String::new();
            for m in &prior_history {
                formatted.push_str(&format!("[{}]: {}\n", m.role, m.content));
            }
            formatted.push_str(&format!("[user]: {message}"));
            formatted
        } else {
            message
        };
        let resume = !was_reverted;

        tokio::spawn(async move {
            if let Err(err) = this
                .run_agent_loop(&session_ref, &prompt, &worktree_path, resume)
                .await
            {
                this.fail(&session_ref, &err).await;
            }
        });

        Ok(())
    }

    pub async fn interrupt_session(&self, session_ref: &SessionRef) -> Result<()> {
        self.provider.abort(session_ref.provider_session_id()).await?;
        self.set_status(session_ref, SessionStatus::Idle, None).await
    }

    pub async fn stop_session(&self, session_ref: &SessionRef) -> Result<()> {
        self.provider.stop(session_ref.provider_session_id()).await?;
        self.set_status(session_ref, SessionStatus::Completed, None).await
    }

    /// Resets the worktree to the snapshot taken before `message_id`'s turn,
    /// deletes the events and messages from that turn onward, and marks the
    /// session `reverted`.
    pub async fn revert_session(&self, session_ref: &SessionRef, message_id: &str) -> Result<()> {
        let target = self
            .messages
            .get_by_id(message_id)
            .await?
            .context("revert target message not found")?;
        let commit_sha = target
            .commit_sha
            .clone()
            .context("revert target has no snapshot commit")?;

        let _ = self.provider.abort(session_ref.provider_session_id()).await;

        let worktree_path = self.worktree_path(session_ref);
        self.git.reset_hard(&worktree_path, &commit_sha).await?;

        let log = self.bus.event_log();
        if let Some(snapshot_seq) = log.find_snapshot_sequence(session_ref, message_id).await? {
            if let Some(boundary) = log.find_turn_boundary(session_ref, snapshot_seq).await? {
                log.delete_from(session_ref, boundary).await?;
            }
        }

        self.messages.delete_after(session_ref, message_id).await?;
        self.messages.delete_by_id(message_id).await?;

        self.set_status(session_ref, SessionStatus::Reverted, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgentProvider;
    use crate::db::Database;
    use crate::event::EventLog;
    use crate::notify::{LogChannel, NotificationDispatcher};
    use crate::session::CreateSessionRequest;
    use crate::user::{IdentityRepository, RepoRepository, UserRepository};
    use tokio::process::Command;

    async fn init_bare_origin(dir: &std::path::Path) {
        Command::new("git")
            .args(["init", "--bare", "--initial-branch=main"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        Command::new("git")
            .args(["clone", dir.to_str().unwrap(), "."])
            .current_dir(scratch.path())
            .output()
            .await
            .unwrap();
        tokio::fs::write(scratch.path().join("README.md"), "hi").await.unwrap();
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(scratch.path())
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=t@example.com",
                "commit",
                "-m",
                "init",
            ])
            .current_dir(scratch.path())
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["push", "origin", "main"])
            .current_dir(scratch.path())
            .output()
            .await
            .unwrap();
    }

    async fn build_runner(
        data_root: &std::path::Path,
    ) -> (SessionRunner, SessionRepository, MessageRepository, SessionRef) {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let identities = IdentityRepository::new(db.pool().clone());
        let repos = RepoRepository::new(db.pool().clone());
        let sessions = SessionRepository::new(db.pool().clone());
        let messages = MessageRepository::new(db.pool().clone());
        let log = EventLog::new(db.pool().clone());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            users.clone(),
            sessions.clone(),
            vec![Arc::new(LogChannel)],
        ));
        let bus = EventBus::new(log, dispatcher);

        users.create("u1").await.unwrap();

        let origin_dir = data_root.join("origin.git");
        tokio::fs::create_dir_all(&origin_dir).await.unwrap();
        init_bare_origin(&origin_dir).await;

        let key_path = data_root.join("id_ed25519");
        tokio::fs::write(&key_path, "not-a-real-key").await.unwrap();
        identities
            .create("id1", "u1", key_path.to_str().unwrap())
            .await
            .unwrap();
        repos
            .create("repo1", "u1", origin_dir.to_str().unwrap(), "main")
            .await
            .unwrap();

        let session_ref = SessionRef::new("u1", "repo1", "s1");
        let req = CreateSessionRequest {
            id: "s1".to_string(),
            repo_id: "repo1".to_string(),
            identity_id: Some("id1".to_string()),
            branch: Some("main".to_string()),
            prompt: "add a line to README".to_string(),
            model: None,
            provider: None,
        };
        sessions
            .create(&req, &session_ref, "id1", origin_dir.to_str().unwrap(), "main")
            .await
            .unwrap();

        let git = GitRuntime::new(data_root.join("repos"));
        let provider = Arc::new(EchoAgentProvider::new());
        let runner = SessionRunner::new(
            sessions.clone(),
            messages.clone(),
            identities,
            bus,
            git,
            provider,
            data_root.join("worktrees"),
        );

        (runner, sessions, messages, session_ref)
    }

    #[tokio::test]
    async fn start_session_runs_to_idle_via_echo_provider() {
        let data_root = tempfile::tempdir().unwrap();
        let (runner, sessions, _messages, session_ref) = build_runner(data_root.path()).await;

        runner.run_start_protocol(&session_ref, "add a line to README").await.unwrap();

        let session = sessions.get(&session_ref).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn revert_resets_worktree_and_status() {
        let data_root = tempfile::tempdir().unwrap();
        let (runner, sessions, messages, session_ref) = build_runner(data_root.path()).await;

        runner.run_start_protocol(&session_ref, "add a line to README").await.unwrap();

        let history = messages.list_by_session(&session_ref).await.unwrap();
        let snapshot_message = history.iter().find(|m| m.commit_sha.is_some()).unwrap();

        runner.revert_session(&session_ref, &snapshot_message.id).await.unwrap();

        let session = sessions.get(&session_ref).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Reverted);
    }
}
