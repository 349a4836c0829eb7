//! Agent Provider Interface: the contract the Session Runner drives an
//! external coding agent through. Mirrors the backend-abstraction shape used
//! elsewhere in this codebase for pluggable execution environments, trimmed
//! to the single `run`/`sendMessage`/`stop`/`abort` lifecycle this runtime
//! needs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback the provider awaits for every event it produces during a `run`.
/// Providers must not invoke this after `run` has returned.
pub type EventSink = Arc<dyn Fn(AgentEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: Uuid,
    pub prompt: String,
    pub cwd: std::path::PathBuf,
    /// `true` continues the provider's existing conversation for
    /// `session_id`; `false` starts fresh.
    pub resume: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Message { text: String, role: String },
    ToolUse { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: serde_json::Value },
    WaitingForInput { prompt: String },
    Completed { summary: String },
    Error { message: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentModel {
    pub id: String,
    pub display_name: String,
}

/// Unified interface for running an external coding agent against a
/// checked-out worktree. `session_id` is the provider-facing identifier
/// derived from the composite session ref, not the session's own row id.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Runs until the agent finishes, emitting events via `on_event`.
    /// Cooperatively cancelled through `abort_signal`.
    async fn run(
        &self,
        request: RunRequest,
        on_event: EventSink,
        abort_signal: CancellationToken,
    ) -> Result<()>;

    /// Injects a follow-up message into a live `run`.
    async fn send_message(&self, session_id: Uuid, message: &str) -> Result<()>;

    /// Graceful end of a live `run`.
    async fn stop(&self, session_id: Uuid) -> Result<()>;

    /// Immediate cancellation; signals the run's `abort_signal`.
    async fn abort(&self, session_id: Uuid) -> Result<()>;

    async fn is_running(&self, session_id: Uuid) -> bool;

    async fn get_models(&self) -> Result<Vec<AgentModel>> {
        Ok(Vec::new())
    }
}

/// Test/demo provider: echoes the prompt back as a single assistant message
/// and completes. Exists to exercise the Session Runner end-to-end without a
/// real external agent binary; not a production provider.
pub struct EchoAgentProvider {
    running: DashMap<Uuid, CancellationToken>,
}

impl EchoAgentProvider {
    pub fn new() -> Self {
        Self {
            running: DashMap::new(),
        }
    }
}

impl Default for EchoAgentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentProvider for EchoAgentProvider {
    async fn run(
        &self,
        request: RunRequest,
        on_event: EventSink,
        abort_signal: CancellationToken,
    ) -> Result<()> {
        self.running.insert(request.session_id, abort_signal.clone());

        on_event(AgentEvent::Message {
            text: format!("echo: {}", request.prompt),
            role: "assistant".to_string(),
        })
        .await;

        if abort_signal.is_cancelled() {
            self.running.remove(&request.session_id);
            return Ok(());
        }

        on_event(AgentEvent::Completed {
            summary: format!("echoed {} characters", request.prompt.len()),
        })
        .await;

        self.running.remove(&request.session_id);
        Ok(())
    }

    async fn send_message(&self, session_id: Uuid, _message: &str) -> Result<()> {
        anyhow::bail!("echo provider session {session_id} completes synchronously and cannot accept follow-ups mid-run")
    }

    async fn stop(&self, session_id: Uuid) -> Result<()> {
        if let Some((_, token)) = self.running.remove(&session_id) {
            token.cancel();
        }
        Ok(())
    }

    async fn abort(&self, session_id: Uuid) -> Result<()> {
        self.stop(session_id).await
    }

    async fn is_running(&self, session_id: Uuid) -> bool {
        self.running.contains_key(&session_id)
    }

    async fn get_models(&self) -> Result<Vec<AgentModel>> {
        Ok(vec![AgentModel {
            id: "echo-1".to_string(),
            display_name: "Echo Agent".to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn collecting_sink() -> (EventSink, Arc<StdMutex<Vec<String>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |event| {
            let events = captured.clone();
            Box::pin(async move {
                let label = match event {
                    AgentEvent::Message { .. } => "message",
                    AgentEvent::ToolUse { .. } => "tool_use",
                    AgentEvent::ToolResult { .. } => "tool_result",
                    AgentEvent::WaitingForInput { .. } => "waiting_for_input",
                    AgentEvent::Completed { .. } => "completed",
                    AgentEvent::Error { .. } => "error",
                };
                events.lock().unwrap().push(label.to_string());
            })
        });
        (sink, events)
    }

    #[tokio::test]
    async fn echo_provider_emits_message_then_completes() {
        let provider = EchoAgentProvider::new();
        let (sink, events) = collecting_sink();
        let session_id = Uuid::new_v4();

        provider
            .run(
                RunRequest {
                    session_id,
                    prompt: "hello".into(),
                    cwd: std::path::PathBuf::from("/tmp"),
                    resume: false,
                    model: None,
                },
                sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["message", "completed"]);
        assert!(!provider.is_running(session_id).await);
    }

    #[tokio::test]
    async fn abort_before_completion_skips_completed_event() {
        let provider = Arc::new(EchoAgentProvider::new());
        let session_id = Uuid::new_v4();
        let token = CancellationToken::new();
        token.cancel();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let sink: EventSink = Arc::new(move |_event| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        provider
            .run(
                RunRequest {
                    session_id,
                    prompt: "hi".into(),
                    cwd: std::path::PathBuf::from("/tmp"),
                    resume: false,
                    model: None,
                },
                sink,
                token,
            )
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
