//! Tagged session event variants. Each variant keeps its own payload shape —
//! no shared `data: map`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "agent:output")]
    AgentOutput { text: String, role: String },

    #[serde(rename = "agent:tool_use")]
    AgentToolUse { tool: String, input: serde_json::Value },

    #[serde(rename = "agent:tool_result")]
    AgentToolResult { tool: String, output: serde_json::Value },

    #[serde(rename = "user:message")]
    UserMessage { message: String },

    #[serde(rename = "session:status")]
    SessionStatus { status: String },

    #[serde(rename = "session:waiting_for_input")]
    SessionWaitingForInput { prompt: String },

    #[serde(rename = "session:completed")]
    SessionCompleted { summary: String },

    #[serde(rename = "session:error")]
    SessionError { error: String },

    #[serde(rename = "session:snapshot")]
    SessionSnapshot {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "commitSha")]
        commit_sha: String,
    },
}

impl SessionEvent {
    /// The wire/`event_type` discriminant string, e.g. `"session:status"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionEvent::AgentOutput { .. } => "agent:output",
            SessionEvent::AgentToolUse { .. } => "agent:tool_use",
            SessionEvent::AgentToolResult { .. } => "agent:tool_result",
            SessionEvent::UserMessage { .. } => "user:message",
            SessionEvent::SessionStatus { .. } => "session:status",
            SessionEvent::SessionWaitingForInput { .. } => "session:waiting_for_input",
            SessionEvent::SessionCompleted { .. } => "session:completed",
            SessionEvent::SessionError { .. } => "session:error",
            SessionEvent::SessionSnapshot { .. } => "session:snapshot",
        }
    }

    /// Whether this event kind should be offered to the Notification Dispatcher.
    pub fn is_notifiable(&self) -> bool {
        matches!(
            self,
            SessionEvent::SessionCompleted { .. }
                | SessionEvent::SessionError { .. }
                | SessionEvent::SessionWaitingForInput { .. }
        )
    }

    /// `message_id` carried by a `session:snapshot` event, if this is one.
    pub fn snapshot_message_id(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionSnapshot { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Just the payload (without the `type` tag), for storage as `data` JSON.
    pub fn data_json(&self) -> serde_json::Value {
        let tagged = serde_json::to_value(self).expect("SessionEvent always serializes");
        tagged
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Object(Default::default()))
    }
}

/// One persisted, sequenced occurrence of a `SessionEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: i64,
    pub event: SessionEvent,
}

/// Coarse per-user signal emitted alongside any `session:status` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: String,
}
