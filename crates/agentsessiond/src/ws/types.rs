//! Wire types for the multiplexed WebSocket stream.

use serde::{Deserialize, Serialize};

use crate::event::SessionEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    Auth { token: String },
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "afterSequence")]
        after_sequence: Option<i64>,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum WsServerMessage {
    #[serde(rename = "auth:ok")]
    AuthOk,

    #[serde(rename = "session:event")]
    SessionEvent {
        #[serde(rename = "sessionId")]
        session_id: String,
        event: SessionEvent,
        sequence: i64,
    },

    #[serde(rename = "user:event")]
    UserEvent {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },

    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "lastSequence")]
        last_sequence: i64,
    },
}

/// Close code used when a client fails or times out the auth handshake.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4001;
