//! Multiplexed WebSocket endpoint: an in-band auth handshake followed by
//! any number of `subscribe`/`unsubscribe` commands, each driving its own
//! replay-then-live forwarding task.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;

use crate::session::SessionRef;

use super::types::{WsCommand, WsServerMessage, AUTH_FAILURE_CLOSE_CODE};
use crate::api::AppState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOX_CAPACITY: usize = 256;

/// `GET /api/ws`. Bypasses `auth_middleware`: authentication happens as the
/// first in-band message instead of a bearer header, per the handshake.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let user_id = match authenticate(&mut socket, &state).await {
        Some(user_id) => user_id,
        None => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: AUTH_FAILURE_CLOSE_CODE,
                    reason: "auth failed".into(),
                })))
                .await;
            return;
        }
    };

    if send_json(&mut socket, &WsServerMessage::AuthOk).await.is_err() {
        return;
    }

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<WsServerMessage>(OUTBOX_CAPACITY);
    let mut subscriptions: HashMap<String, CancellationToken> = HashMap::new();

    spawn_user_events(state.clone(), user_id.clone(), outbox_tx.clone());

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => {
                let Some(msg) = outgoing else { break };
                if send_json(&mut socket, &msg).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                let Ok(incoming) = incoming else { break };
                match incoming {
                    Message::Text(text) => {
                        let Ok(command) = serde_json::from_str::<WsCommand>(&text) else { continue };
                        handle_command(command, &state, &user_id, &outbox_tx, &mut subscriptions);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for token in subscriptions.into_values() {
        token.cancel();
    }
}

async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Option<String> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await.ok()??.ok()?;
    let Message::Text(text) = first else { return None };
    let WsCommand::Auth { token } = serde_json::from_str::<WsCommand>(&text).ok()? else {
        return None;
    };
    state.auth.validate_token(&token).ok().map(|claims| claims.sub)
}

fn handle_command(
    command: WsCommand,
    state: &AppState,
    user_id: &str,
    outbox: &mpsc::Sender<WsServerMessage>,
    subscriptions: &mut HashMap<String, CancellationToken>,
) {
    match command {
        WsCommand::Auth { .. } => {}
        WsCommand::Subscribe { session_id, after_sequence } => {
            if let Some(previous) = subscriptions.remove(&session_id) {
                previous.cancel();
            }
            let token = CancellationToken::new();
            subscriptions.insert(session_id.clone(), token.clone());
            spawn_subscription(
                state.clone(),
                user_id.to_string(),
                session_id,
                after_sequence,
                outbox.clone(),
                token,
            );
        }
        WsCommand::Unsubscribe { session_id } => {
            if let Some(token) = subscriptions.remove(&session_id) {
                token.cancel();
            }
        }
    }
}

/// Resolves ownership, then performs the same replay-then-live sequence as
/// the SSE endpoint, framing each event as `session:event` and finishing
/// the backlog with a `sync` frame. Silently exits if the session isn't
/// owned by `user_id`.
fn spawn_subscription(
    state: AppState,
    user_id: String,
    session_id: String,
    after_sequence: Option<i64>,
    outbox: mpsc::Sender<WsServerMessage>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let Ok(Some(session)) = state.sessions.get_by_session_id(&user_id, &session_id).await else {
            return;
        };
        let session_ref: SessionRef = session.session_ref();

        let Ok((rx, history, last_sequence)) =
            state.bus.subscribe_with_replay(&session_ref, after_sequence).await
        else {
            return;
        };

        for envelope in history {
            if outbox
                .send(WsServerMessage::SessionEvent {
                    session_id: session_id.clone(),
                    event: envelope.event,
                    sequence: envelope.sequence,
                })
                .await
                .is_err()
            {
                return;
            }
        }

        if outbox
            .send(WsServerMessage::Sync {
                session_id: session_id.clone(),
                last_sequence,
            })
            .await
            .is_err()
        {
            return;
        }

        let mut live = BroadcastStream::new(rx);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = live.next() => {
                    let Some(item) = next else { break };
                    let envelope = match item {
                        Ok(envelope) if envelope.sequence > last_sequence => envelope,
                        Ok(_) => continue,
                        Err(BroadcastStreamRecvError::Lagged(_)) => continue,
                    };
                    if outbox
                        .send(WsServerMessage::SessionEvent {
                            session_id: session_id.clone(),
                            event: envelope.event,
                            sequence: envelope.sequence,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });
}

/// Forwards per-user events (coarse session-status changes) for the life of
/// the connection. Exits once `outbox` has no more live receivers, which
/// happens when `handle_socket`'s main loop returns and drops `outbox_rx`.
fn spawn_user_events(state: AppState, user_id: String, outbox: mpsc::Sender<WsServerMessage>) {
    tokio::spawn(async move {
        let rx = state.bus.subscribe_user(&user_id);
        let mut events = BroadcastStream::new(rx);
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(_)) => continue,
            };
            if outbox
                .send(WsServerMessage::UserEvent {
                    session_id: event.session_id,
                    status: event.status,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

async fn send_json(socket: &mut WebSocket, msg: &WsServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("WsServerMessage always serializes");
    socket.send(Message::Text(text.into())).await
}
