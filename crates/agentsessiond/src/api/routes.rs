//! Route table: session CRUD/lifecycle under bearer auth, plus the
//! WebSocket upgrade which authenticates in-band instead.

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;

use crate::auth::auth_middleware;
use crate::ws::ws_handler;

use super::handlers::{
    create_session, delete_session, get_session, interrupt_session, list_sessions, revert_session,
    send_message, set_model, set_pinned, stop_session,
};
use super::sse::{session_events, user_events};
use super::state::AppState;

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/messages", post(send_message))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/interrupt", post(interrupt_session))
        .route("/sessions/{id}/revert", post(revert_session))
        .route("/sessions/{id}/pin", put(set_pinned))
        .route("/sessions/{id}/model", put(set_model))
        .route("/sessions/{id}/events", get(session_events))
        .route("/events", get(user_events))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), auth_middleware));

    // `/api/ws` sits outside the bearer-auth layer: the WebSocket handshake
    // authenticates in-band instead.
    let api = authenticated.route("/ws", get(ws_handler));

    Router::new().nest("/api", api).with_state(state)
}
