//! HTTP handlers for session CRUD and lifecycle operations.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::session::{CreateSessionRequest, Session, SessionRef};

use super::state::AppState;

async fn resolve_ref(state: &AppState, user_id: &str, session_id: &str) -> ApiResult<SessionRef> {
    state
        .sessions
        .get_by_session_id(user_id, session_id)
        .await?
        .map(|s| s.session_ref())
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))
}

pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let repo = state
        .repos
        .get(&body.repo_id)
        .await?
        .ok_or_else(|| ApiError::validation("unknown repoId"))?;
    if repo.owner_user_id != user.user_id {
        return Err(ApiError::Forbidden("repo not owned by user".to_string()));
    }

    let identity_id = body
        .identity_id
        .clone()
        .ok_or_else(|| ApiError::validation("identityId is required"))?;
    let identity = state
        .identities
        .get(&identity_id)
        .await?
        .ok_or_else(|| ApiError::validation("unknown identityId"))?;
    if identity.owner_user_id != user.user_id {
        return Err(ApiError::Forbidden("identity not owned by user".to_string()));
    }

    let branch = body.branch.clone().unwrap_or_else(|| repo.default_branch.clone());
    let session_ref = SessionRef::new(&user.user_id, &body.repo_id, &body.id);

    let session = state
        .sessions
        .create(&body, &session_ref, &identity_id, &repo.repo_url, &branch)
        .await?;

    state.runner.start_session(session_ref, body.prompt.clone());

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list(&user.user_id).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = state
        .sessions
        .get_by_session_id(&user.user_id, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;

    let _ = state.runner.stop_session(&session_ref).await;
    state.messages.delete_for_session(&session_ref).await?;
    state.bus.event_log().remove(&session_ref).await?;
    state.bus.remove(&session_ref);
    state.sessions.delete(&session_ref).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.runner.send_session_message(session_ref, body.message).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.runner.stop_session(&session_ref).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn interrupt_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.runner.interrupt_session(&session_ref).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RevertBody {
    #[serde(rename = "messageId")]
    pub message_id: String,
}

pub async fn revert_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<RevertBody>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.runner.revert_session(&session_ref, &body.message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PinBody {
    pub pinned: bool,
}

pub async fn set_pinned(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<PinBody>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.sessions.set_pinned(&session_ref, body.pinned).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ModelBody {
    pub model: String,
}

pub async fn set_model(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<ModelBody>,
) -> ApiResult<StatusCode> {
    let session_ref = resolve_ref(&state, &user.user_id, &id).await?;
    state.sessions.update_model(&session_ref, &body.model).await?;
    Ok(StatusCode::NO_CONTENT)
}
