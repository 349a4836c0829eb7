//! SSE streaming endpoints: per-session event replay-then-live, and the
//! coarse per-user event feed.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::auth::CurrentUser;
use crate::error::ApiError;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AfterQuery {
    pub after: Option<i64>,
}

/// `GET /api/sessions/{id}/events?after=N`
pub async fn session_events(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<AfterQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .sessions
        .get_by_session_id(&user.user_id, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    let session_ref = session.session_ref();

    let (rx, history, last_sequence) = state
        .bus
        .subscribe_with_replay(&session_ref, query.after)
        .await?;

    let backlog = stream::iter(history.into_iter().filter_map(|envelope| {
        Some(Ok(Event::default()
            .id(envelope.sequence.to_string())
            .event(envelope.event.type_name())
            .json_data(&envelope.event)
            .ok()?))
    }));

    let sync = stream::once(async move {
        Ok(Event::default()
            .event("sync")
            .json_data(serde_json::json!({ "lastSequence": last_sequence }))
            .expect("sync payload always serializes"))
    });

    let live = BroadcastStream::new(rx).filter_map(move |item| {
        let last_sequence = last_sequence;
        async move {
            match item {
                Ok(envelope) if envelope.sequence > last_sequence => Some(Ok(Event::default()
                    .id(envelope.sequence.to_string())
                    .event(envelope.event.type_name())
                    .json_data(&envelope.event)
                    .expect("event always serializes"))),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(_)) => None,
            }
        }
    });

    let stream = backlog.chain(sync).chain(live);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// `GET /api/events` — coarse per-user stream, no history.
pub async fn user_events(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe_user(&user.user_id);
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(Event::default()
                .event("user:event")
                .json_data(&event)
                .expect("user event always serializes"))),
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
