use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use session_core::CoreError;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn latest_session(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .store
        .latest_session(&conversation_id)
        .await?
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("no sessions for {conversation_id}"))))?;

    // Events aren't keyed by conversation directly in the session row, so
    // surface the session's own transition history via the live FSM when
    // it's still registered; terminal/evicted sessions report an empty list.
    let events = state
        .registry
        .get(&session.id)
        .map(|fsm| fsm.history())
        .unwrap_or_default();

    Ok(Json(json!({ "session": session, "events": events })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get_session(&id).await? {
        Some(session) => Ok(Json(json!({ "session": session }))),
        None => Err(ApiError(CoreError::NotFound(format!("session {id}")))),
    }
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path((_conversation_id, session_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.cancel(&session_id)?;
    Ok(Json(json!({ "cancelled": true })))
}
