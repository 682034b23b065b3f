mod conversations;
mod diagnostics;
mod sessions;
mod stream;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", post(conversations::create_conversation))
        .route("/api/conversations", get(conversations::list_conversations))
        .route("/api/conversations/:id", get(conversations::get_conversation))
        .route("/api/conversations/:id", post(conversations::update_conversation))
        .route("/api/conversations/:id/messages", get(conversations::list_messages))
        .route("/api/conversations/:id/messages", post(conversations::create_message))
        .route("/api/conversations/:id/sessions/latest", get(sessions::latest_session))
        .route("/api/conversations/:id/stream", get(stream::stream_conversation))
        .route("/api/conversations/:id/cancel/:session_id", post(sessions::cancel_session))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/diagnostics/sessions", get(diagnostics::diagnostics_sessions))
        .with_state(state)
}
