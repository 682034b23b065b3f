use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn diagnostics_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.diagnostics();
    Json(json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "activeSessions": snapshot.active_count,
        "terminalSessions": snapshot.terminal_count,
        "total": snapshot.total,
        "active": snapshot.active,
        "recentTerminal": snapshot.recent_terminal,
    }))
}
