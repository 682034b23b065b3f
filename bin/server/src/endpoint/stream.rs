use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET {base}/conversations/{id}/stream` — subscribes to the conversation's
/// fan-out channel and replays the reconnect-resumption state first.
///
/// Subscribes before computing the resume classification: if an event (e.g.
/// the terminal `session_updated` for a session that was still `processing`)
/// publishes in between, the live stream below still carries it rather than
/// losing it in the window between `resume()` and `subscribe()`.
pub async fn stream_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let receiver = state.sync_hub.subscribe(&id);
    let resume = state.sync_hub.resume(&state.store, &id).await?;
    let resume_event = Event::default()
        .event("resume")
        .json_data(json!({ "resume": resume }))
        .unwrap_or_else(|_| Event::default().data("{}"));

    let live = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("{}")))),
            // Lagged: a subscriber's buffer overflowed and the hub dropped the
            // oldest `stream` events — the client sees a gap marker rather
            // than a hard disconnect.
            Err(_lagged) => Some(Ok(Event::default().event("lagged").data("{}"))),
        }
    });

    let combined = stream::once(async move { Ok(resume_event) }).chain(live);
    Ok(Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
