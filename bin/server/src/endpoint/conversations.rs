use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use session_core::{ConversationPatch, ConversationSource, FolderContext, NewConversation};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    pub agent_id: String,
    pub title: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .store
        .create_conversation(NewConversation {
            agent_id: body.agent_id,
            title: body.title,
            source: ConversationSource::Gui,
            external_id: None,
            project_path: None,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "conversation": conversation }))))
}

pub async fn list_conversations(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.store.list_conversations().await?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get_conversation(&id).await? {
        Some(conversation) => Ok(Json(json!({ "conversation": conversation }))),
        None => Err(ApiError(session_core::CoreError::NotFound(format!(
            "conversation {id}"
        )))),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversationBody {
    pub title: Option<String>,
    pub status: Option<String>,
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let status = body
        .status
        .as_deref()
        .map(session_core::ConversationStatus::parse);
    let conversation = state
        .store
        .update_conversation(
            &id,
            ConversationPatch {
                title: body.title,
                status,
            },
        )
        .await?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.store.list_messages(&id, 1000, 0).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageBody {
    pub content: String,
    pub agent_id: String,
    pub folder_context: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateMessageResponse {
    message: session_core::Message,
    session: session_core::Session,
    idempotency_key: Option<String>,
}

pub async fn create_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .dispatcher
        .dispatch(session_core::DispatchRequest {
            conversation_id: id,
            user_message_content: body.content,
            agent_id: body.agent_id,
            idempotency_key: body.idempotency_key.clone(),
            folder_context: FolderContext {
                path: body.folder_context,
            },
        })
        .await?;

    let message = state
        .store
        .get_message(&handle.session.user_message_id)
        .await?
        .ok_or_else(|| {
            ApiError(session_core::CoreError::NotFound("message vanished".into()))
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMessageResponse {
            message,
            session: handle.session,
            idempotency_key: body.idempotency_key,
        }),
    ))
}
