//! Thin HTTP surface over the orchestrator.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use parley_core::conversation::{Conversation, Role};
use parley_core::ids::ConversationId;

use crate::error::OrchestratorError;
use crate::orchestrator::{
    AttachmentUpload, ConversationUpdate, NewConversation, NewMessage, DEFAULT_LIST_LIMIT,
};
use crate::server::AppState;

/// Maps domain errors onto HTTP status codes.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Agent(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, status = status.as_u16(), "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
    #[serde(default)]
    pub process: bool,
}

#[derive(Debug, Deserialize)]
pub struct SourceSearch {
    pub source_name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<NewConversation>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conversation = state.system.orchestrator.create(body).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Conversation>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);
    Ok(Json(state.system.orchestrator.list(limit, offset).await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Conversation> {
    let id = ConversationId::from_raw(id);
    Ok(Json(state.system.orchestrator.get(&id).await?))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConversationUpdate>,
) -> ApiResult<Conversation> {
    let id = ConversationId::from_raw(id);
    Ok(Json(state.system.orchestrator.update(&id, body).await?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let id = ConversationId::from_raw(id);
    state.system.orchestrator.delete(&id).await?;
    Ok(Json(json!({ "status": "success" })))
}

pub async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AppendMessageRequest>,
) -> ApiResult<Conversation> {
    let id = ConversationId::from_raw(id);
    let message = NewMessage {
        role: body.role,
        content: body.content,
        attachments: body.attachments,
    };
    Ok(Json(
        state
            .system
            .orchestrator
            .append_message(&id, message, body.process)
            .await?,
    ))
}

pub async fn process_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Conversation> {
    let id = ConversationId::from_raw(id);
    Ok(Json(state.system.orchestrator.process_existing(&id).await?))
}

pub async fn search_by_attributes(
    State(state): State<AppState>,
    Json(filter): Json<Map<String, Value>>,
) -> ApiResult<Vec<Conversation>> {
    Ok(Json(state.system.orchestrator.find_by_attributes(filter).await?))
}

pub async fn search_by_source(
    State(state): State<AppState>,
    Json(body): Json<SourceSearch>,
) -> ApiResult<Vec<Conversation>> {
    Ok(Json(
        state
            .system
            .orchestrator
            .find_by_source(&body.source_name, body.properties)
            .await?,
    ))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.system.health().await;
    let status = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
