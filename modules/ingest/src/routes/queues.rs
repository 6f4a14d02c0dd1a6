//! Queue inspection and dead-letter redrive

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use event_bus::{DeadLetter, QueueDepth, QueueError};
use serde::Serialize;
use uuid::Uuid;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct DepthResponse {
    pub queue: String,
    #[serde(flatten)]
    pub depth: QueueDepth,
}

/// Dead letter as shown to operators
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub message_id: Uuid,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub receive_count: u32,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub body: String,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(letter: DeadLetter) -> Self {
        let envelope = letter.message.envelope().ok();
        Self {
            message_id: letter.message.message_id,
            event_id: envelope.as_ref().map(|e| e.event_id.clone()),
            event_type: envelope.map(|e| e.event_type),
            receive_count: letter.message.receive_count,
            reason: letter.reason,
            enqueued_at: letter.message.enqueued_at,
            dead_lettered_at: letter.dead_lettered_at,
            body: String::from_utf8_lossy(&letter.message.body).into_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub queue: String,
    pub dead_letters: Vec<DeadLetterView>,
}

#[derive(Debug, Serialize)]
pub struct RedriveResponse {
    pub queue: String,
    pub message_id: Uuid,
    pub redriven: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn unknown_queue(name: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown queue '{}'", name),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match err {
            QueueError::UnknownMessage(_) | QueueError::NotDeadLettered(_) => StatusCode::NOT_FOUND,
            QueueError::NotLeased(_) => StatusCode::CONFLICT,
            QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Handler for GET /api/queues/{queue}/depth
pub async fn get_depth(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<DepthResponse>, ApiError> {
    let q = state.queue(&queue).ok_or_else(|| ApiError::unknown_queue(&queue))?;
    let depth = q.depth().await?;
    Ok(Json(DepthResponse { queue, depth }))
}

/// Handler for GET /api/queues/{queue}/dead-letters
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<DeadLettersResponse>, ApiError> {
    let q = state.queue(&queue).ok_or_else(|| ApiError::unknown_queue(&queue))?;
    let dead_letters = q
        .dead_letters()
        .await?
        .into_iter()
        .map(DeadLetterView::from)
        .collect();
    Ok(Json(DeadLettersResponse {
        queue,
        dead_letters,
    }))
}

/// Handler for POST /api/queues/{queue}/dead-letters/{message_id}/redrive
///
/// Moves the message back to the live queue with its receive count reset.
pub async fn redrive(
    State(state): State<AppState>,
    Path((queue, message_id)): Path<(String, Uuid)>,
) -> Result<Json<RedriveResponse>, ApiError> {
    let q = state.queue(&queue).ok_or_else(|| ApiError::unknown_queue(&queue))?;
    q.redrive(message_id).await?;

    tracing::info!(queue = %queue, message_id = %message_id, "Dead letter redriven by operator");
    Ok(Json(RedriveResponse {
        queue,
        message_id,
        redriven: true,
    }))
}
