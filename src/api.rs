use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use crate::manager::{Manager, ManagerError};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub urls: Vec<String>,
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::Validation(_) => StatusCode::BAD_REQUEST,
            ManagerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::AlreadyStarted
            | ManagerError::Storage(_)
            | ManagerError::Allocation(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(manager: Manager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task))
        .with_state(manager)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_task(
    State(manager): State<Manager>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Response, ManagerError> {
    let task = manager.create_task(req.urls).await?;
    Ok((StatusCode::ACCEPTED, Json(task)).into_response())
}

async fn get_task(State(manager): State<Manager>, Path(id): Path<String>) -> Response {
    match manager.storage().get(&id) {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_tasks(State(manager): State<Manager>) -> Response {
    let mut tasks = manager.storage().list();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Json(tasks).into_response()
}
