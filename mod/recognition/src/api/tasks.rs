use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use vision_core::{ServiceError, new_id, now_rfc3339};

use super::ApiState;
use crate::model::{CreateTaskRequest, Task, TaskListQuery, TaskStatus, UpdateTaskRequest};

pub(crate) fn router() -> Router<ApiState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
}

// ---------------------------------------------------------------------------
// POST /tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(st): State<ApiState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ServiceError> {
    // Tasks are charged against their client, so the client must exist.
    st.clients
        .get(&req.client_id)
        .map_err(|_| ServiceError::Validation(format!("client {} not found", req.client_id)))?;

    let now = now_rfc3339();
    let mut task = Task {
        id: new_id(),
        // Always CREATED: admission is requested later by moving the task
        // to READY_FOR_PROCESSING via PUT.
        status: TaskStatus::Created,
        status_text: String::new(),
        error: String::new(),
        client_id: req.client_id,
        worker_id: String::new(),
        source_images: req.source_images,
        processed_images: Vec::new(),
        recognition_result: None,
        result_flat: None,
        result_unrecognized: None,
        created_at: now.clone(),
        updated_at: now,
    };

    // Post-write hook: the state machine runs on every task write.
    st.machine.create(&mut task)?;

    Ok((StatusCode::CREATED, Json(task)))
}

// ---------------------------------------------------------------------------
// GET /tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(st): State<ApiState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let result = st.tasks.list(&query)?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
    })))
}

// ---------------------------------------------------------------------------
// GET /tasks/:id
// ---------------------------------------------------------------------------

async fn get_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    let task = st.tasks.get(&id)?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// PUT /tasks/:id
// ---------------------------------------------------------------------------

async fn update_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ServiceError> {
    let mut task = st.tasks.get(&id)?;

    // Identity, client, source images and timestamps are immutable here.
    if let Some(status) = req.status {
        task.status = status;
    }
    if let Some(text) = req.status_text {
        task.status_text = text;
    }
    if let Some(images) = req.processed_images {
        task.processed_images = images;
    }
    if let Some(result) = req.recognition_result {
        task.recognition_result = Some(result);
    }

    // Post-write hook: an explicit move to READY_FOR_PROCESSING is admitted
    // (or rejected) by the machine right here.
    st.machine.save(&mut task)?;

    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// DELETE /tasks/:id
// ---------------------------------------------------------------------------

async fn delete_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    st.tasks.delete(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
