use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::{Stream, StreamExt};

use vision_core::ServiceError;

use super::ApiState;
use crate::model::{FailRequest, FinishRequest, Queue, ReportRequest, ReserveRequest};

pub(crate) fn router() -> Router<ApiState> {
    Router::new()
        .route("/queues/{queue}/subscribe", get(subscribe))
        .route("/tasks/{id}/@reserve", post(reserve_task))
        .route("/tasks/{id}/@report", post(report_status))
        .route("/tasks/{id}/@finish", post(finish_task))
        .route("/tasks/{id}/@fail", post(fail_task))
}

// ---------------------------------------------------------------------------
// GET /queues/:queue/subscribe
// ---------------------------------------------------------------------------

/// Stream pending-task ids for one queue as server-sent events.
///
/// Existing pending tasks arrive first, then live announcements. When the
/// worker disconnects, dropping the stream unregisters the subscriber.
async fn subscribe(
    State(st): State<ApiState>,
    Path(queue): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let queue = Queue::from_path(&queue)
        .ok_or_else(|| ServiceError::Validation(format!("unknown queue: {queue}")))?;

    let feed = st.coordination.subscribe(queue)?;
    let stream = feed.map(|task_id| Ok(Event::default().event("task").data(task_id)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

// ---------------------------------------------------------------------------
// POST /tasks/:id/@reserve
// ---------------------------------------------------------------------------

async fn reserve_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    st.coordination.reserve(&id, &req.worker_id)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// POST /tasks/:id/@report
// ---------------------------------------------------------------------------

async fn report_status(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    st.coordination.report(&id, &req.status_text)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// POST /tasks/:id/@finish
// ---------------------------------------------------------------------------

async fn finish_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<FinishRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    st.coordination
        .finish(&id, req.processed_images, req.recognition_result)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// POST /tasks/:id/@fail
// ---------------------------------------------------------------------------

async fn fail_task(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    st.coordination.fail(&id, &req.error)?;
    Ok(Json(serde_json::json!({ "success": true })))
}
