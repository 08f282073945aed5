use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use vision_core::{ServiceError, new_id, now_rfc3339};

use super::ApiState;
use crate::model::{Client, CreateClientRequest, UpdateClientRequest};

pub(crate) fn router() -> Router<ApiState> {
    Router::new()
        .route("/clients", post(create_client))
        .route("/clients/{id}", get(get_client).put(update_client))
}

// ---------------------------------------------------------------------------
// POST /clients
// ---------------------------------------------------------------------------

async fn create_client(
    State(st): State<ApiState>,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<Client>), ServiceError> {
    if req.name.is_empty() {
        return Err(ServiceError::Validation("name is required".into()));
    }
    if req.quota < 0 || req.total_quota < 0 {
        return Err(ServiceError::Validation(
            "quota and totalQuota must not be negative".into(),
        ));
    }

    let now = now_rfc3339();
    let client = Client {
        id: new_id(),
        name: req.name,
        quota: req.quota,
        total_quota: req.total_quota,
        created_at: now.clone(),
        updated_at: now,
    };
    st.clients.create(&client)?;

    Ok((StatusCode::CREATED, Json(client)))
}

// ---------------------------------------------------------------------------
// GET /clients/:id
// ---------------------------------------------------------------------------

async fn get_client(
    State(st): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Client>, ServiceError> {
    let client = st.clients.get(&id)?;
    Ok(Json(client))
}

// ---------------------------------------------------------------------------
// PUT /clients/:id
// ---------------------------------------------------------------------------

async fn update_client(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateClientRequest>,
) -> Result<Json<Client>, ServiceError> {
    let mut client = st.clients.get(&id)?;

    if let Some(name) = req.name {
        client.name = name;
    }
    if let Some(quota) = req.quota {
        client.quota = quota;
    }
    if let Some(total_quota) = req.total_quota {
        client.total_quota = total_quota;
    }
    client.updated_at = now_rfc3339();
    st.clients.update(&client)?;

    Ok(Json(client))
}
