mod clients;
mod tasks;
mod workers;

use std::sync::Arc;

use axum::Router;

use crate::coordination::CoordinationService;
use crate::machine::StateMachine;
use crate::store::{ClientStore, TaskStore};

/// Shared state for all recognition module handlers.
#[derive(Clone)]
pub(crate) struct ApiState {
    pub tasks: Arc<TaskStore>,
    pub clients: Arc<ClientStore>,
    pub machine: Arc<StateMachine>,
    pub coordination: Arc<CoordinationService>,
}

/// Build the complete recognition module router.
///
/// Routes:
/// - `POST   /tasks`               — create task
/// - `GET    /tasks`               — list tasks
/// - `GET    /tasks/{id}`          — get task
/// - `PUT    /tasks/{id}`          — update task (incl. explicit status moves)
/// - `DELETE /tasks/{id}`          — delete task
/// - `POST   /clients`             — create client
/// - `GET    /clients/{id}`        — get client
/// - `PUT    /clients/{id}`        — update client / adjust quota
/// - `GET    /queues/{queue}/subscribe` — worker subscription stream (SSE)
/// - `POST   /tasks/{id}/@reserve` — worker reserves a task
/// - `POST   /tasks/{id}/@report`  — worker progress report
/// - `POST   /tasks/{id}/@finish`  — worker stage completion
/// - `POST   /tasks/{id}/@fail`    — worker failure report
pub(crate) fn router(state: ApiState) -> Router {
    Router::new()
        .merge(tasks::router())
        .merge(clients::router())
        .merge(workers::router())
        .with_state(state)
}
