use std::sync::Arc;

use vision_core::{ListResult, ServiceError};
use vision_sql::{Row, SQLStore, Value};

use crate::model::{Client, Task, TaskListQuery, TaskStatus};

/// SQL schema for the tasks table.
const TASK_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    status      TEXT NOT NULL,
    client_id   TEXT NOT NULL,
    create_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_task_client ON tasks(client_id);
CREATE INDEX IF NOT EXISTS idx_task_create_at ON tasks(create_at);
";

/// SQL schema for the clients table.
const CLIENT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    create_at   TEXT NOT NULL
);
";

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Persistent storage for tasks, backed by SQLStore (SQLite).
pub struct TaskStore {
    db: Arc<dyn SQLStore>,
}

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        for stmt in TASK_SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            db.exec(stmt, &[])
                .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        }
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert a new task.
    pub fn create(&self, task: &Task) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO tasks (id, data, status, client_id, create_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.client_id.clone()),
                    Value::Text(task.created_at.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;

        row_to_task(row)
    }

    /// Update a task (full replacement of the data column + indexed columns).
    pub fn update(&self, task: &Task) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE tasks SET data = ?1, status = ?2 WHERE id = ?3",
                &[
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.id.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Persist a task row and its client row inside one transaction.
    ///
    /// The quota deduction and the status transition that consumed it must
    /// never be observable apart, so both updates land atomically. The
    /// clients UPDATE is issued here rather than through [`ClientStore`]
    /// because the two writes share the transaction.
    pub fn save_with_client(&self, task: &Task, client: &Client) -> Result<(), ServiceError> {
        let task_data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let client_data =
            serde_json::to_string(client).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let task_params = [
            Value::Text(task_data),
            Value::Text(task.status.as_str().to_string()),
            Value::Text(task.id.clone()),
        ];
        let client_params = [Value::Text(client_data), Value::Text(client.id.clone())];

        self.db
            .exec_batch(&[
                (
                    "UPDATE tasks SET data = ?1, status = ?2 WHERE id = ?3",
                    task_params.as_slice(),
                ),
                (
                    "UPDATE clients SET data = ?1 WHERE id = ?2",
                    client_params.as_slice(),
                ),
            ])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Delete a task by ID.
    pub fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // List / Query
    // -----------------------------------------------------------------------

    /// List tasks with optional filters.
    pub fn list(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut idx = 1;

        if let Some(ref s) = query.status {
            let status = TaskStatus::from_str(s)
                .ok_or_else(|| ServiceError::Validation(format!("unknown status: {s}")))?;
            where_clauses.push(format!("status = ?{idx}"));
            params.push(Value::Text(status.as_str().to_string()));
            idx += 1;
        }
        if let Some(ref c) = query.client_id {
            where_clauses.push(format!("client_id = ?{idx}"));
            params.push(Value::Text(c.clone()));
            idx += 1;
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        // Count total
        let count_sql = format!("SELECT COUNT(*) as cnt FROM tasks {where_sql}");
        let count_rows = self
            .db
            .query(&count_sql, &params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        // Fetch page
        let select_sql = format!(
            "SELECT data FROM tasks {where_sql} ORDER BY create_at DESC LIMIT ?{idx} OFFSET ?{}",
            idx + 1
        );
        let mut select_params = params;
        select_params.push(Value::Integer(limit as i64));
        select_params.push(Value::Integer(offset as i64));

        let rows = self
            .db
            .query(&select_sql, &select_params)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let items = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }

    // -----------------------------------------------------------------------
    // State machine helpers
    // -----------------------------------------------------------------------

    /// Fetch all tasks in the given status, oldest first.
    ///
    /// Used for the subscribe backlog (pending statuses) and the timeout
    /// watchdog (processing statuses).
    pub fn with_status(&self, status: TaskStatus) -> Result<Vec<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM tasks WHERE status = ?1 ORDER BY create_at ASC",
                &[Value::Text(status.as_str().to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }
}

/// Deserialize a Task from a row's `data` JSON column.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad task json: {e}")))
}

// ---------------------------------------------------------------------------
// ClientStore
// ---------------------------------------------------------------------------

/// Persistent storage for quota-holding clients.
pub struct ClientStore {
    db: Arc<dyn SQLStore>,
}

impl ClientStore {
    /// Create a new ClientStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        for stmt in CLIENT_SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            db.exec(stmt, &[])
                .map_err(|e| ServiceError::Storage(format!("client schema init: {e}")))?;
        }
        Ok(Self { db })
    }

    /// Insert a new client.
    pub fn create(&self, client: &Client) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(client).map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO clients (id, data, create_at) VALUES (?1, ?2, ?3)",
                &[
                    Value::Text(client.id.clone()),
                    Value::Text(data),
                    Value::Text(client.created_at.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Result<Client, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM clients WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("client {id}")))?;

        row_to_client(row)
    }

    /// Update a client (full replacement of the data column).
    pub fn update(&self, client: &Client) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(client).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE clients SET data = ?1 WHERE id = ?2",
                &[Value::Text(data), Value::Text(client.id.clone())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("client {}", client.id)));
        }
        Ok(())
    }
}

/// Deserialize a Client from a row's `data` JSON column.
fn row_to_client(row: &Row) -> Result<Client, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad client json: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vision_core::now_rfc3339;
    use vision_sql::SqliteStore;

    fn test_db() -> Arc<dyn SQLStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    fn test_stores() -> (TaskStore, ClientStore) {
        let db = test_db();
        (
            TaskStore::new(Arc::clone(&db)).unwrap(),
            ClientStore::new(db).unwrap(),
        )
    }

    fn make_task(id: &str, client_id: &str, status: TaskStatus) -> Task {
        let now = now_rfc3339();
        Task {
            id: id.into(),
            status,
            status_text: String::new(),
            error: String::new(),
            client_id: client_id.into(),
            worker_id: String::new(),
            source_images: vec!["a.jpg".into()],
            processed_images: Vec::new(),
            recognition_result: None,
            result_flat: None,
            result_unrecognized: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn make_client(id: &str, quota: i64) -> Client {
        let now = now_rfc3339();
        Client {
            id: id.into(),
            name: "Test Client".into(),
            quota,
            total_quota: quota,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn create_and_get() {
        let (tasks, _) = test_stores();
        let task = make_task("t1", "c1", TaskStatus::Created);
        tasks.create(&task).unwrap();

        let got = tasks.get("t1").unwrap();
        assert_eq!(got.id, "t1");
        assert_eq!(got.status, TaskStatus::Created);
        assert_eq!(got.client_id, "c1");
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (tasks, _) = test_stores();
        match tasks.get("missing") {
            Err(ServiceError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn update_status() {
        let (tasks, _) = test_stores();
        let mut task = make_task("t2", "c1", TaskStatus::Created);
        tasks.create(&task).unwrap();

        task.status = TaskStatus::ReadyForProcessing;
        tasks.update(&task).unwrap();

        let got = tasks.get("t2").unwrap();
        assert_eq!(got.status, TaskStatus::ReadyForProcessing);
    }

    #[test]
    fn delete_task() {
        let (tasks, _) = test_stores();
        tasks.create(&make_task("t3", "c1", TaskStatus::Created)).unwrap();
        tasks.delete("t3").unwrap();
        assert!(tasks.get("t3").is_err());
    }

    #[test]
    fn list_with_filter() {
        let (tasks, _) = test_stores();
        tasks.create(&make_task("a1", "c1", TaskStatus::ImagesPending)).unwrap();
        tasks.create(&make_task("a2", "c1", TaskStatus::Created)).unwrap();
        tasks.create(&make_task("b1", "c2", TaskStatus::ImagesPending)).unwrap();

        let result = tasks
            .list(&TaskListQuery {
                status: Some("IMAGES_PENDING".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 2);

        let result = tasks
            .list(&TaskListQuery {
                client_id: Some("c1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 2);

        let result = tasks
            .list(&TaskListQuery {
                status: Some("IMAGES_PENDING".into()),
                client_id: Some("c2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].id, "b1");
    }

    #[test]
    fn list_rejects_unknown_status() {
        let (tasks, _) = test_stores();
        let result = tasks.list(&TaskListQuery {
            status: Some("NOT_A_STATUS".into()),
            ..Default::default()
        });
        match result {
            Err(ServiceError::Validation(_)) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn with_status_oldest_first() {
        let (tasks, _) = test_stores();
        let mut older = make_task("old", "c1", TaskStatus::ImagesPending);
        older.created_at = "2026-01-01T00:00:00Z".into();
        let mut newer = make_task("new", "c1", TaskStatus::ImagesPending);
        newer.created_at = "2026-01-02T00:00:00Z".into();

        tasks.create(&newer).unwrap();
        tasks.create(&older).unwrap();
        tasks.create(&make_task("other", "c1", TaskStatus::Created)).unwrap();

        let pending = tasks.with_status(TaskStatus::ImagesPending).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "old");
        assert_eq!(pending[1].id, "new");
    }

    #[test]
    fn save_with_client_updates_both() {
        let (tasks, clients) = test_stores();
        let mut task = make_task("t1", "c1", TaskStatus::ReadyForProcessing);
        let mut client = make_client("c1", 100);
        tasks.create(&task).unwrap();
        clients.create(&client).unwrap();

        task.status = TaskStatus::ImagesPending;
        client.quota = 98;
        tasks.save_with_client(&task, &client).unwrap();

        assert_eq!(tasks.get("t1").unwrap().status, TaskStatus::ImagesPending);
        assert_eq!(clients.get("c1").unwrap().quota, 98);
    }

    #[test]
    fn client_crud() {
        let (_, clients) = test_stores();
        let mut client = make_client("c1", 50);
        clients.create(&client).unwrap();

        let got = clients.get("c1").unwrap();
        assert_eq!(got.quota, 50);
        assert_eq!(got.name, "Test Client");

        client.quota = -3;
        clients.update(&client).unwrap();
        assert_eq!(clients.get("c1").unwrap().quota, -3);

        assert!(clients.get("c2").is_err());
    }
}
