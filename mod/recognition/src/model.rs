use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a recognition task.
///
/// ```text
/// CREATED → READY_FOR_PROCESSING → IMAGES_PENDING → IMAGES_PROCESSING
///             │                                        │
///             │ (no images / no quota)                 │ (timeout / worker failure)
///             ▼                                        ▼
///         IMAGES_FAILED_*                          IMAGES_FAILED_*
///
/// IMAGES_PROCESSING → IMAGES_COMPLETED → RECOGNITION_PENDING
///                       │ (no quota)
///                       ▼
///                   RECOGNITION_FAILED_QUOTA
///
/// RECOGNITION_PENDING → RECOGNITION_PROCESSING → RECOGNITION_COMPLETED
///                         │ (timeout / worker failure)      │ (flatten result)
///                         ▼                                 ▼
///                     RECOGNITION_FAILED_*          PROCESSING_COMPLETED
/// ```
///
/// `CREATED` waits for an explicit external move to `READY_FOR_PROCESSING`;
/// everything after that is driven by the state machine and worker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    ReadyForProcessing,
    ImagesPending,
    ImagesProcessing,
    ImagesCompleted,
    ImagesFailedQuota,
    ImagesFailedTimeout,
    ImagesFailedProcessing,
    RecognitionPending,
    RecognitionProcessing,
    RecognitionCompleted,
    RecognitionFailedQuota,
    RecognitionFailedTimeout,
    RecognitionFailedProcessing,
    ProcessingCompleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ReadyForProcessing => "READY_FOR_PROCESSING",
            Self::ImagesPending => "IMAGES_PENDING",
            Self::ImagesProcessing => "IMAGES_PROCESSING",
            Self::ImagesCompleted => "IMAGES_COMPLETED",
            Self::ImagesFailedQuota => "IMAGES_FAILED_QUOTA",
            Self::ImagesFailedTimeout => "IMAGES_FAILED_TIMEOUT",
            Self::ImagesFailedProcessing => "IMAGES_FAILED_PROCESSING",
            Self::RecognitionPending => "RECOGNITION_PENDING",
            Self::RecognitionProcessing => "RECOGNITION_PROCESSING",
            Self::RecognitionCompleted => "RECOGNITION_COMPLETED",
            Self::RecognitionFailedQuota => "RECOGNITION_FAILED_QUOTA",
            Self::RecognitionFailedTimeout => "RECOGNITION_FAILED_TIMEOUT",
            Self::RecognitionFailedProcessing => "RECOGNITION_FAILED_PROCESSING",
            Self::ProcessingCompleted => "PROCESSING_COMPLETED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "READY_FOR_PROCESSING" => Some(Self::ReadyForProcessing),
            "IMAGES_PENDING" => Some(Self::ImagesPending),
            "IMAGES_PROCESSING" => Some(Self::ImagesProcessing),
            "IMAGES_COMPLETED" => Some(Self::ImagesCompleted),
            "IMAGES_FAILED_QUOTA" => Some(Self::ImagesFailedQuota),
            "IMAGES_FAILED_TIMEOUT" => Some(Self::ImagesFailedTimeout),
            "IMAGES_FAILED_PROCESSING" => Some(Self::ImagesFailedProcessing),
            "RECOGNITION_PENDING" => Some(Self::RecognitionPending),
            "RECOGNITION_PROCESSING" => Some(Self::RecognitionProcessing),
            "RECOGNITION_COMPLETED" => Some(Self::RecognitionCompleted),
            "RECOGNITION_FAILED_QUOTA" => Some(Self::RecognitionFailedQuota),
            "RECOGNITION_FAILED_TIMEOUT" => Some(Self::RecognitionFailedTimeout),
            "RECOGNITION_FAILED_PROCESSING" => Some(Self::RecognitionFailedProcessing),
            "PROCESSING_COMPLETED" => Some(Self::ProcessingCompleted),
            _ => None,
        }
    }

    /// Whether the task has reached a terminal state.
    ///
    /// The state machine never transitions a terminal task again, and the
    /// coordination calls treat terminal tasks as safe no-ops.
    /// `RECOGNITION_COMPLETED` is deliberately NOT terminal: the machine
    /// still has to flatten its result into `PROCESSING_COMPLETED`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ImagesFailedQuota
                | Self::ImagesFailedTimeout
                | Self::ImagesFailedProcessing
                | Self::RecognitionFailedQuota
                | Self::RecognitionFailedTimeout
                | Self::RecognitionFailedProcessing
                | Self::ProcessingCompleted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// One of the two logical worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Queue {
    ImageProcessing,
    Recognition,
}

impl Queue {
    /// The pending status whose tasks this queue's workers consume.
    pub fn pending_status(&self) -> TaskStatus {
        match self {
            Self::ImageProcessing => TaskStatus::ImagesPending,
            Self::Recognition => TaskStatus::RecognitionPending,
        }
    }

    /// Parse the URL path form of a queue name.
    pub fn from_path(s: &str) -> Option<Self> {
        match s {
            "image-processing" => Some(Self::ImageProcessing),
            "recognition" => Some(Self::Recognition),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Recognition result tree
// ---------------------------------------------------------------------------

/// A node in the worker-supplied recognition result tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaves: Vec<TreeNode>,
}

/// A flattened tree node — the client-facing result representation.
///
/// One flat node per tree node; the root carries an empty `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatNode {
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub label: String,
}

// ---------------------------------------------------------------------------
// Task — the core data model, maps 1:1 to the tasks table
// ---------------------------------------------------------------------------

/// A single recognition task tracked by the module.
///
/// Serialized as the `data` JSON column; `status` and `client_id` are
/// duplicated into indexed columns for filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    // --- execution state ---
    pub status: TaskStatus,
    /// Human-readable progress message from the worker. No semantic effect.
    #[serde(default)]
    pub status_text: String,
    /// Failure reason (set on failure transitions, empty otherwise).
    #[serde(default)]
    pub error: String,

    // --- ownership ---
    pub client_id: String,
    /// Identity of the worker that reserved this task.
    #[serde(default)]
    pub worker_id: String,

    // --- payload ---
    /// Image identifiers supplied at creation. Immutable once set.
    #[serde(default)]
    pub source_images: Vec<String>,
    /// Filled in by workers; completion test is length == source_images.
    #[serde(default)]
    pub processed_images: Vec<String>,
    /// Raw worker-supplied result tree; discarded once flattened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition_result: Option<TreeNode>,
    /// Flattened result, produced during the completion transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_flat: Option<Vec<FlatNode>>,
    /// Transient unrecognized payload; discarded at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_unrecognized: Option<serde_json::Value>,

    // --- timestamps (RFC 3339) ---
    pub created_at: String,
    /// Refreshed on every persisted transition; timeout detection basis.
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Client — quota-holding tenant
// ---------------------------------------------------------------------------

/// A tenant owning tasks and a consumable quota balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Consumable balance. Admission checks gate on the pre-deduction
    /// value only, so the balance may go negative.
    #[serde(default)]
    pub quota: i64,
    /// Informational ceiling; not enforced by the state machine.
    #[serde(default)]
    pub total_quota: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// API request types — caller-facing
// ---------------------------------------------------------------------------

/// Body for `POST /tasks` — create a new task.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub client_id: String,
    #[serde(default)]
    pub source_images: Vec<String>,
}

/// Body for `PUT /tasks/{id}` — update mutable task fields.
///
/// Status moves (e.g. `CREATED` → `READY_FOR_PROCESSING`) go through here.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub processed_images: Option<Vec<String>>,
    #[serde(default)]
    pub recognition_result: Option<TreeNode>,
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub offset: Option<usize>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,
}

// ---------------------------------------------------------------------------
// API request types — worker-facing
// ---------------------------------------------------------------------------

/// Body for `POST /tasks/{id}/@reserve`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    /// Identity of the worker reserving this task.
    pub worker_id: String,
}

/// Body for `POST /tasks/{id}/@report`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    #[serde(default)]
    pub status_text: String,
}

/// Body for `POST /tasks/{id}/@finish`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    #[serde(default)]
    pub processed_images: Option<Vec<String>>,
    #[serde(default)]
    pub recognition_result: Option<TreeNode>,
}

/// Body for `POST /tasks/{id}/@fail`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    /// Failure description.
    pub error: String,
}

// ---------------------------------------------------------------------------
// API request types — client management
// ---------------------------------------------------------------------------

/// Body for `POST /clients`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClientRequest {
    pub name: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub total_quota: i64,
}

/// Body for `PUT /clients/{id}` — quota adjustments.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClientRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub quota: Option<i64>,
    #[serde(default)]
    pub total_quota: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
