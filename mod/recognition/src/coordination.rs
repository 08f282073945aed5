use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::info;

use vision_core::{ServiceError, new_id};

use crate::machine::StateMachine;
use crate::model::{Queue, TaskStatus, TreeNode};
use crate::registry::SubscriberRegistry;
use crate::store::TaskStore;

/// The worker-facing coordination service.
///
/// Workers subscribe to a queue for pending-task announcements, then call
/// back in to reserve, report on, finish, or fail a task. Every mutation
/// is pushed back through the state machine.
///
/// Calls on already-terminal tasks are safe no-ops (except `reserve`,
/// which reports the precondition to the caller), and not-found /
/// precondition / validation / storage failures surface as distinct
/// [`ServiceError`] variants.
pub struct CoordinationService {
    tasks: Arc<TaskStore>,
    machine: Arc<StateMachine>,
    registry: Arc<SubscriberRegistry>,
}

impl CoordinationService {
    pub fn new(
        tasks: Arc<TaskStore>,
        machine: Arc<StateMachine>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            tasks,
            machine,
            registry,
        }
    }

    /// Open a subscription for one queue.
    ///
    /// The returned feed yields every task currently pending for the queue
    /// (oldest first), then live announcements until the feed is dropped.
    /// Registration happens before the backlog query, so a task admitted in
    /// between shows up in the live channel — possibly in both, which is
    /// fine: duplicate announcements are part of the contract.
    pub fn subscribe(&self, queue: Queue) -> Result<TaskFeed, ServiceError> {
        let subscriber_id = new_id();
        let rx = self.registry.subscribe(&subscriber_id, queue);

        let backlog: VecDeque<String> = match self.tasks.with_status(queue.pending_status()) {
            Ok(tasks) => tasks.into_iter().map(|t| t.id).collect(),
            Err(e) => {
                self.registry.unsubscribe(&subscriber_id);
                return Err(e);
            }
        };

        info!(subscriber = %subscriber_id, ?queue, backlog = backlog.len(), "worker subscribed");

        Ok(TaskFeed {
            backlog,
            rx,
            _guard: FeedGuard {
                subscriber_id,
                registry: Arc::clone(&self.registry),
            },
        })
    }

    /// Stamp a worker's claim on a task.
    ///
    /// No compare-and-swap: a second worker's reservation overwrites the
    /// first. Reservation does not change the task's status.
    pub fn reserve(&self, task_id: &str, worker_id: &str) -> Result<(), ServiceError> {
        if worker_id.is_empty() {
            return Err(ServiceError::Validation("workerId is required".into()));
        }

        let mut task = self.tasks.get(task_id)?;
        if task.status.is_terminal() {
            return Err(ServiceError::FailedPrecondition(format!(
                "task {task_id} is in terminal state {}",
                task.status
            )));
        }

        task.worker_id = worker_id.to_string();
        self.machine.save(&mut task)
    }

    /// Record the worker's free-text progress report.
    ///
    /// Also the liveness signal: persisting refreshes `updated_at`, and the
    /// machine re-evaluates the task even without a terminal report.
    pub fn report(&self, task_id: &str, status_text: &str) -> Result<(), ServiceError> {
        let mut task = self.tasks.get(task_id)?;
        if task.status.is_terminal() {
            return Ok(());
        }

        task.status_text = status_text.to_string();
        self.machine.save(&mut task)
    }

    /// Record a worker's stage result and advance the task.
    ///
    /// In any active status other than the two processing stages the fields
    /// are ignored and the task is merely re-persisted and re-evaluated.
    pub fn finish(
        &self,
        task_id: &str,
        processed_images: Option<Vec<String>>,
        recognition_result: Option<TreeNode>,
    ) -> Result<(), ServiceError> {
        let mut task = self.tasks.get(task_id)?;
        if task.status.is_terminal() {
            return Ok(());
        }

        match task.status {
            TaskStatus::ImagesProcessing => {
                task.processed_images = processed_images.unwrap_or_default();
                task.status = TaskStatus::ImagesCompleted;
            }
            TaskStatus::RecognitionProcessing => {
                task.recognition_result = recognition_result;
                task.status = TaskStatus::RecognitionCompleted;
            }
            _ => {}
        }

        self.machine.save(&mut task)
    }

    /// Record a worker-reported failure, terminating the task.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<(), ServiceError> {
        let mut task = self.tasks.get(task_id)?;
        if task.status.is_terminal() {
            return Ok(());
        }

        match task.status {
            TaskStatus::ImagesProcessing => {
                task.status = TaskStatus::ImagesFailedProcessing;
            }
            TaskStatus::RecognitionProcessing => {
                task.status = TaskStatus::RecognitionFailedProcessing;
            }
            _ => {}
        }
        task.error = error.to_string();

        self.machine.save(&mut task)
    }
}

// ---------------------------------------------------------------------------
// TaskFeed
// ---------------------------------------------------------------------------

/// A live feed of pending task ids for one subscriber.
///
/// Yields the subscribe-time backlog first, then live announcements.
/// Dropping the feed — including mid-send stream cancellation on the HTTP
/// side — unregisters the subscriber and releases its channel.
pub struct TaskFeed {
    backlog: VecDeque<String>,
    rx: mpsc::Receiver<String>,
    _guard: FeedGuard,
}

struct FeedGuard {
    subscriber_id: String,
    registry: Arc<SubscriberRegistry>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.subscriber_id);
    }
}

impl Stream for TaskFeed {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        if let Some(task_id) = self.backlog.pop_front() {
            return Poll::Ready(Some(task_id));
        }
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
