use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vision_core::{ServiceError, now_rfc3339};

use crate::model::{FlatNode, Task, TaskStatus, TreeNode};
use crate::registry::SubscriberRegistry;
use crate::store::{ClientStore, TaskStore};

/// How long a task may sit in IMAGES_PROCESSING without a persisted update.
pub const IMAGE_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How long a task may sit in RECOGNITION_PROCESSING without a persisted update.
pub const RECOGNITION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Timeout configuration for the state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub image_processing_timeout: Duration,
    pub recognition_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            image_processing_timeout: IMAGE_PROCESSING_TIMEOUT,
            recognition_timeout: RECOGNITION_TIMEOUT,
        }
    }
}

/// The task state machine — transition engine and notification source.
///
/// Invoked after every task row write ([`StateMachine::create`] and
/// [`StateMachine::save`] are the write sites, so the hook is explicit
/// rather than hidden in the persistence layer). Decides and persists the
/// next status for active tasks; terminal tasks pass through untouched.
///
/// Transitions the machine persists itself go back through [`process`],
/// which is how a freshly-admitted task lands its pending notification.
/// The recursion is bounded: pending and terminal arms never persist.
///
/// [`process`]: StateMachine::process
pub struct StateMachine {
    tasks: Arc<TaskStore>,
    clients: Arc<ClientStore>,
    registry: Arc<SubscriberRegistry>,
    config: MachineConfig,
}

impl StateMachine {
    pub fn new(
        tasks: Arc<TaskStore>,
        clients: Arc<ClientStore>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self::with_config(tasks, clients, registry, MachineConfig::default())
    }

    pub fn with_config(
        tasks: Arc<TaskStore>,
        clients: Arc<ClientStore>,
        registry: Arc<SubscriberRegistry>,
        config: MachineConfig,
    ) -> Self {
        Self {
            tasks,
            clients,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Write sites (the on-write hook)
    // -----------------------------------------------------------------------

    /// Insert a new task row, then run it through the machine.
    pub fn create(&self, task: &mut Task) -> Result<(), ServiceError> {
        self.tasks.create(task)?;
        self.process(task)
    }

    /// Persist a task row, then run it through the machine.
    ///
    /// Refreshes `updated_at` — every persisted transition resets the
    /// timeout clock.
    pub fn save(&self, task: &mut Task) -> Result<(), ServiceError> {
        task.updated_at = now_rfc3339();
        self.tasks.update(task)?;
        self.process(task)
    }

    /// Persist a task row together with its client row (one transaction),
    /// then run the task through the machine. Used for transitions that
    /// consume quota: the deduction and the status change must never be
    /// observable apart.
    fn save_with_client(
        &self,
        task: &mut Task,
        client: &mut crate::model::Client,
    ) -> Result<(), ServiceError> {
        let now = now_rfc3339();
        task.updated_at = now.clone();
        client.updated_at = now;
        self.tasks.save_with_client(task, client)?;
        self.process(task)
    }

    // -----------------------------------------------------------------------
    // Transition engine
    // -----------------------------------------------------------------------

    /// Analyze the task's current state and perform the next appropriate
    /// action. Safe to call on any task; terminal tasks are a no-op.
    pub fn process(&self, task: &mut Task) -> Result<(), ServiceError> {
        if task.status.is_terminal() {
            return Ok(());
        }

        debug!(task = %task.id, status = %task.status, "processing task state");

        match task.status {
            // Waits for an explicit external move to READY_FOR_PROCESSING.
            TaskStatus::Created => Ok(()),
            TaskStatus::ReadyForProcessing => self.handle_ready_for_processing(task),
            TaskStatus::ImagesPending => {
                self.registry.notify(task);
                Ok(())
            }
            TaskStatus::ImagesProcessing => self.handle_images_processing(task),
            TaskStatus::ImagesCompleted => self.handle_images_completed(task),
            TaskStatus::RecognitionPending => {
                // Re-announced on every invocation while pending; workers
                // tolerate duplicate announcements.
                self.registry.notify(task);
                Ok(())
            }
            TaskStatus::RecognitionProcessing => self.handle_recognition_processing(task),
            TaskStatus::RecognitionCompleted => self.handle_recognition_completed(task),
            // Quota failures keep explicit arms for symmetry with the
            // transition table; nothing further happens.
            TaskStatus::ImagesFailedQuota | TaskStatus::RecognitionFailedQuota => Ok(()),
            _ => Ok(()),
        }
    }

    fn handle_ready_for_processing(&self, task: &mut Task) -> Result<(), ServiceError> {
        if task.source_images.is_empty() {
            task.error = "no images provided".into();
            task.status = TaskStatus::ImagesFailedProcessing;
            return self.save(task);
        }

        let mut client = self.clients.get(&task.client_id)?;

        if client.quota <= 0 {
            task.error = "insufficient quota".into();
            task.status = TaskStatus::ImagesFailedQuota;
            return self.save(task);
        }

        // Only the pre-deduction balance gates admission: a low but nonzero
        // quota is allowed to go negative here.
        client.quota -= task.source_images.len() as i64;
        task.status = TaskStatus::ImagesPending;
        self.save_with_client(task, &mut client)
    }

    fn handle_images_processing(&self, task: &mut Task) -> Result<(), ServiceError> {
        if self.expired(task, self.config.image_processing_timeout) {
            task.error = "timeout".into();
            task.status = TaskStatus::ImagesFailedTimeout;
            return self.save(task);
        }

        if task.processed_images.len() == task.source_images.len() {
            task.status = TaskStatus::ImagesCompleted;
            return self.save(task);
        }

        // Still waiting on the worker.
        Ok(())
    }

    fn handle_images_completed(&self, task: &mut Task) -> Result<(), ServiceError> {
        // Reload the client: quota may have moved since admission.
        let mut client = self.clients.get(&task.client_id)?;

        if client.quota < 1 {
            task.error = "insufficient quota".into();
            task.status = TaskStatus::RecognitionFailedQuota;
            return self.save(task);
        }

        client.quota -= 1;
        task.status = TaskStatus::RecognitionPending;
        // The re-entrant process() on the pending state notifies the
        // recognition queue subscribers.
        self.save_with_client(task, &mut client)
    }

    fn handle_recognition_processing(&self, task: &mut Task) -> Result<(), ServiceError> {
        if self.expired(task, self.config.recognition_timeout) {
            task.error = "timeout".into();
            task.status = TaskStatus::RecognitionFailedTimeout;
            return self.save(task);
        }

        // Completion is worker-driven: whatever result has been reported by
        // now is the result. Landing in RECOGNITION_COMPLETED re-enters the
        // machine, which flattens it onward.
        task.status = TaskStatus::RecognitionCompleted;
        self.save(task)
    }

    fn handle_recognition_completed(&self, task: &mut Task) -> Result<(), ServiceError> {
        // Derive the client-facing flat representation, then drop the raw
        // tree and the transient unrecognized payload.
        let flat = task
            .recognition_result
            .as_ref()
            .map(flatten)
            .unwrap_or_default();
        task.result_flat = Some(flat);
        task.recognition_result = None;
        task.result_unrecognized = None;
        task.status = TaskStatus::ProcessingCompleted;
        self.save(task)
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    /// Whether `timeout` has elapsed since the task's last persisted update.
    fn expired(&self, task: &Task, timeout: Duration) -> bool {
        let updated = match chrono::DateTime::parse_from_rfc3339(&task.updated_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(task = %task.id, "unparsable updatedAt, skipping timeout check: {e}");
                return false;
            }
        };
        let elapsed = chrono::Utc::now().signed_duration_since(updated);
        elapsed.to_std().map(|e| e > timeout).unwrap_or(false)
    }

    /// Apply the timeout rules to every task currently in a processing
    /// status. Returns the number of tasks timed out.
    ///
    /// This is the watchdog entry point. It deliberately applies ONLY the
    /// timeout rules — a full `process` pass on RECOGNITION_PROCESSING
    /// would complete the task, and completion belongs to workers.
    pub fn check_timeouts(&self) -> Result<u32, ServiceError> {
        let checks = [
            (
                TaskStatus::ImagesProcessing,
                self.config.image_processing_timeout,
                TaskStatus::ImagesFailedTimeout,
            ),
            (
                TaskStatus::RecognitionProcessing,
                self.config.recognition_timeout,
                TaskStatus::RecognitionFailedTimeout,
            ),
        ];

        let mut timed_out = 0u32;
        for (status, timeout, failed) in checks {
            for mut task in self.tasks.with_status(status)? {
                if self.expired(&task, timeout) {
                    task.error = "timeout".into();
                    task.status = failed;
                    self.save(&mut task)?;
                    timed_out += 1;
                }
            }
        }

        Ok(timed_out)
    }
}

/// Flatten a recognition result tree into one flat node per tree node,
/// each recording its parent's id. The root's parent id is empty.
pub fn flatten(root: &TreeNode) -> Vec<FlatNode> {
    let mut flat = Vec::new();
    let mut stack: Vec<(&TreeNode, String)> = vec![(root, String::new())];
    while let Some((node, parent_id)) = stack.pop() {
        flat.push(FlatNode {
            id: node.id.clone(),
            parent_id,
            label: node.label.clone(),
        });
        for leaf in &node.leaves {
            stack.push((leaf, node.id.clone()));
        }
    }
    flat
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Client, Queue};
    use vision_sql::{SQLStore, SqliteStore};

    struct TestEnv {
        tasks: Arc<TaskStore>,
        clients: Arc<ClientStore>,
        registry: Arc<SubscriberRegistry>,
        machine: StateMachine,
    }

    fn test_env() -> TestEnv {
        let db: Arc<dyn SQLStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tasks = Arc::new(TaskStore::new(Arc::clone(&db)).unwrap());
        let clients = Arc::new(ClientStore::new(db).unwrap());
        let registry = Arc::new(SubscriberRegistry::new());
        let machine = StateMachine::new(
            Arc::clone(&tasks),
            Arc::clone(&clients),
            Arc::clone(&registry),
        );
        TestEnv {
            tasks,
            clients,
            registry,
            machine,
        }
    }

    fn seed_client(env: &TestEnv, quota: i64) -> Client {
        let now = now_rfc3339();
        let client = Client {
            id: "c1".into(),
            name: "Test Client".into(),
            quota,
            total_quota: quota.max(0),
            created_at: now.clone(),
            updated_at: now,
        };
        env.clients.create(&client).unwrap();
        client
    }

    fn seed_task(env: &TestEnv, status: TaskStatus, source: &[&str], processed: &[&str]) -> Task {
        let now = now_rfc3339();
        let task = Task {
            id: vision_core::new_id(),
            status,
            status_text: String::new(),
            error: String::new(),
            client_id: "c1".into(),
            worker_id: String::new(),
            source_images: source.iter().map(|s| s.to_string()).collect(),
            processed_images: processed.iter().map(|s| s.to_string()).collect(),
            recognition_result: None,
            result_flat: None,
            result_unrecognized: None,
            created_at: now.clone(),
            updated_at: now,
        };
        env.tasks.create(&task).unwrap();
        task
    }

    #[test]
    fn created_stays_created() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::Created, &["a.jpg"], &[]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.error.is_empty());
    }

    #[test]
    fn no_images_fails_processing() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::ReadyForProcessing, &[], &[]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesFailedProcessing);
        assert_eq!(task.error, "no images provided");
        // Quota untouched.
        assert_eq!(env.clients.get("c1").unwrap().quota, 100);
        // Persisted.
        assert_eq!(
            env.tasks.get(&task.id).unwrap().status,
            TaskStatus::ImagesFailedProcessing
        );
    }

    #[test]
    fn zero_quota_fails_admission() {
        let env = test_env();
        seed_client(&env, 0);
        let mut task = seed_task(&env, TaskStatus::ReadyForProcessing, &["a.jpg"], &[]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesFailedQuota);
        assert_eq!(task.error, "insufficient quota");
        assert_eq!(env.clients.get("c1").unwrap().quota, 0);
    }

    #[test]
    fn low_but_nonzero_quota_goes_negative() {
        let env = test_env();
        seed_client(&env, 1);
        let mut task = seed_task(&env, TaskStatus::ReadyForProcessing, &["a.jpg", "b.jpg"], &[]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesPending);
        // Pre-deduction check only: 1 - 2 = -1 is allowed.
        assert_eq!(env.clients.get("c1").unwrap().quota, -1);
    }

    #[test]
    fn admission_deducts_per_image() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::ReadyForProcessing, &["a.jpg", "b.jpg"], &[]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesPending);
        assert_eq!(env.clients.get("c1").unwrap().quota, 98);
    }

    #[tokio::test]
    async fn admission_notifies_image_queue_only() {
        let env = test_env();
        seed_client(&env, 100);
        let mut img_rx = env.registry.subscribe("img", Queue::ImageProcessing);
        let mut rec_rx = env.registry.subscribe("rec", Queue::Recognition);

        let mut task = seed_task(&env, TaskStatus::ReadyForProcessing, &["a.jpg"], &[]);
        env.machine.process(&mut task).unwrap();

        assert_eq!(img_rx.try_recv().unwrap(), task.id);
        assert!(rec_rx.try_recv().is_err());
    }

    #[test]
    fn images_processing_waits_for_worker() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(
            &env,
            TaskStatus::ImagesProcessing,
            &["a.jpg", "b.jpg"],
            &["a-out.jpg"],
        );

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesProcessing);
    }

    #[test]
    fn images_processing_times_out() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::ImagesProcessing, &["a.jpg"], &[]);
        task.updated_at = (chrono::Utc::now() - chrono::Duration::minutes(11)).to_rfc3339();
        env.tasks.update(&task).unwrap();

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ImagesFailedTimeout);
        assert_eq!(task.error, "timeout");
    }

    #[test]
    fn images_complete_cascades_into_recognition_pending() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(
            &env,
            TaskStatus::ImagesProcessing,
            &["a.jpg"],
            &["a-out.jpg"],
        );

        env.machine.process(&mut task).unwrap();

        // IMAGES_COMPLETED is passed through on the same invocation: the
        // recognition admission deducts 1 and parks the task as pending.
        assert_eq!(task.status, TaskStatus::RecognitionPending);
        assert_eq!(env.clients.get("c1").unwrap().quota, 99);
        assert_eq!(
            env.tasks.get(&task.id).unwrap().status,
            TaskStatus::RecognitionPending
        );
    }

    #[tokio::test]
    async fn recognition_admission_notifies_recognition_queue() {
        let env = test_env();
        seed_client(&env, 100);
        let mut rec_rx = env.registry.subscribe("rec", Queue::Recognition);

        let mut task = seed_task(&env, TaskStatus::ImagesCompleted, &["a.jpg"], &["a-out.jpg"]);
        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::RecognitionPending);
        assert_eq!(rec_rx.try_recv().unwrap(), task.id);
    }

    #[test]
    fn recognition_admission_fails_without_quota() {
        let env = test_env();
        seed_client(&env, 0);
        let mut task = seed_task(&env, TaskStatus::ImagesCompleted, &["a.jpg"], &["a-out.jpg"]);

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::RecognitionFailedQuota);
        assert_eq!(task.error, "insufficient quota");
        assert_eq!(env.clients.get("c1").unwrap().quota, 0);
    }

    #[test]
    fn recognition_processing_times_out() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::RecognitionProcessing, &["a.jpg"], &["a-out.jpg"]);
        task.updated_at = (chrono::Utc::now() - chrono::Duration::minutes(16)).to_rfc3339();
        env.tasks.update(&task).unwrap();

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::RecognitionFailedTimeout);
        assert_eq!(task.error, "timeout");
    }

    #[test]
    fn recognition_result_is_flattened_to_completion() {
        let env = test_env();
        seed_client(&env, 100);
        let mut task = seed_task(&env, TaskStatus::RecognitionCompleted, &["a.jpg"], &["a-out.jpg"]);
        task.recognition_result = Some(TreeNode {
            id: "root".into(),
            label: "invoice".into(),
            leaves: vec![
                TreeNode {
                    id: "leaf1".into(),
                    label: String::new(),
                    leaves: Vec::new(),
                },
                TreeNode {
                    id: "leaf2".into(),
                    label: String::new(),
                    leaves: Vec::new(),
                },
            ],
        });
        task.result_unrecognized = Some(serde_json::json!({"other": "data"}));
        env.tasks.update(&task).unwrap();

        env.machine.process(&mut task).unwrap();

        assert_eq!(task.status, TaskStatus::ProcessingCompleted);
        assert!(task.recognition_result.is_none());
        assert!(task.result_unrecognized.is_none());

        // One flat node per tree node, each carrying its parent id.
        let flat = task.result_flat.as_ref().unwrap();
        assert_eq!(flat.len(), 3);
        let parent_of = |id: &str| {
            flat.iter()
                .find(|n| n.id == id)
                .map(|n| n.parent_id.clone())
                .unwrap()
        };
        assert_eq!(parent_of("root"), "");
        assert_eq!(parent_of("leaf1"), "root");
        assert_eq!(parent_of("leaf2"), "root");

        // Persisted.
        let stored = env.tasks.get(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::ProcessingCompleted);
        assert!(stored.recognition_result.is_none());
    }

    #[tokio::test]
    async fn terminal_tasks_are_untouched() {
        let env = test_env();
        seed_client(&env, 100);
        let mut rx = env.registry.subscribe("img", Queue::ImageProcessing);

        for status in [
            TaskStatus::ImagesFailedQuota,
            TaskStatus::ImagesFailedTimeout,
            TaskStatus::ImagesFailedProcessing,
            TaskStatus::RecognitionFailedQuota,
            TaskStatus::RecognitionFailedTimeout,
            TaskStatus::RecognitionFailedProcessing,
            TaskStatus::ProcessingCompleted,
        ] {
            let mut task = seed_task(&env, status, &["a.jpg"], &[]);
            task.error = "already failed".into();
            env.tasks.update(&task).unwrap();

            env.machine.process(&mut task).unwrap();

            assert_eq!(task.status, status);
            assert_eq!(task.error, "already failed");
        }

        // No notification was emitted and quota never moved.
        assert!(rx.try_recv().is_err());
        assert_eq!(env.clients.get("c1").unwrap().quota, 100);
    }

    #[test]
    fn check_timeouts_fails_only_expired_tasks() {
        let env = test_env();
        seed_client(&env, 100);

        let mut expired = seed_task(&env, TaskStatus::ImagesProcessing, &["a.jpg"], &[]);
        expired.updated_at = (chrono::Utc::now() - chrono::Duration::minutes(11)).to_rfc3339();
        env.tasks.update(&expired).unwrap();

        let fresh = seed_task(&env, TaskStatus::ImagesProcessing, &["b.jpg"], &[]);

        let mut expired_rec = seed_task(&env, TaskStatus::RecognitionProcessing, &["c.jpg"], &["c-out.jpg"]);
        expired_rec.updated_at = (chrono::Utc::now() - chrono::Duration::minutes(16)).to_rfc3339();
        env.tasks.update(&expired_rec).unwrap();

        let timed_out = env.machine.check_timeouts().unwrap();
        assert_eq!(timed_out, 2);

        assert_eq!(
            env.tasks.get(&expired.id).unwrap().status,
            TaskStatus::ImagesFailedTimeout
        );
        assert_eq!(
            env.tasks.get(&fresh.id).unwrap().status,
            TaskStatus::ImagesProcessing
        );
        assert_eq!(
            env.tasks.get(&expired_rec.id).unwrap().status,
            TaskStatus::RecognitionFailedTimeout
        );
    }

    #[test]
    fn check_timeouts_leaves_recognition_result_alone() {
        // The watchdog must not drive the worker-owned completion path.
        let env = test_env();
        seed_client(&env, 100);
        let fresh = seed_task(&env, TaskStatus::RecognitionProcessing, &["a.jpg"], &["a-out.jpg"]);

        let timed_out = env.machine.check_timeouts().unwrap();
        assert_eq!(timed_out, 0);
        assert_eq!(
            env.tasks.get(&fresh.id).unwrap().status,
            TaskStatus::RecognitionProcessing
        );
    }

    #[test]
    fn flatten_single_node() {
        let root = TreeNode {
            id: "only".into(),
            label: "x".into(),
            leaves: Vec::new(),
        };
        let flat = flatten(&root);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].id, "only");
        assert_eq!(flat[0].parent_id, "");
    }

    #[test]
    fn flatten_nested_tree() {
        let root = TreeNode {
            id: "r".into(),
            label: String::new(),
            leaves: vec![TreeNode {
                id: "a".into(),
                label: String::new(),
                leaves: vec![TreeNode {
                    id: "b".into(),
                    label: String::new(),
                    leaves: Vec::new(),
                }],
            }],
        };
        let flat = flatten(&root);
        assert_eq!(flat.len(), 3);
        let parent_of = |id: &str| {
            flat.iter()
                .find(|n| n.id == id)
                .map(|n| n.parent_id.clone())
                .unwrap()
        };
        assert_eq!(parent_of("r"), "");
        assert_eq!(parent_of("a"), "r");
        assert_eq!(parent_of("b"), "a");
    }
}
