use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::model::{Queue, Task};

/// Capacity of each subscriber's delivery channel. A subscriber that falls
/// further behind than this starts losing notifications (see [`SubscriberRegistry::notify`]).
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

struct Subscriber {
    queue: Queue,
    tx: mpsc::Sender<String>,
}

/// In-process pub/sub broker fanning pending-task ids out to workers.
///
/// Delivery is at-most-once and best-effort: a full channel drops the
/// notification rather than blocking the state machine. Workers compensate
/// by re-querying pending work when they (re)subscribe, and subscriber
/// state is not persisted — a restart simply loses all registrations.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    dropped: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for one queue and return its delivery channel.
    ///
    /// The channel is returned immediately so the caller can start draining
    /// before any notification arrives.
    pub fn subscribe(&self, id: &str, queue: Queue) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.insert(id.to_string(), Subscriber { queue, tx });
        rx
    }

    /// Remove a subscriber, closing its channel. A second call is a no-op.
    pub fn unsubscribe(&self, id: &str) {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Dropping the sender is what closes the receiver side.
        subs.remove(id);
    }

    /// Push a pending task's id to every subscriber whose queue matches the
    /// task's current pending status.
    ///
    /// Non-blocking: a full channel counts the notification as dropped and
    /// moves on. No backpressure ever reaches the state machine.
    pub fn notify(&self, task: &Task) {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, sub) in subs.iter() {
            if sub.queue.pending_status() != task.status {
                continue;
            }
            match sub.tx.try_send(task.id.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(task = %task.id, subscriber = %id, "subscriber channel full, notification dropped");
                }
                // Receiver already gone; unsubscribe will clean the entry up.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Total notifications dropped because a subscriber channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
