use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::machine::StateMachine;

/// Configuration for the background watchdog.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to check for timed-out tasks (seconds).
    pub timeout_check_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_check_interval: 30,
        }
    }
}

/// Start the background timeout watchdog.
///
/// Periodically applies the state machine's timeout rules to in-flight
/// tasks, so stalled workers produce `*_FAILED_TIMEOUT` transitions even
/// when no coordination RPC ever arrives for the task.
///
/// Returns a CancellationToken that stops the watchdog when cancelled.
pub fn start(machine: Arc<StateMachine>, config: WorkerConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.timeout_check_interval);

        tokio::spawn(async move {
            info!("task timeout watchdog started (interval={interval:?})");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("task timeout watchdog stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("timeout watchdog scan");
                        match machine.check_timeouts() {
                            Ok(0) => {}
                            Ok(n) => info!("timeout watchdog: timed out {n} tasks"),
                            Err(e) => error!("timeout watchdog error: {e}"),
                        }
                    }
                }
            }
        });
    }

    cancel
}
