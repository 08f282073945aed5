pub mod api;
pub mod coordination;
pub mod machine;
pub mod model;
pub mod registry;
pub mod store;
pub mod worker;

use std::sync::Arc;

use axum::Router;

use vision_core::{Module, ServiceError};
use vision_sql::SQLStore;

use coordination::CoordinationService;
use machine::{MachineConfig, StateMachine};
use registry::SubscriberRegistry;
use store::{ClientStore, TaskStore};
use worker::WorkerConfig;

/// The recognition module — task orchestration for the image pipeline.
///
/// Owns the task/client stores, the state machine, the subscriber registry
/// and the worker coordination service, all constructed once here and
/// shared by reference. Embedding this in a server binary provides the
/// task CRUD API, the client API and the worker coordination protocol.
pub struct RecognitionModule {
    state: api::ApiState,
    _watchdog_cancel: tokio_util::sync::CancellationToken,
}

impl RecognitionModule {
    /// Create the module, initialise storage, and start the watchdog.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        Self::with_config(db, MachineConfig::default(), WorkerConfig::default())
    }

    /// Create with explicit machine and watchdog configuration.
    pub fn with_config(
        db: Arc<dyn SQLStore>,
        machine_config: MachineConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self, ServiceError> {
        let tasks = Arc::new(TaskStore::new(Arc::clone(&db))?);
        let clients = Arc::new(ClientStore::new(db)?);
        let registry = Arc::new(SubscriberRegistry::new());
        let machine = Arc::new(StateMachine::with_config(
            Arc::clone(&tasks),
            Arc::clone(&clients),
            Arc::clone(&registry),
            machine_config,
        ));
        let coordination = Arc::new(CoordinationService::new(
            Arc::clone(&tasks),
            Arc::clone(&machine),
            Arc::clone(&registry),
        ));
        let cancel = worker::start(Arc::clone(&machine), worker_config);

        Ok(Self {
            state: api::ApiState {
                tasks,
                clients,
                machine,
                coordination,
            },
            _watchdog_cancel: cancel,
        })
    }

    /// The state machine, for programmatic task processing.
    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.state.machine
    }

    /// The coordination service, for in-process workers.
    pub fn coordination(&self) -> &Arc<CoordinationService> {
        &self.state.coordination
    }
}

impl Module for RecognitionModule {
    fn name(&self) -> &str {
        "recognition"
    }

    fn routes(&self) -> Router {
        api::router(self.state.clone())
    }
}
