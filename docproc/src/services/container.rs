//! Service container holding the queue, tracker and coordinator and managing
//! their background loops.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::database::{self, DbPool, SqlxProgressStore, SqlxQueueStore};
use crate::metrics::{ComponentHealth, HealthStatus, SystemHealth};
use crate::pipeline::resources::DEFAULT_SAMPLE_INTERVAL;
use crate::pipeline::{
    CleanupService, JobCoordinator, ProcessingStage, StageHandler, StageRegistry,
};
use crate::progress::{MemoryProgressStore, ProgressStore, ProgressTracker};
use crate::queue::{MemoryQueueStore, QueueStore, TaskQueue};
use crate::storage::{LocalObjectStore, ObjectStore};

/// Extra time granted on top of the coordinator's own drain timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds the service graph from an [`AppConfig`].
pub struct ServiceContainerBuilder {
    config: AppConfig,
    pool: Option<DbPool>,
    storage: Option<Arc<dyn ObjectStore>>,
    registry: StageRegistry,
}

impl ServiceContainerBuilder {
    /// Use an existing pool instead of opening `queue_url`.
    pub fn with_pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Use a custom object store instead of the local one under `storage_root`.
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the handler of one stage.
    pub fn with_stage_handler(
        mut self,
        stage: ProcessingStage,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        self.registry.register(stage, handler);
        self
    }

    pub async fn build(self) -> Result<ServiceContainer> {
        let pool = match self.pool {
            Some(pool) => {
                database::migrate(&pool).await?;
                Some(pool)
            }
            None if self.config.uses_memory_queue() => None,
            None => {
                let pool =
                    database::connect(&self.config.queue_url, database::DEFAULT_POOL_SIZE).await?;
                Some(pool)
            }
        };

        let (queue_store, progress_store): (Arc<dyn QueueStore>, Arc<dyn ProgressStore>) =
            match &pool {
                Some(pool) => (
                    Arc::new(SqlxQueueStore::new(pool.clone())),
                    Arc::new(SqlxProgressStore::new(pool.clone())),
                ),
                None => (
                    Arc::new(MemoryQueueStore::new()),
                    Arc::new(MemoryProgressStore::new()),
                ),
            };

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalObjectStore::new(&self.config.storage_root)));

        let queue = Arc::new(TaskQueue::with_store(self.config.queue.clone(), queue_store));
        let tracker = Arc::new(ProgressTracker::with_store(
            self.config.tracker.clone(),
            progress_store,
        ));
        let coordinator = Arc::new(JobCoordinator::new(
            self.config.coordinator.clone(),
            queue.clone(),
            tracker.clone(),
            self.registry,
            storage,
        ));
        let cleanup = Arc::new(CleanupService::new(
            self.config.cleanup.clone(),
            coordinator.clone(),
        ));

        Ok(ServiceContainer {
            config: self.config,
            pool,
            queue,
            tracker,
            coordinator,
            cleanup,
            cancellation_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }
}

/// Owns every long-lived service of the process.
pub struct ServiceContainer {
    config: AppConfig,
    pool: Option<DbPool>,
    pub queue: Arc<TaskQueue>,
    pub tracker: Arc<ProgressTracker>,
    pub coordinator: Arc<JobCoordinator>,
    pub cleanup: Arc<CleanupService>,
    cancellation_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl ServiceContainer {
    pub fn builder(config: AppConfig) -> ServiceContainerBuilder {
        ServiceContainerBuilder {
            config,
            pool: None,
            storage: None,
            registry: StageRegistry::with_defaults(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Connect the queue and start every background loop.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        self.queue.initialize().await?;
        self.coordinator.recover_interrupted().await?;

        let token = &self.cancellation_token;
        let handles = vec![
            self.coordinator.start(token.child_token()),
            self.coordinator
                .monitor()
                .start_monitoring(DEFAULT_SAMPLE_INTERVAL, token.child_token()),
            self.coordinator.start_watchdog(token.child_token()),
            self.cleanup.start(token.child_token()),
            self.tracker.start_heartbeat(token.child_token()),
        ];
        self.handles.lock().extend(handles);

        info!("Services initialized");
        Ok(())
    }

    /// Stop the loops, drain running stages, flush progress and close the pool.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.coordinator.shutdown_timeout_secs)
            + SHUTDOWN_GRACE;
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();
        self.queue.shutdown();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        self.tracker.shutdown().await;

        if let Some(pool) = &self.pool {
            info!("Closing database pool...");
            pool.close().await;
        }

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Probe the queue backend and report resource pressure.
    pub async fn health(&self) -> SystemHealth {
        let mut components = Vec::with_capacity(3);

        components.push(match self.queue.ping().await {
            Ok(()) if self.queue.is_initialized() => ComponentHealth::ok("queue"),
            Ok(()) => ComponentHealth::ok("queue")
                .with_status(HealthStatus::Unhealthy, "queue is not initialized"),
            Err(e) => ComponentHealth::ok("queue").with_status(HealthStatus::Unhealthy, e.to_string()),
        });

        if let Some(pool) = &self.pool {
            components.push(match sqlx::query("SELECT 1").execute(pool).await {
                Ok(_) => ComponentHealth::ok("database"),
                Err(e) => {
                    ComponentHealth::ok("database").with_status(HealthStatus::Unhealthy, e.to_string())
                }
            });
        }

        let monitor = self.coordinator.monitor();
        let mut resources = ComponentHealth::ok("resources");
        if monitor.is_throttled() {
            let usage = monitor.last_usage();
            resources = resources.with_status(
                HealthStatus::Degraded,
                format!(
                    "dispatch throttled: cpu {:.0}%, memory {} MB",
                    usage.cpu_fraction * 100.0,
                    usage.process_memory_mb
                ),
            );
        }
        components.push(resources);

        SystemHealth::from_components(components, self.started_at)
    }
}
