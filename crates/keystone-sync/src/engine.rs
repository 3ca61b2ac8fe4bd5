//! # Engine
//!
//! Owns every component and runs their background loops.
//!
//! ## Startup / Shutdown Order
//! ```text
//! start()                              shutdown()
//!   1. lock sweeper                      1. maintenance worker
//!   2. coordinator subscribes            2. writer (rolls back open txs)
//!   3. event bus loops                   3. event bus (flushes batches)
//!   4. maintenance worker                4. lock sweeper
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use keystone_store::{
    GraphStore, KeyValueStore, MemoryGraph, MemoryStore, MemoryVectorIndex, MemoryWarehouse,
    RedisStore, VectorStore, WarehouseStore,
};

use crate::bus::{EventBus, QueueStatus};
use crate::config::{EngineConfig, StoreBackend, StoreSettings};
use crate::coordinator::{ConsistencyCoordinator, CoordinatorStats};
use crate::dead_letter::DeadLetterQueue;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockService, LockStatistics};
use crate::maintenance::{MaintenanceHandle, MaintenanceWorker};
use crate::targets::{CacheTarget, GraphTarget, SyncTarget, VectorTarget, WarehouseTarget};
use crate::writer::TransactionalWriter;

/// Opens the shared cache store selected by the configuration.
pub async fn connect_store(settings: &StoreSettings) -> SyncResult<Arc<dyn KeyValueStore>> {
    match settings.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&settings.redis_url).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub node_id: String,
    pub store_backend: &'static str,
    pub running: bool,
    pub locks: LockStatistics,
    pub bus: QueueStatus,
    pub coordinator: CoordinatorStats,
    pub dead_letters: usize,
}

// =============================================================================
// Engine
// =============================================================================

/// The coordination engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn KeyValueStore>,
    locks: LockService,
    bus: EventBus,
    coordinator: ConsistencyCoordinator,
    writer: TransactionalWriter,
    dead_letters: DeadLetterQueue,
    maintenance: Option<(MaintenanceHandle, JoinHandle<()>)>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &ConsistencyCoordinator {
        &self.coordinator
    }

    pub fn writer(&self) -> &TransactionalWriter {
        &self.writer
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn is_running(&self) -> bool {
        self.maintenance.is_some()
    }

    /// Starts every background loop. Calling it twice is a no-op.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            return Ok(());
        }

        info!(
            node_id = %self.config.node_id(),
            store_backend = self.store.backend(),
            "Starting coordination engine"
        );

        self.locks.start_sweeper().await;
        self.coordinator.start().await;
        self.bus.start().await;

        let (worker, handle) = MaintenanceWorker::new(
            self.config.maintenance.clone(),
            self.coordinator.clone(),
            self.writer.clone(),
            self.dead_letters.clone(),
        );
        let task = tokio::spawn(worker.run());
        self.maintenance = Some((handle, task));

        info!("Coordination engine started");
        Ok(())
    }

    /// Stops every loop in reverse order and rolls back open transactions.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down coordination engine");

        if let Some((handle, task)) = self.maintenance.take() {
            let _ = handle.shutdown().await;
            if let Err(e) = task.await {
                error!(?e, "Maintenance task panicked");
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            error!(error_kind = %e.kind(), ?e, "Writer shutdown failed");
        }

        self.bus.shutdown().await;
        self.locks.stop_sweeper().await;

        info!("Coordination engine stopped");
        Ok(())
    }

    pub async fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            node_id: self.config.node_id().to_string(),
            store_backend: self.store.backend(),
            running: self.is_running(),
            locks: self.locks.statistics().await,
            bus: self.bus.queue_status().await,
            coordinator: self.coordinator.statistics().await?,
            dead_letters: self.dead_letters.count().await?,
        })
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating an [`Engine`] with injected collaborators.
///
/// The cache store falls back to [`connect_store`]. Graph, warehouse and
/// vector stores left unset fall back to in-memory stores only on the
/// memory backend, or when `store.in_memory_collaborators` opts in.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    warehouse: Option<Arc<dyn WarehouseStore>>,
    vector_index: Option<Arc<dyn VectorStore>>,
    extra_targets: Vec<Arc<dyn SyncTarget>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            store: None,
            graph: None,
            warehouse: None,
            vector_index: None,
            extra_targets: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_warehouse(mut self, warehouse: Arc<dyn WarehouseStore>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorStore>) -> Self {
        self.vector_index = Some(index);
        self
    }

    /// Replaces the default adapter for the target's store.
    pub fn with_target(mut self, target: Arc<dyn SyncTarget>) -> Self {
        self.extra_targets.push(target);
        self
    }

    pub async fn build(self) -> SyncResult<Engine> {
        self.config.validate()?;

        if self.config.store.backend == StoreBackend::Redis
            && !self.config.store.in_memory_collaborators
        {
            let missing: Vec<&str> = [
                ("graph", self.graph.is_none()),
                ("warehouse", self.warehouse.is_none()),
                ("vector", self.vector_index.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            if !missing.is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "redis backend needs injected {} store(s); set store.in_memory_collaborators to use process-local ones",
                    missing.join(", ")
                )));
            }
        }

        let store = match self.store {
            Some(store) => store,
            None => connect_store(&self.config.store).await?,
        };
        let graph = self.graph.unwrap_or_else(|| {
            info!("No graph store injected, using in-memory graph");
            Arc::new(MemoryGraph::new())
        });
        let warehouse = self.warehouse.unwrap_or_else(|| {
            info!("No warehouse injected, using in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        });
        let vector_index = self.vector_index.unwrap_or_else(|| {
            info!("No vector index injected, using in-memory index");
            Arc::new(MemoryVectorIndex::new())
        });

        let mut targets: Vec<Arc<dyn SyncTarget>> = vec![
            Arc::new(CacheTarget::new(store.clone(), self.config.sync.cache_rules())),
            Arc::new(GraphTarget::new(graph.clone())),
            Arc::new(WarehouseTarget::new(warehouse)),
            Arc::new(VectorTarget::new(vector_index)),
        ];
        for extra in self.extra_targets {
            targets.retain(|t| t.store() != extra.store());
            targets.push(extra);
        }

        let dead_letters = DeadLetterQueue::new(store.clone());
        let locks = LockService::new(store.clone(), self.config.locks.clone());
        let bus = EventBus::new(self.config.bus.clone(), dead_letters.clone());
        let coordinator = ConsistencyCoordinator::new(
            self.config.sync.clone(),
            store.clone(),
            bus.clone(),
            targets,
            dead_letters.clone(),
        )?;
        let writer = TransactionalWriter::new(
            self.config.transactions.clone(),
            store.clone(),
            graph,
            locks.clone(),
            dead_letters.clone(),
        );

        if coordinator.routing().entity_types().next().is_none() {
            return Err(SyncError::InvalidConfig("Routing table is empty".into()));
        }

        Ok(Engine {
            config: Arc::new(self.config),
            store,
            locks,
            bus,
            coordinator,
            writer,
            dead_letters,
            maintenance: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{DataSource, Operation, SyncOperation};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_engine_lifecycle() {
        let graph = Arc::new(MemoryGraph::new());
        let mut engine = EngineBuilder::new(EngineConfig::default())
            .with_graph(graph.clone())
            .build()
            .await
            .unwrap();
        assert!(!engine.is_running());

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());

        engine
            .coordinator()
            .publish_change(
                DataSource::Cache,
                SyncOperation::Create,
                "task",
                "t1",
                json!({ "title": "ship" }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(graph.get_node("task:t1").await.unwrap().is_some());

        engine.writer().begin("tx-open").await.unwrap();
        engine
            .writer()
            .add_operation("tx-open", Operation::create_node("n1", &[], json!({})))
            .await
            .unwrap();

        let status = engine.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.store_backend, "memory");
        assert_eq!(status.coordinator.events_processed, 1);

        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert_eq!(
            engine.writer().get_status("tx-open").await.unwrap().status,
            keystone_core::TransactionStatus::RolledBack
        );
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let store = connect_store(&StoreSettings::default()).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }

    #[tokio::test]
    async fn test_redis_backend_requires_injected_stores() {
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Redis;
        let shared: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let err = EngineBuilder::new(config.clone())
            .with_store(shared.clone())
            .with_graph(Arc::new(MemoryGraph::new()))
            .build()
            .await
            .err()
            .unwrap();
        match err {
            SyncError::InvalidConfig(message) => {
                assert!(message.contains("warehouse, vector"), "{}", message);
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(EngineBuilder::new(config.clone())
            .with_store(shared.clone())
            .with_graph(Arc::new(MemoryGraph::new()))
            .with_warehouse(Arc::new(MemoryWarehouse::new()))
            .with_vector_index(Arc::new(MemoryVectorIndex::new()))
            .build()
            .await
            .is_ok());

        config.store.in_memory_collaborators = true;
        assert!(EngineBuilder::new(config)
            .with_store(shared)
            .build()
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_foreign_locks_alone() {
        let mut engine = EngineBuilder::new(EngineConfig::default())
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        assert!(engine
            .locks()
            .acquire("shared-resource", "other-node", Some(Duration::from_secs(600)), false)
            .await
            .unwrap());

        engine.shutdown().await.unwrap();

        let info = engine.locks().get_lock_info("shared-resource").await.unwrap().unwrap();
        assert_eq!(info.holder_id, "other-node");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.sync.topic.clear();
        assert!(EngineBuilder::new(config).build().await.is_err());
    }
}
