//! Clogs server core
//!
//! This crate provides the ingestion-and-health-state engine:
//! - Envelope decoding at the transport boundary
//! - Agent registry with liveness tracking
//! - Bounded per-container metric and log storage
//! - Per-container health state machine
//! - Ingestion pipeline with per-agent backpressure
//! - Periodic liveness sweep and read-only queries
//! - Self-health and observability

pub mod engine;
pub mod error;
pub mod health;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod query;
pub mod registry;
pub mod store;
pub mod sweep;
pub mod transport;

pub use engine::{ContainerHealth, EngineConfig, HealthEngine, RuleSet};
pub use error::{ConfigError, DecodeError, IngestError, StoreError, TransportError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, LivenessMarker,
    ProgressTracker, ReadinessResponse,
};
pub use ingest::{IngestPipeline, PipelineConfig, RetryPolicy};
pub use models::*;
pub use observability::{ServerMetrics, StructuredLogger};
pub use query::QueryService;
pub use registry::{AgentInfo, AgentRegistry, ContainerInfo, RegistryConfig};
pub use store::{LogQuery, MemoryStore, Store, StoreConfig};
pub use sweep::SweepTask;
pub use transport::{EventSink, TransportEndpoint};

use ingest::PipelineDeps;
use std::sync::Arc;
use std::time::Duration;

/// Settings for assembling a [`ClogsCore`]
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Instance name attached to structured log events
    pub instance: String,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
    pub rules: RuleSet,
    /// Defaults to half the heartbeat timeout
    pub sweep_interval: Option<Duration>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            instance: "clogs-server".to_string(),
            registry: RegistryConfig::default(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            pipeline: PipelineConfig::default(),
            rules: RuleSet::default(),
            sweep_interval: None,
        }
    }
}

impl CoreSettings {
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or(self.registry.heartbeat_timeout / 2)
    }
}

/// The wired-up engine: registry, store, health engine, pipeline and read side
pub struct ClogsCore {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<HealthEngine>,
    pub pipeline: Arc<IngestPipeline>,
    pub transport: TransportEndpoint,
    pub query: QueryService,
    pub health: HealthRegistry,
    /// Marked whenever the pipeline finishes an event
    pub progress: ProgressTracker,
    /// Marked after each completed sweep
    pub sweep_progress: ProgressTracker,
    pub metrics: ServerMetrics,
    pub logger: StructuredLogger,
    sweep_interval: Duration,
}

impl ClogsCore {
    pub fn new(settings: CoreSettings) -> Self {
        let store = Arc::new(MemoryStore::new(settings.store.clone()));
        Self::with_store(settings, store)
    }

    /// Assemble around a caller-provided store
    pub fn with_store(settings: CoreSettings, store: Arc<dyn Store>) -> Self {
        let sweep_interval = settings.effective_sweep_interval();
        let metrics = ServerMetrics::new();
        let logger = StructuredLogger::new(settings.instance);
        let health = HealthRegistry::new();
        let progress = ProgressTracker::new(now_millis());
        let sweep_progress = ProgressTracker::new(now_millis());

        let registry = Arc::new(AgentRegistry::new(settings.registry));
        let engine = Arc::new(HealthEngine::new(
            settings.rules,
            settings.engine,
            logger.clone(),
        ));

        let pipeline = Arc::new(IngestPipeline::new(
            PipelineDeps {
                registry: Arc::clone(&registry),
                store: Arc::clone(&store),
                engine: Arc::clone(&engine),
                health: health.clone(),
                progress: progress.clone(),
                metrics: metrics.clone(),
                logger: logger.clone(),
            },
            settings.pipeline,
        ));

        let transport = TransportEndpoint::new(pipeline.clone(), metrics.clone());
        let query = QueryService::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&engine));

        Self {
            registry,
            store,
            engine,
            pipeline,
            transport,
            query,
            health,
            progress,
            sweep_progress,
            metrics,
            logger,
            sweep_interval,
        }
    }

    /// Register the self-health components as healthy
    pub async fn register_components(&self) {
        self.health.register(health::components::INGEST).await;
        self.health.register(health::components::SWEEP).await;
        self.health.register(health::components::STORE).await;
    }

    /// The sweep keeps running, and ingestion either kept up recently or has
    /// nothing waiting. An idle server with empty queues is still progressing.
    pub fn is_progressing(&self, now: Timestamp, window: Duration) -> bool {
        self.sweep_progress.is_progressing(now, window)
            && (self.pipeline.backlog() == 0 || self.progress.is_progressing(now, window))
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Build the periodic sweep over this core's state
    pub fn sweeper(&self) -> SweepTask {
        SweepTask::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            self.health.clone(),
            self.sweep_progress.clone(),
            self.metrics.clone(),
            self.logger.clone(),
            self.sweep_interval,
        )
    }
}
