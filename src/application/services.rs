//! Application services - component wiring and lifecycle

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::coordinator::CoordinatorService;
use crate::domain::fusion::DataFusionEngine;
use crate::domain::health::HealthMonitor;
use crate::domain::pipeline::EventPipeline;
use crate::domain::registry::{ServerInvoker, ServerRegistry};
use crate::infrastructure::transport::{HttpInvoker, SimulatedInvoker};
use crate::shared::config::OrchestratorConfig;
use crate::shared::errors::AppError;

/// Owns one instance of every component and starts/stops them in
/// dependency order
pub struct OrchestratorService {
    config: OrchestratorConfig,
    invoker: Arc<dyn ServerInvoker>,
    registry: Arc<ServerRegistry>,
    fusion: Arc<DataFusionEngine>,
    pipeline: Arc<EventPipeline>,
    coordinator: Arc<CoordinatorService>,
    health: Arc<HealthMonitor>,
}

impl OrchestratorService {
    /// Create new orchestrator around an existing invoker
    pub fn new(config: OrchestratorConfig, invoker: Arc<dyn ServerInvoker>) -> Self {
        let registry = Arc::new(ServerRegistry::new(config.registry.clone()));
        let fusion = Arc::new(DataFusionEngine::new(
            config.fusion.clone(),
            registry.clone(),
            invoker.clone(),
        ));
        let pipeline = Arc::new(EventPipeline::new(config.pipeline.clone()));
        let coordinator = Arc::new(CoordinatorService::new(
            config.coordinator.clone(),
            registry.clone(),
            fusion.clone(),
            pipeline.clone(),
            invoker.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), coordinator.clone()));

        Self {
            config,
            invoker,
            registry,
            fusion,
            pipeline,
            coordinator,
            health,
        }
    }

    /// Pick the transport from configuration: simulated, or HTTP to each
    /// server's endpoint
    pub fn from_config(config: OrchestratorConfig, simulate: bool) -> Result<Self, AppError> {
        let invoker: Arc<dyn ServerInvoker> = if simulate {
            info!("🧪 Using simulated transport for {} servers", config.servers.len());
            Arc::new(SimulatedInvoker::new(config.server_ids(), &config.transport))
        } else {
            let mut endpoints = HashMap::new();
            for server in &config.servers {
                match &server.endpoint {
                    Some(endpoint) => {
                        endpoints.insert(server.id.clone(), endpoint.clone());
                    }
                    None => warn!("⚠️  Server {} has no endpoint and will be unreachable", server.id),
                }
            }
            Arc::new(HttpInvoker::new(&config.transport, endpoints)?)
        };

        Ok(Self::new(config, invoker))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn fusion(&self) -> &Arc<DataFusionEngine> {
        &self.fusion
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    pub fn coordinator(&self) -> &Arc<CoordinatorService> {
        &self.coordinator
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Register every configured server and run the connection handshake.
    /// Fails when a required server cannot be reached.
    pub async fn connect(&self) -> Result<usize, AppError> {
        for record in self.config.records() {
            self.registry.register(record).await;
        }

        let failed_required = self.registry.connect_all(self.invoker.as_ref()).await;
        if !failed_required.is_empty() {
            return Err(AppError::ServerUnavailable(failed_required.join(", ")));
        }

        let connected = self.registry.available().await.len();
        info!("🔗 {}/{} servers connected", connected, self.config.servers.len());
        Ok(connected)
    }

    /// Connect, then start every background loop
    pub async fn start(&self) -> Result<(), AppError> {
        self.connect().await?;

        self.registry.start().await;
        self.pipeline.start().await;
        let producers = self
            .pipeline
            .start_producers(self.registry.clone(), self.invoker.clone())
            .await;
        self.coordinator.start().await;
        self.health.start().await;

        info!("🚀 Orchestrator started with {} event producers", producers);
        Ok(())
    }

    /// Stop in reverse start order
    pub async fn stop(&self) {
        self.health.stop().await;
        self.coordinator.stop().await;
        self.pipeline.stop().await;
        self.registry.stop().await;
        info!("🛑 Orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
            && self.pipeline.is_running()
            && self.coordinator.is_running()
            && self.health.is_running()
    }
}
