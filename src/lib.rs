//! Arbmesh - server orchestration core for a multi-chain arbitrage bot
//! Built with Domain-Driven Design principles

pub mod domain;
pub mod infrastructure;
pub mod application;
pub mod shared;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use application::OrchestratorService;
pub use domain::coordinator::CoordinatorService;
pub use domain::fusion::DataFusionEngine;
pub use domain::health::HealthMonitor;
pub use domain::pipeline::EventPipeline;
pub use domain::registry::ServerRegistry;
