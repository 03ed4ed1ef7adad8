//! Coordinator domain - load balancing, composite analysis and transactions

mod coordinator_service;
mod load_balancer;
mod transaction;

pub use coordinator_service::{AnalysisReport, CoordinatorConfig, CoordinatorService};
pub use load_balancer::LoadTracker;
pub use transaction::TransactionCoordinator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Normalization ceilings for the load score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadLimits {
    pub response_time_ceiling_ms: f64,
    pub max_active_requests: usize,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            response_time_ceiling_ms: 1000.0,
            max_active_requests: 100,
        }
    }
}

/// Point-in-time load gauges of one server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerLoad {
    pub server_id: String,
    /// Percent, 0-100
    pub cpu_usage: f64,
    /// Percent, 0-100
    pub memory_usage: f64,
    pub response_time_ms: f64,
    pub active_requests: usize,
    /// Fraction of tracked invocations that failed
    pub error_rate: f64,
    /// Mean of the normalized components, in [0, 1]
    pub load_score: f64,
    pub sampled_at: DateTime<Utc>,
}

impl ServerLoad {
    pub fn new(
        server_id: impl Into<String>,
        cpu_usage: f64,
        memory_usage: f64,
        response_time_ms: f64,
        active_requests: usize,
        error_rate: f64,
        limits: &LoadLimits,
    ) -> Self {
        let components = [
            (cpu_usage / 100.0).clamp(0.0, 1.0),
            (memory_usage / 100.0).clamp(0.0, 1.0),
            (response_time_ms / limits.response_time_ceiling_ms.max(1.0)).clamp(0.0, 1.0),
            (active_requests as f64 / limits.max_active_requests.max(1) as f64).clamp(0.0, 1.0),
            error_rate.clamp(0.0, 1.0),
        ];
        let load_score = components.iter().sum::<f64>() / components.len() as f64;

        Self {
            server_id: server_id.into(),
            cpu_usage,
            memory_usage,
            response_time_ms,
            active_requests,
            error_rate,
            load_score,
            sampled_at: Utc::now(),
        }
    }
}

/// One participant step of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOperation {
    pub server_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

impl TransactionOperation {
    pub fn new(server_id: impl Into<String>, action: impl Into<String>, parameters: Value) -> Self {
        Self {
            server_id: server_id.into(),
            action: action.into(),
            parameters,
        }
    }
}

/// Transaction state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Preparing,
    Prepared,
    Executing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        match self {
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed => true,
            TransactionState::Preparing
            | TransactionState::Prepared
            | TransactionState::Executing
            | TransactionState::Committing
            | TransactionState::RollingBack => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Executing => "executing",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked multi-participant transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<TransactionOperation>,
    pub state: TransactionState,
    pub results: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// What the caller of a transaction always receives
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub success: bool,
    pub final_state: TransactionState,
    pub results: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
    /// Participants compensated, in the order they were rolled back
    pub rolled_back: Vec<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_score_is_mean_of_normalized_components() {
        let limits = LoadLimits::default();
        let load = ServerLoad::new("a", 50.0, 50.0, 500.0, 50, 0.5, &limits);
        assert!((load.load_score - 0.5).abs() < 1e-12);

        let saturated = ServerLoad::new("b", 150.0, 100.0, 9000.0, 500, 2.0, &limits);
        assert!((saturated.load_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
        assert!(TransactionState::Failed.is_terminal());
        assert!(!TransactionState::RollingBack.is_terminal());
        assert!(!TransactionState::Prepared.is_terminal());
    }
}
