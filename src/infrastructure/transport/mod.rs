//! `ServerInvoker` adapters, one per transport

mod http_invoker;
mod simulated_invoker;

pub use http_invoker::HttpInvoker;
pub use simulated_invoker::SimulatedInvoker;

use serde::Deserialize;

/// Transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub request_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
    /// Probability that a simulated call fails, in [0, 1)
    pub simulated_failure_rate: f64,
    /// Upper bound of simulated latency
    pub simulated_latency_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            pool_max_idle_per_host: 10,
            simulated_failure_rate: 0.02,
            simulated_latency_ms: 50,
        }
    }
}
