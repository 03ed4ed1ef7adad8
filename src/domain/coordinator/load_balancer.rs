//! Load tracking and least-loaded server selection

use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{LoadLimits, ServerLoad};
use crate::domain::registry::{invoke_with_timeout, ServerInvoker, ServerRecord, ServerRegistry, ServerStatus};
use crate::shared::errors::{CoordinationError, InvokeError};

/// Score assumed for a server that has never been sampled
const UNKNOWN_LOAD_SCORE: f64 = 0.5;

#[derive(Debug, Default, Clone)]
struct InvocationCounters {
    active: usize,
    calls: u64,
    errors: u64,
    last_response_ms: f64,
}

impl InvocationCounters {
    fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

/// Releases the in-flight slot even when the invoking future is dropped
struct InFlight<'a> {
    counters: &'a Mutex<HashMap<String, InvocationCounters>>,
    server_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = counters.get_mut(self.server_id) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

/// Tracks per-server invocation accounting and the latest load samples
pub struct LoadTracker {
    registry: Arc<ServerRegistry>,
    invoker: Arc<dyn ServerInvoker>,
    limits: LoadLimits,
    invoke_timeout_ms: u64,
    counters: Mutex<HashMap<String, InvocationCounters>>,
    loads: RwLock<HashMap<String, ServerLoad>>,
}

impl LoadTracker {
    /// Create new load tracker
    pub fn new(
        registry: Arc<ServerRegistry>,
        invoker: Arc<dyn ServerInvoker>,
        limits: LoadLimits,
        invoke_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            invoker,
            limits,
            invoke_timeout_ms,
            counters: Mutex::new(HashMap::new()),
            loads: RwLock::new(HashMap::new()),
        }
    }

    pub fn invoke_timeout_ms(&self) -> u64 {
        self.invoke_timeout_ms
    }

    /// Invoke through the shared invoker with accounting
    pub async fn invoke(
        &self,
        server_id: &str,
        operation: &str,
        arguments: Value,
        timeout_ms: u64,
    ) -> Result<Value, InvokeError> {
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.entry(server_id.to_string()).or_default().active += 1;
        }
        let _in_flight = InFlight {
            counters: &self.counters,
            server_id,
        };

        let started = Instant::now();
        let result = invoke_with_timeout(self.invoker.as_ref(), server_id, operation, arguments, timeout_ms).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry(server_id.to_string()).or_default();
        entry.calls += 1;
        entry.last_response_ms = elapsed_ms;
        if result.is_err() {
            entry.errors += 1;
        }

        result
    }

    /// In-flight invocations for one server
    pub fn active_requests(&self, server_id: &str) -> usize {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(server_id).map(|c| c.active).unwrap_or(0)
    }

    fn counters_for(&self, server_id: &str) -> InvocationCounters {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(server_id).cloned().unwrap_or_default()
    }

    /// Synthetic cpu/memory gauges derived from request utilization
    fn synthetic_gauges(&self, counters: &InvocationCounters) -> (f64, f64) {
        let utilization =
            (counters.active as f64 / self.limits.max_active_requests.max(1) as f64).clamp(0.0, 1.0);
        let mut rng = rand::thread_rng();
        let cpu = (20.0 + 60.0 * utilization + rng.gen_range(-5.0..5.0)).clamp(0.0, 100.0);
        let memory = (30.0 + 50.0 * utilization + rng.gen_range(-5.0..5.0)).clamp(0.0, 100.0);
        (cpu, memory)
    }

    /// Sample one connected server. A successful `get_load` refreshes its
    /// liveness; a failure marks it Error and forgets its last sample.
    pub async fn sample_server(&self, record: &ServerRecord) -> Option<ServerLoad> {
        let before = self.counters_for(&record.id);
        let (synthetic_cpu, synthetic_memory) = self.synthetic_gauges(&before);

        let reply = self
            .invoke(&record.id, "get_load", json!({}), self.invoke_timeout_ms)
            .await;

        match reply {
            Ok(reply) => {
                let counters = self.counters_for(&record.id);
                let cpu = reply.get("cpu_usage").and_then(Value::as_f64).unwrap_or(synthetic_cpu);
                let memory = reply
                    .get("memory_usage")
                    .and_then(Value::as_f64)
                    .unwrap_or(synthetic_memory);
                let load = ServerLoad::new(
                    record.id.clone(),
                    cpu,
                    memory,
                    counters.last_response_ms,
                    counters.active,
                    counters.error_rate(),
                    &self.limits,
                );

                let _ = self
                    .registry
                    .update_status(&record.id, ServerStatus::Connected, None)
                    .await;
                self.loads.write().await.insert(record.id.clone(), load.clone());
                Some(load)
            }
            Err(e) => {
                warn!("⚠️  Load sample failed for {}: {}", record.id, e);
                let _ = self
                    .registry
                    .update_status(&record.id, ServerStatus::Error, Some(e.to_string()))
                    .await;
                self.loads.write().await.remove(&record.id);
                None
            }
        }
    }

    /// Ping a server that is not connected; success reconnects it
    async fn probe_reconnect(&self, record: &ServerRecord) -> bool {
        match self
            .invoke(&record.id, "ping", json!({}), self.invoke_timeout_ms)
            .await
        {
            Ok(_) => {
                let _ = self
                    .registry
                    .update_status(&record.id, ServerStatus::Connected, None)
                    .await;
                debug!("Server {} reconnected", record.id);
                true
            }
            Err(e) => {
                debug!("Server {} still unreachable: {}", record.id, e);
                false
            }
        }
    }

    /// One sampler pass over the whole registry. Returns the number of
    /// servers sampled successfully.
    pub async fn sample_all(&self) -> usize {
        let mut sampled = 0;
        for record in self.registry.all().await {
            match record.status {
                ServerStatus::Maintenance => continue,
                ServerStatus::Connected => {
                    if self.sample_server(&record).await.is_some() {
                        sampled += 1;
                    }
                }
                ServerStatus::Unknown
                | ServerStatus::Connecting
                | ServerStatus::Disconnected
                | ServerStatus::Error => {
                    self.probe_reconnect(&record).await;
                }
            }
        }
        sampled
    }

    /// Least-loaded connected server with the capability. Servers never
    /// sampled count as half loaded; ties keep registry order.
    pub async fn best_server(&self, capability: &str) -> Result<ServerRecord, CoordinationError> {
        let candidates = self.registry.lookup_by_capability(capability).await;
        let loads = self.loads.read().await;

        let mut best: Option<(ServerRecord, f64)> = None;
        for record in candidates {
            let score = loads
                .get(&record.id)
                .map(|l| l.load_score)
                .unwrap_or(UNKNOWN_LOAD_SCORE);
            let better = match &best {
                Some((_, best_score)) => score < *best_score,
                None => true,
            };
            if better {
                best = Some((record, score));
            }
        }

        best.map(|(record, _)| record)
            .ok_or_else(|| CoordinationError::ProviderUnavailable(capability.to_string()))
    }

    pub async fn load_of(&self, server_id: &str) -> Option<ServerLoad> {
        self.loads.read().await.get(server_id).cloned()
    }

    /// Latest samples ordered by server id
    pub async fn snapshot(&self) -> Vec<ServerLoad> {
        let mut loads: Vec<ServerLoad> = self.loads.read().await.values().cloned().collect();
        loads.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        loads
    }
}
