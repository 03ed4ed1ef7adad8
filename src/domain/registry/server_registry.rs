//! Server registry - in-memory catalog with capability/kind/tag indices

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use super::{invoke_with_timeout, ServerInvoker, ServerKind, ServerRecord, ServerStatus};
use crate::shared::errors::AppError;

/// Registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Connected records not seen for this long are downgraded
    pub staleness_secs: u64,
    pub sweep_interval_secs: u64,
    /// Records connected for less than this are considered less reliable
    pub warmup_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 300,    // 5 minutes
            sweep_interval_secs: 60,
            warmup_secs: 300,       // 5 minutes
            connect_timeout_ms: 5000,
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_servers: usize,
    pub by_status: BTreeMap<ServerStatus, usize>,
    pub capabilities: usize,
    pub kinds: usize,
    pub tags: usize,
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<String, ServerRecord>,
    by_capability: HashMap<String, Vec<String>>,
    by_kind: HashMap<ServerKind, Vec<String>>,
    by_tag: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn rebuild_indices(&mut self) {
        self.by_capability.clear();
        self.by_kind.clear();
        self.by_tag.clear();

        for (id, record) in &self.servers {
            for capability in &record.capabilities {
                self.by_capability
                    .entry(capability.name.clone())
                    .or_default()
                    .push(id.clone());
            }
            self.by_kind
                .entry(record.kind.clone())
                .or_default()
                .push(id.clone());
            for tag in &record.tags {
                self.by_tag.entry(tag.clone()).or_default().push(id.clone());
            }
        }
    }
}

/// Catalog of known servers.
///
/// Records are created by `register` and mutated only through status
/// updates; they are never removed.
pub struct ServerRegistry {
    config: RegistryConfig,
    state: Arc<RwLock<RegistryState>>,
    running: Arc<AtomicBool>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRegistry {
    /// Create new registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(RegistryState::default())),
            running: Arc::new(AtomicBool::new(false)),
            sweep_task: Mutex::new(None),
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert or overwrite a record and rebuild every index before returning
    pub async fn register(&self, record: ServerRecord) {
        let mut state = self.state.write().await;
        let id = record.id.clone();
        if state.servers.insert(id.clone(), record).is_some() {
            warn!("♻️  Server {} re-registered, previous record overwritten", id);
        } else {
            info!("📝 Registered server {}", id);
        }
        state.rebuild_indices();
    }

    pub async fn get(&self, id: &str) -> Option<ServerRecord> {
        self.state.read().await.servers.get(id).cloned()
    }

    /// All records ordered by id
    pub async fn all(&self) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        let mut records: Vec<ServerRecord> = state.servers.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn lookup_by_capability(&self, capability: &str) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        let ids = state.by_capability.get(capability).cloned().unwrap_or_default();
        self.ordered_connected(&state, &ids, Utc::now())
    }

    pub async fn lookup_by_kind(&self, kind: &ServerKind) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        let ids = state.by_kind.get(kind).cloned().unwrap_or_default();
        self.ordered_connected(&state, &ids, Utc::now())
    }

    pub async fn lookup_by_tag(&self, tag: &str) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        let ids = state.by_tag.get(tag).cloned().unwrap_or_default();
        self.ordered_connected(&state, &ids, Utc::now())
    }

    /// Every Connected record, in retrieval order
    pub async fn available(&self) -> Vec<ServerRecord> {
        let state = self.state.read().await;
        let ids: Vec<String> = state.servers.keys().cloned().collect();
        self.ordered_connected(&state, &ids, Utc::now())
    }

    fn ordered_connected(
        &self,
        state: &RegistryState,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Vec<ServerRecord> {
        let mut matches: Vec<(f64, ServerRecord)> = ids
            .iter()
            .filter_map(|id| state.servers.get(id))
            .filter(|record| record.is_connected())
            .map(|record| (self.reliability_at(record, now), record.clone()))
            .collect();

        matches.sort_by(|(rel_a, a), (rel_b, b)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| rel_b.total_cmp(rel_a))
                .then_with(|| a.id.cmp(&b.id))
        });

        matches.into_iter().map(|(_, record)| record).collect()
    }

    /// Reliability of a server in [0.08, 1.0]; unknown ids score 0
    pub async fn reliability(&self, id: &str) -> f64 {
        let state = self.state.read().await;
        state
            .servers
            .get(id)
            .map(|record| self.reliability_at(record, Utc::now()))
            .unwrap_or(0.0)
    }

    /// 20% off per recent connection failure floored at 0.1, then 20% off
    /// again while the server is still inside its warm-up window.
    pub fn reliability_at(&self, record: &ServerRecord, now: DateTime<Utc>) -> f64 {
        let mut reliability = (1.0 - 0.2 * record.connection_attempts as f64).max(0.1);

        if record.is_connected() {
            if let Some(uptime_start) = record.uptime_start {
                let warmup = ChronoDuration::seconds(self.config.warmup_secs as i64);
                if now - uptime_start < warmup {
                    reliability *= 0.8;
                }
            }
        }

        reliability
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: ServerStatus,
        error: Option<String>,
    ) -> Result<(), AppError> {
        self.update_status_at(id, status, error, Utc::now()).await
    }

    pub async fn update_status_at(
        &self,
        id: &str,
        status: ServerStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let record = state
            .servers
            .get_mut(id)
            .ok_or_else(|| AppError::RegistryError(format!("unknown server: {}", id)))?;

        let previous = record.status;
        record.last_seen = Some(now);

        match status {
            ServerStatus::Connected => {
                if previous != ServerStatus::Connected {
                    record.connection_attempts = 0;
                    record.uptime_start = Some(now);
                    record.last_error = None;
                }
            }
            ServerStatus::Error => {
                record.connection_attempts += 1;
                record.last_error = error;
            }
            ServerStatus::Unknown
            | ServerStatus::Connecting
            | ServerStatus::Disconnected
            | ServerStatus::Maintenance => {
                if error.is_some() {
                    record.last_error = error;
                }
            }
        }
        record.status = status;

        if previous != status {
            match status {
                ServerStatus::Error => warn!(
                    "⚠️  Server {} {} -> {} ({})",
                    id,
                    previous,
                    status,
                    record.last_error.as_deref().unwrap_or("no detail")
                ),
                _ => info!("🔄 Server {} {} -> {}", id, previous, status),
            }
        }
        Ok(())
    }

    /// Downgrade every live record whose last-seen time is older than the
    /// staleness window. Liveness only; nothing is probed.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let staleness = ChronoDuration::seconds(self.config.staleness_secs as i64);
        let mut state = self.state.write().await;
        let mut downgraded = Vec::new();

        for record in state.servers.values_mut() {
            let live = matches!(
                record.status,
                ServerStatus::Connected | ServerStatus::Connecting
            );
            if !live {
                continue;
            }
            if let Some(last_seen) = record.last_seen {
                if now - last_seen > staleness {
                    warn!(
                        "⏰ Server {} silent since {}, marking disconnected",
                        record.id, last_seen
                    );
                    record.status = ServerStatus::Disconnected;
                    downgraded.push(record.id.clone());
                }
            }
        }

        downgraded.sort();
        downgraded
    }

    /// Ping every registered server once. Returns the ids of required
    /// servers that could not be reached.
    pub async fn connect_all(&self, invoker: &dyn ServerInvoker) -> Vec<String> {
        let mut failed_required = Vec::new();

        for record in self.all().await {
            // Ids come from the registry itself, updates cannot miss
            let _ = self
                .update_status(&record.id, ServerStatus::Connecting, None)
                .await;

            let outcome = invoke_with_timeout(
                invoker,
                &record.id,
                "ping",
                serde_json::json!({}),
                self.config.connect_timeout_ms,
            )
            .await;

            match outcome {
                Ok(_) => {
                    let _ = self
                        .update_status(&record.id, ServerStatus::Connected, None)
                        .await;
                }
                Err(e) => {
                    let _ = self
                        .update_status(&record.id, ServerStatus::Error, Some(e.to_string()))
                        .await;
                    if record.required {
                        failed_required.push(record.id.clone());
                    }
                }
            }
        }

        failed_required
    }

    pub async fn statistics(&self) -> RegistryStats {
        let state = self.state.read().await;
        let mut by_status = BTreeMap::new();
        for record in state.servers.values() {
            *by_status.entry(record.status).or_insert(0) += 1;
        }
        RegistryStats {
            total_servers: state.servers.len(),
            by_status,
            capabilities: state.by_capability.len(),
            kinds: state.by_kind.len(),
            tags: state.by_tag.len(),
        }
    }

    /// Start the background liveness sweep
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(registry.config.sweep_interval_secs.max(1)));
            ticker.tick().await;

            while registry.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let downgraded = registry.sweep_stale(Utc::now()).await;
                if !downgraded.is_empty() {
                    debug!("Liveness sweep downgraded {} servers", downgraded.len());
                }
            }
        });

        *self.sweep_task.lock().await = Some(handle);
        info!("🚀 Registry liveness sweep started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
        }
        info!("🛑 Registry liveness sweep stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::Capability;
    use crate::testing::ScriptedInvoker;

    fn exchange(id: &str, priority: u32) -> ServerRecord {
        ServerRecord::new(id, id, ServerKind::Exchange)
            .with_capability(Capability::new("exchange_data"))
            .with_priority(priority)
            .with_tag("cex")
    }

    #[tokio::test]
    async fn test_lookup_orders_by_priority_and_skips_disconnected() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("c", 3)).await;
        registry.register(exchange("a", 1)).await;
        registry.register(exchange("b", 2)).await;

        for id in ["a", "b", "c"] {
            registry.update_status(id, ServerStatus::Connected, None).await.unwrap();
        }
        registry.update_status("b", ServerStatus::Disconnected, None).await.unwrap();

        let ids: Vec<String> = registry
            .lookup_by_capability("exchange_data")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);

        let by_tag = registry.lookup_by_tag("cex").await;
        assert!(by_tag.iter().all(|r| r.is_connected()));
        assert_eq!(registry.lookup_by_kind(&ServerKind::Exchange).await.len(), 2);
        assert!(registry.lookup_by_capability("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_equal_priority_prefers_reliable_server() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("fresh", 1)).await;
        registry.register(exchange("seasoned", 1)).await;

        let long_ago = Utc::now() - ChronoDuration::minutes(30);
        registry
            .update_status_at("seasoned", ServerStatus::Connected, None, long_ago)
            .await
            .unwrap();
        registry.update_status("fresh", ServerStatus::Connected, None).await.unwrap();

        let ids: Vec<String> = registry
            .lookup_by_capability("exchange_data")
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["seasoned".to_string(), "fresh".to_string()]);
        assert!((registry.reliability("fresh").await - 0.8).abs() < 1e-9);
        assert!((registry.reliability("seasoned").await - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_status_updates_track_attempts() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("a", 1)).await;

        for _ in 0..3 {
            registry
                .update_status("a", ServerStatus::Error, Some("refused".to_string()))
                .await
                .unwrap();
        }
        let record = registry.get("a").await.unwrap();
        assert_eq!(record.connection_attempts, 3);
        assert_eq!(record.last_error.as_deref(), Some("refused"));
        assert!((registry.reliability_at(&record, Utc::now()) - 0.4).abs() < 1e-9);

        for _ in 0..5 {
            registry.update_status("a", ServerStatus::Error, None).await.unwrap();
        }
        let record = registry.get("a").await.unwrap();
        assert!((registry.reliability_at(&record, Utc::now()) - 0.1).abs() < 1e-9);

        registry.update_status("a", ServerStatus::Connected, None).await.unwrap();
        let record = registry.get("a").await.unwrap();
        assert_eq!(record.connection_attempts, 0);
        assert!(record.uptime_start.is_some());
        assert!(record.last_seen.is_some());

        assert!(registry
            .update_status("missing", ServerStatus::Connected, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reregister_overwrites_and_reindexes() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("a", 1)).await;
        registry.update_status("a", ServerStatus::Connected, None).await.unwrap();

        let replacement = ServerRecord::new("a", "a", ServerKind::Analytics)
            .with_capability(Capability::new("analytics"));
        registry.register(replacement).await;

        assert!(registry.lookup_by_capability("exchange_data").await.is_empty());
        assert_eq!(registry.all().await.len(), 1);
        let stats = registry.statistics().await;
        assert_eq!(stats.total_servers, 1);
        assert_eq!(stats.capabilities, 1);
        assert_eq!(stats.tags, 0);
    }

    #[tokio::test]
    async fn test_sweep_downgrades_stale_records() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("stale", 1)).await;
        registry.register(exchange("live", 1)).await;

        let now = Utc::now();
        registry
            .update_status_at("stale", ServerStatus::Connected, None, now - ChronoDuration::minutes(6))
            .await
            .unwrap();
        registry
            .update_status_at("live", ServerStatus::Connected, None, now - ChronoDuration::minutes(1))
            .await
            .unwrap();

        let downgraded = registry.sweep_stale(now).await;
        assert_eq!(downgraded, vec!["stale".to_string()]);
        assert_eq!(registry.get("stale").await.unwrap().status, ServerStatus::Disconnected);
        assert_eq!(registry.available().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_all_reports_required_failures() {
        let registry = ServerRegistry::new_default();
        registry.register(exchange("ok", 1)).await;
        registry.register(exchange("down", 2).required()).await;
        registry.register(exchange("optional_down", 3)).await;

        let invoker = ScriptedInvoker::new();
        invoker.fail("down", "ping", "connection refused");
        invoker.fail("optional_down", "ping", "connection refused");

        let failed = registry.connect_all(&invoker).await;
        assert_eq!(failed, vec!["down".to_string()]);
        assert_eq!(registry.get("ok").await.unwrap().status, ServerStatus::Connected);
        assert_eq!(registry.get("down").await.unwrap().status, ServerStatus::Error);
    }
}
