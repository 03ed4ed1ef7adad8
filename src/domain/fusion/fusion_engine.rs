//! Data fusion engine - concurrent fan-out and reconciliation

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::conflict::{detect_conflicts, reconcile};
use super::{DataQuality, FusedData, FusionRequest, SourceResponse};
use crate::domain::registry::{ServerInvoker, ServerRecord, ServerRegistry};
use crate::shared::errors::CoordinationError;

/// Fusion engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// Relative spread above which a numeric field counts as a conflict
    pub conflict_threshold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            cache_capacity: 1000,
            conflict_threshold: 0.05, // 5%
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    data: FusedData,
    inserted: Instant,
}

#[derive(Default)]
struct FusionCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
}

impl FusionCache {
    fn get(&self, key: u64, ttl: Duration) -> Option<FusedData> {
        self.entries
            .get(&key)
            .filter(|entry| entry.inserted.elapsed() < ttl)
            .map(|entry| entry.data.clone())
    }

    fn insert(&mut self, key: u64, data: FusedData, capacity: usize) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| *k != key);
        }
        while self.entries.len() >= capacity.max(1) && !self.entries.contains_key(&key) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                data,
                inserted: Instant::now(),
            },
        );
        self.order.push_back(key);
    }
}

/// Answers data requests by querying several capable servers at once and
/// reconciling what they return. Never fails outward.
pub struct DataFusionEngine {
    config: FusionConfig,
    registry: Arc<ServerRegistry>,
    invoker: Arc<dyn ServerInvoker>,
    cache: RwLock<FusionCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DataFusionEngine {
    /// Create new fusion engine
    pub fn new(
        config: FusionConfig,
        registry: Arc<ServerRegistry>,
        invoker: Arc<dyn ServerInvoker>,
    ) -> Self {
        Self {
            config,
            registry,
            invoker,
            cache: RwLock::new(FusionCache::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn request_key(request: &FusionRequest) -> u64 {
        let mut hasher = DefaultHasher::new();
        // Object keys serialize in sorted order, so equal requests hash equally
        serde_json::to_string(request)
            .unwrap_or_else(|_| format!("{:?}", request))
            .hash(&mut hasher);
        hasher.finish()
    }

    pub async fn fuse(&self, request: &FusionRequest) -> FusedData {
        let key = Self::request_key(request);
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);

        if let Some(cached) = self.cache.read().await.get(key, ttl) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Fusion cache hit for {:?}", request.data_type);
            return cached;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fused = self.fuse_uncached(request).await;

        self.cache
            .write()
            .await
            .insert(key, fused.clone(), self.config.cache_capacity);
        fused
    }

    /// Connected servers able to answer, preferred servers boosted by one
    /// priority step, truncated to `max_sources`.
    pub async fn discover_candidates(&self, request: &FusionRequest) -> Vec<(ServerRecord, f64)> {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut candidates: Vec<(u32, f64, ServerRecord)> = Vec::new();

        for capability in &request.required_capabilities {
            for record in self.registry.lookup_by_capability(capability).await {
                if !seen.insert(record.id.clone()) {
                    continue;
                }
                let mut priority = record.priority;
                if request.preferred_servers.contains(&record.id) {
                    priority = priority.saturating_sub(1);
                }
                let reliability = self.registry.reliability_at(&record, now);
                candidates.push((priority, reliability, record));
            }
        }

        candidates.sort_by(|(pa, ra, a), (pb, rb, b)| {
            pa.cmp(pb)
                .then_with(|| rb.total_cmp(ra))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(request.max_sources);

        candidates
            .into_iter()
            .map(|(_, reliability, record)| (record, reliability))
            .collect()
    }

    async fn fuse_uncached(&self, request: &FusionRequest) -> FusedData {
        let candidates = self.discover_candidates(request).await;
        if candidates.is_empty() {
            warn!(
                "⚠️  No connected provider for {:?} ({})",
                request.data_type,
                request.required_capabilities.join(", ")
            );
            return FusedData::invalid("no connected provider for requested capabilities");
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(request.timeout_ms);
        let operation = request.data_type.operation();

        let calls = candidates.iter().enumerate().map(|(rank, (record, reliability))| {
            let invoker = Arc::clone(&self.invoker);
            let parameters = request.parameters.clone();
            let server_id = record.id.clone();
            let reliability = *reliability;
            let timeout_ms = request.timeout_ms;
            async move {
                let outcome = match tokio::time::timeout_at(
                    deadline,
                    invoker.invoke(&server_id, operation, parameters),
                )
                .await
                {
                    Ok(result) => result.map_err(CoordinationError::from),
                    Err(_) => Err(CoordinationError::FetchTimeout(timeout_ms)),
                };
                (server_id, rank, reliability, outcome)
            }
        });

        let mut notes = Vec::new();
        let mut responses = Vec::new();
        for (server_id, rank, reliability, outcome) in join_all(calls).await {
            match outcome {
                Ok(value) => responses.push(SourceResponse {
                    server_id,
                    rank,
                    reliability,
                    value,
                }),
                Err(e) => {
                    debug!("Dropping source {} for {:?}: {}", server_id, request.data_type, e);
                    notes.push(format!("source {} dropped: {}", server_id, e));
                }
            }
        }

        let mut fused = self.combine(request, responses);
        notes.append(&mut fused.notes);
        fused.notes = notes;
        fused
    }

    /// Conflict detection, reconciliation and scoring over collected answers
    pub fn combine(&self, request: &FusionRequest, responses: Vec<SourceResponse>) -> FusedData {
        if responses.is_empty() {
            return FusedData::invalid("every source failed or timed out");
        }

        let threshold = self.config.conflict_threshold;
        let conflicts = detect_conflicts(&responses, threshold);
        let data = reconcile(&responses, request.strategy, threshold);

        let quality = DataQuality::classify(responses.len(), conflicts.len());
        let mean_reliability =
            responses.iter().map(|r| r.reliability).sum::<f64>() / responses.len() as f64;
        let penalty = (0.1 * conflicts.len() as f64).min(0.5);
        let confidence = (mean_reliability - penalty).clamp(0.0, 1.0);

        let mut notes: Vec<String> = conflicts
            .iter()
            .map(|c| {
                CoordinationError::ConflictingData {
                    field: c.field.clone(),
                    spread: c.spread_pct,
                }
                .to_string()
            })
            .collect();
        if quality < request.min_quality {
            notes.push(format!(
                "quality {} below requested floor {}",
                quality, request.min_quality
            ));
        }

        let mut sources: Vec<(usize, String)> = responses
            .iter()
            .map(|r| (r.rank, r.server_id.clone()))
            .collect();
        sources.sort();

        info!(
            "🔀 Fused {:?} from {} sources: quality={} confidence={:.2} conflicts={}",
            request.data_type,
            responses.len(),
            quality,
            confidence,
            conflicts.len()
        );

        FusedData {
            data,
            sources: sources.into_iter().map(|(_, id)| id).collect(),
            quality,
            confidence,
            conflicts_detected: conflicts.len(),
            conflicts,
            notes,
            timestamp: Utc::now(),
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.read().await.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.entries.clear();
        cache.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fusion::{ConflictStrategy, DataType};
    use crate::domain::registry::{Capability, ServerKind};
    use crate::testing::{connected_registry, ScriptedInvoker};
    use serde_json::json;

    fn exchange(id: &str, priority: u32) -> ServerRecord {
        ServerRecord::new(id, id, ServerKind::Exchange)
            .with_capability(Capability::new("exchange_data"))
            .with_priority(priority)
    }

    fn order_book_request() -> FusionRequest {
        FusionRequest::new(DataType::OrderBook, json!({ "pair": "ETH/USDC" }))
            .with_capabilities(&["exchange_data"])
    }

    async fn engine_with(
        records: Vec<ServerRecord>,
        invoker: Arc<ScriptedInvoker>,
    ) -> DataFusionEngine {
        let registry = connected_registry(records).await;
        DataFusionEngine::new(FusionConfig::default(), registry, invoker)
    }

    #[tokio::test]
    async fn test_no_candidates_is_invalid() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let engine = engine_with(vec![], invoker.clone()).await;

        let fused = engine.fuse(&order_book_request()).await;
        assert_eq!(fused.quality, DataQuality::Invalid);
        assert_eq!(fused.confidence, 0.0);
        assert!(fused.sources.is_empty());
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_max_sources_contacts_top_priorities_only() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("p1", "get_order_book", json!({ "price": 100.0 }));
        invoker.reply("p2", "get_order_book", json!({ "price": 103.0 }));
        invoker.reply("p3", "get_order_book", json!({ "price": 250.0 }));
        let engine = engine_with(
            vec![exchange("p3", 3), exchange("p1", 1), exchange("p2", 2)],
            invoker.clone(),
        )
        .await;

        let fused = engine.fuse(&order_book_request().with_max_sources(2)).await;

        let mut contacted = invoker.servers_called("get_order_book");
        contacted.sort();
        assert_eq!(contacted, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(fused.conflicts_detected, 0);
        assert_eq!(fused.data["price"], json!(100.0));
        assert_eq!(fused.sources, vec!["p1".to_string(), "p2".to_string()]);
        assert!(fused.quality >= DataQuality::Good);
    }

    #[tokio::test]
    async fn test_single_differing_field_counts_one_conflict() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_order_book", json!({ "price": 100.0, "depth": 5.0 }));
        invoker.reply("b", "get_order_book", json!({ "price": 120.0, "depth": 5.0 }));
        let engine = engine_with(vec![exchange("a", 1), exchange("b", 2)], invoker).await;

        let fused = engine.fuse(&order_book_request()).await;
        assert_eq!(fused.conflicts_detected, 1);
        assert_eq!(fused.quality, DataQuality::Good);
        // Freshly connected servers score 0.8, one conflict costs 0.1
        assert!((fused.confidence - 0.7).abs() < 1e-9);
        assert!(fused.notes[0].starts_with("Conflicting data for field price: spread"));
    }

    #[tokio::test]
    async fn test_failed_and_slow_sources_are_dropped() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_order_book", json!({ "price": 100.0 }));
        invoker.fail("b", "get_order_book", "boom");
        invoker.delay("c", "get_order_book", 500, json!({ "price": 100.0 }));
        let engine = engine_with(
            vec![exchange("a", 1), exchange("b", 2), exchange("c", 3)],
            invoker,
        )
        .await;

        let fused = engine.fuse(&order_book_request().with_timeout_ms(50)).await;
        assert_eq!(fused.sources, vec!["a".to_string()]);
        assert_eq!(fused.quality, DataQuality::Fair);
        assert_eq!(fused.notes.len(), 2);
        assert!(fused.notes.contains(&"source b dropped: Server reported failure: boom".to_string()));
        assert!(fused
            .notes
            .contains(&format!("source c dropped: {}", CoordinationError::FetchTimeout(50))));
    }

    #[tokio::test]
    async fn test_cache_hit_returns_identical_result() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_order_book", json!({ "price": 100.0 }));
        invoker.reply("b", "get_order_book", json!({ "price": 100.0 }));
        let engine = engine_with(vec![exchange("a", 1), exchange("b", 2)], invoker.clone()).await;

        let first = engine.fuse(&order_book_request()).await;
        let second = engine.fuse(&order_book_request()).await;
        assert_eq!(first, second);
        assert_eq!(invoker.servers_called("get_order_book").len(), 2);

        let stats = engine.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);

        engine.clear_cache().await;
        assert_eq!(engine.cache_stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_preferred_server_is_boosted() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let engine = engine_with(vec![exchange("a", 2), exchange("b", 2)], invoker).await;

        let plain = engine.discover_candidates(&order_book_request().with_max_sources(1)).await;
        assert_eq!(plain[0].0.id, "a");

        let request = order_book_request().with_preferred(&["b"]).with_max_sources(1);
        let candidates = engine.discover_candidates(&request).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.id, "b");
    }

    #[tokio::test]
    async fn test_quality_floor_is_noted() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_order_book", json!({ "price": 100.0 }));
        let engine = engine_with(vec![exchange("a", 1)], invoker).await;

        let request = order_book_request()
            .with_min_quality(DataQuality::Excellent)
            .with_strategy(ConflictStrategy::QualityWeighted);
        let fused = engine.fuse(&request).await;
        assert_eq!(fused.quality, DataQuality::Fair);
        assert!(fused.notes.iter().any(|n| n.contains("below requested floor")));
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let mut cache = FusionCache::default();
        let ttl = Duration::from_secs(60);
        for key in 0..3 {
            cache.insert(key, FusedData::invalid("x"), 2);
        }
        assert!(cache.get(0, ttl).is_none());
        assert!(cache.get(1, ttl).is_some());
        assert!(cache.get(2, ttl).is_some());
    }
}
