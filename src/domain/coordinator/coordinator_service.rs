//! Coordinator service - the library boundary over registry, fusion and pipeline

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use super::{
    LoadLimits, LoadTracker, ServerLoad, Transaction, TransactionCoordinator, TransactionOperation,
    TransactionResult,
};
use crate::domain::fusion::{ConflictStrategy, DataFusionEngine, DataType, FusedData, FusionRequest};
use crate::domain::pipeline::{EventFilter, EventHandler, EventPipeline};
use crate::domain::registry::{ServerInvoker, ServerRecord, ServerRegistry};
use crate::shared::errors::{CoordinationError, InvokeError};
use crate::shared::types::{EventPriority, StreamType};

/// Relationship lookups count up to this many links
const RELATIONSHIP_CAP: usize = 10;

/// Coordinator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub load_sample_interval_secs: u64,
    pub invoke_timeout_ms: u64,
    pub transaction_timeout_ms: u64,
    pub max_active_requests: usize,
    pub response_time_ceiling_ms: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            load_sample_interval_secs: 10,
            invoke_timeout_ms: 5000,
            transaction_timeout_ms: 30_000,
            max_active_requests: 100,
            response_time_ceiling_ms: 1000.0,
        }
    }
}

/// Outcome of a composite analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub subject: String,
    /// In [0, 1]
    pub opportunity_score: f64,
    pub recommendations: Vec<String>,
    /// Distinct servers behind either fusion result
    pub source_count: usize,
    pub quality_tags: Vec<String>,
    pub relationship_count: usize,
    pub market: FusedData,
    pub price: FusedData,
}

/// Fixed-band recommendation for an opportunity score
pub fn recommendation_for(score: f64) -> &'static str {
    if score >= 0.8 {
        "Strong opportunity: execute with standard position size"
    } else if score >= 0.6 {
        "Moderate opportunity: execute with reduced position size"
    } else if score >= 0.4 {
        "Weak opportunity: monitor before committing capital"
    } else {
        "Avoid: market data confidence too low"
    }
}

/// Coordinates work across the registered servers
pub struct CoordinatorService {
    config: CoordinatorConfig,
    registry: Arc<ServerRegistry>,
    fusion: Arc<DataFusionEngine>,
    pipeline: Arc<EventPipeline>,
    tracker: Arc<LoadTracker>,
    transactions: TransactionCoordinator,
    running: Arc<AtomicBool>,
    sampler_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorService {
    /// Create new coordinator
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ServerRegistry>,
        fusion: Arc<DataFusionEngine>,
        pipeline: Arc<EventPipeline>,
        invoker: Arc<dyn ServerInvoker>,
    ) -> Self {
        let limits = LoadLimits {
            response_time_ceiling_ms: config.response_time_ceiling_ms,
            max_active_requests: config.max_active_requests,
        };
        let tracker = Arc::new(LoadTracker::new(
            registry.clone(),
            invoker,
            limits,
            config.invoke_timeout_ms,
        ));
        let transactions = TransactionCoordinator::new(tracker.clone(), config.transaction_timeout_ms);

        Self {
            config,
            registry,
            fusion,
            pipeline,
            tracker,
            transactions,
            running: Arc::new(AtomicBool::new(false)),
            sampler_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    /// Tracked invocation with the default timeout
    pub async fn invoke(&self, server_id: &str, operation: &str, arguments: Value) -> Result<Value, InvokeError> {
        self.tracker
            .invoke(server_id, operation, arguments, self.config.invoke_timeout_ms)
            .await
    }

    pub async fn best_server(&self, capability: &str) -> Result<ServerRecord, CoordinationError> {
        self.tracker.best_server(capability).await
    }

    pub async fn sample_loads(&self) -> usize {
        self.tracker.sample_all().await
    }

    pub async fn load_of(&self, server_id: &str) -> Option<ServerLoad> {
        self.tracker.load_of(server_id).await
    }

    pub async fn load_snapshot(&self) -> Vec<ServerLoad> {
        self.tracker.snapshot().await
    }

    pub async fn fuse(&self, request: &FusionRequest) -> FusedData {
        self.fusion.fuse(request).await
    }

    pub async fn subscribe(
        &self,
        stream_types: &[StreamType],
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> String {
        self.pipeline.subscribe(stream_types, filter, handler).await
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.pipeline.unsubscribe(id).await
    }

    /// Fuse market and price data with two different strategies, weigh in
    /// the relationship graph and publish the verdict. Never fails.
    pub async fn coordinate_analysis(&self, subject: &str) -> AnalysisReport {
        let parameters = json!({ "symbol": subject });
        let market_request = FusionRequest::new(DataType::MarketData, parameters.clone())
            .with_strategy(ConflictStrategy::MajorityVote)
            .with_timeout_ms(self.config.invoke_timeout_ms);
        let price_request = FusionRequest::new(DataType::PriceData, parameters)
            .with_strategy(ConflictStrategy::QualityWeighted)
            .with_timeout_ms(self.config.invoke_timeout_ms);

        let (market, price, relationship_count) = tokio::join!(
            self.fusion.fuse(&market_request),
            self.fusion.fuse(&price_request),
            self.relationship_count(subject),
        );

        let relationship_score = relationship_count as f64 / RELATIONSHIP_CAP as f64;
        let opportunity_score =
            (0.4 * market.confidence + 0.4 * price.confidence + 0.2 * relationship_score).clamp(0.0, 1.0);

        let mut recommendations = vec![recommendation_for(opportunity_score).to_string()];
        if market.conflicts_detected > 0 || price.conflicts_detected > 0 {
            recommendations.push("Sources disagree on some fields; verify prices before execution".to_string());
        }

        let source_count = market
            .sources
            .iter()
            .chain(price.sources.iter())
            .collect::<BTreeSet<_>>()
            .len();

        let report = AnalysisReport {
            subject: subject.to_string(),
            opportunity_score,
            recommendations,
            source_count,
            quality_tags: vec![market.quality.to_string(), price.quality.to_string()],
            relationship_count,
            market,
            price,
        };

        info!(
            "🔍 Analysis of {}: score {:.2} from {} sources",
            subject, report.opportunity_score, report.source_count
        );

        let payload = json!({
            "subject": report.subject,
            "opportunity_score": report.opportunity_score,
            "recommendations": report.recommendations,
            "quality": report.quality_tags,
        });
        if let Err(e) = self
            .pipeline
            .publish("coordinator", StreamType::ArbitrageSignals, payload, EventPriority::High, None)
            .await
        {
            warn!("⚠️  Analysis signal for {} not published: {}", subject, e);
        }

        report
    }

    async fn relationship_count(&self, subject: &str) -> usize {
        let server = match self.tracker.best_server(DataType::Relationships.capability()).await {
            Ok(server) => server,
            Err(e) => {
                debug!("Relationship lookup skipped: {}", e);
                return 0;
            }
        };

        let reply = self
            .invoke(
                &server.id,
                DataType::Relationships.operation(),
                json!({ "query": subject }),
            )
            .await;

        let count = match reply {
            Ok(Value::Array(items)) => items.len(),
            Ok(Value::Object(map)) => match map.get("relationships") {
                Some(Value::Array(items)) => items.len(),
                _ => map.get("count").and_then(Value::as_u64).unwrap_or(0) as usize,
            },
            Ok(_) => 0,
            Err(e) => {
                warn!("⚠️  Relationship lookup on {} failed: {}", server.id, e);
                0
            }
        };
        count.min(RELATIONSHIP_CAP)
    }

    /// Run an all-or-nothing transaction; always returns a terminal result
    pub async fn coordinate_transaction(&self, operations: Vec<TransactionOperation>) -> TransactionResult {
        self.transactions.coordinate(operations).await
    }

    pub async fn active_transactions(&self) -> Vec<Transaction> {
        self.transactions.active_transactions().await
    }

    /// Start the load sampler
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transactions.resume();

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(coordinator.config.load_sample_interval_secs.max(1)));
            while coordinator.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let sampled = coordinator.tracker.sample_all().await;
                debug!("Load sampler refreshed {} servers", sampled);
            }
        });

        *self.sampler_task.lock().await = Some(handle);
        info!("🚀 Coordinator load sampler started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.transactions.shutdown();
        if let Some(handle) = self.sampler_task.lock().await.take() {
            handle.abort();
        }
        info!("🛑 Coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
