//! Bounded event queue feeding a single batch-processing loop

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::{
    EventFilter, EventHandler, EventProducer, StreamEvent, StreamProcessor, Subscription,
    SubscriptionInfo,
};
use crate::domain::registry::{ServerInvoker, ServerRegistry};
use crate::shared::errors::PipelineError;
use crate::shared::types::{EventPriority, StreamType};
use crate::shared::utils::generate_id;

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Queue occupancy ratio at which new events are dropped
    pub backpressure_threshold: f64,
    pub history_size: usize,
    pub producer_interval_ms: u64,
    pub producer_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 100,
            backpressure_threshold: 0.8,
            history_size: 1000,
            producer_interval_ms: 1000,
            producer_timeout_ms: 2000,
        }
    }
}

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub events_emitted: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub batches_processed: u64,
    pub processor_failures: u64,
    pub subscriber_failures: u64,
    /// Most recent processor or subscriber failure
    pub last_failure: Option<PipelineError>,
    /// Events shed per stream type because the queue was saturated
    pub backpressure: BTreeMap<StreamType, u64>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_subscriptions: usize,
}

/// Real-time event pipeline.
///
/// Producers call `emit`/`publish` and are never blocked: once the queue is
/// at or above the backpressure threshold the newest event is dropped. A
/// single loop drains the queue in batches.
pub struct EventPipeline {
    config: PipelineConfig,
    sender: mpsc::Sender<StreamEvent>,
    receiver: Mutex<mpsc::Receiver<StreamEvent>>,
    processors: RwLock<HashMap<StreamType, Arc<dyn StreamProcessor>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<StreamEvent>>,
    sequences: Mutex<HashMap<String, u64>>,
    stats: Mutex<PipelineStats>,
    running: Arc<AtomicBool>,
    batch_task: Mutex<Option<JoinHandle<()>>>,
    producer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventPipeline {
    /// Create new pipeline
    pub fn new(config: PipelineConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            sender,
            receiver: Mutex::new(receiver),
            processors: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            sequences: Mutex::new(HashMap::new()),
            stats: Mutex::new(PipelineStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            batch_task: Mutex::new(None),
            producer_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(PipelineConfig::default())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Enqueue an event, or drop it when the queue is saturated
    pub async fn emit(&self, event: StreamEvent) -> Result<(), PipelineError> {
        let capacity = self.sender.max_capacity();
        let occupancy = self.queue_depth() as f64 / capacity as f64;
        let stream_type = event.stream_type;

        if occupancy >= self.config.backpressure_threshold {
            self.record_drop(stream_type).await;
            debug!(
                "Backpressure: dropped {} event from {} (occupancy {:.0}%)",
                stream_type,
                event.source,
                occupancy * 100.0
            );
            return Err(PipelineError::Backpressure(stream_type));
        }

        match self.sender.try_send(event) {
            Ok(()) => {
                self.stats.lock().await.events_emitted += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.record_drop(stream_type).await;
                Err(PipelineError::Backpressure(stream_type))
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.lock().await.events_dropped += 1;
                Err(PipelineError::Stopped)
            }
        }
    }

    async fn record_drop(&self, stream_type: StreamType) {
        let mut stats = self.stats.lock().await;
        stats.events_dropped += 1;
        *stats.backpressure.entry(stream_type).or_insert(0) += 1;
    }

    /// Build an event with the producer's next sequence number and emit it
    pub async fn publish(
        &self,
        source: &str,
        stream_type: StreamType,
        payload: Value,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> Result<u64, PipelineError> {
        let sequence = {
            let mut sequences = self.sequences.lock().await;
            let next = sequences.entry(source.to_string()).or_insert(0);
            *next += 1;
            *next
        };

        let mut event = StreamEvent::new(stream_type, source, payload)
            .with_priority(priority)
            .with_sequence(sequence);
        event.correlation_id = correlation_id;

        self.emit(event).await.map(|_| sequence)
    }

    pub async fn register_processor(&self, stream_type: StreamType, processor: Arc<dyn StreamProcessor>) {
        self.processors.write().await.insert(stream_type, processor);
        info!("🧩 Registered processor for {}", stream_type);
    }

    /// Subscribe to stream types; an empty set subscribes to every type
    pub async fn subscribe(
        &self,
        stream_types: &[StreamType],
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> String {
        let id = generate_id();
        let subscription = Subscription {
            id: id.clone(),
            stream_types: stream_types.iter().copied().collect::<BTreeSet<_>>(),
            filter,
            handler,
            active: true,
            last_event: None,
            event_count: 0,
        };
        self.subscriptions.write().await.push(subscription);
        info!("📡 Subscription {} created for {:?}", id, stream_types);
        id
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        let removed = subscriptions.len() < before;
        if removed {
            info!("📴 Subscription {} removed", id);
        }
        removed
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions.read().await.iter().map(Subscription::info).collect()
    }

    /// Most recent `limit` events, oldest first
    pub async fn recent_events(&self, limit: usize) -> Vec<StreamEvent> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn statistics(&self) -> PipelineStats {
        let mut stats = self.stats.lock().await.clone();
        stats.queue_depth = self.queue_depth();
        stats.queue_capacity = self.sender.max_capacity();
        stats.active_subscriptions = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.active)
            .count();
        stats
    }

    /// Wait up to the flush interval for a first event, then drain without
    /// waiting until the batch is full.
    async fn next_batch(&self, receiver: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut batch = Vec::new();
        let flush = Duration::from_millis(self.config.flush_interval_ms);

        match timeout(flush, receiver.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) | Err(_) => return batch,
        }

        while batch.len() < self.config.batch_size.max(1) {
            match receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    /// Record, route to processors by type, then notify subscribers in event order
    pub async fn process_batch(&self, events: Vec<StreamEvent>) {
        if events.is_empty() {
            return;
        }

        {
            let mut history = self.history.write().await;
            for event in &events {
                history.push_back(event.clone());
                while history.len() > self.config.history_size {
                    history.pop_front();
                }
            }
        }

        let mut groups: BTreeMap<StreamType, Vec<StreamEvent>> = BTreeMap::new();
        for event in &events {
            groups.entry(event.stream_type).or_default().push(event.clone());
        }

        let mut failures = Vec::new();
        let mut processor_failures = 0;
        for (stream_type, group) in &groups {
            let processor = self.processors.read().await.get(stream_type).cloned();
            if let Some(processor) = processor {
                if let Err(e) = processor.process(*stream_type, group).await {
                    let failure = PipelineError::Processor(format!("{}: {}", stream_type, e));
                    warn!("⚠️  {}", failure);
                    failures.push(failure);
                    processor_failures += 1;
                }
            }
        }

        let mut subscriber_failures = 0;
        {
            let mut subscriptions = self.subscriptions.write().await;
            for event in &events {
                for subscription in subscriptions.iter_mut().filter(|s| s.wants(event)) {
                    let handler = Arc::clone(&subscription.handler);
                    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                        Ok(Ok(())) => {
                            subscription.event_count += 1;
                            subscription.last_event = Some(Utc::now());
                        }
                        Ok(Err(e)) => {
                            let failure =
                                PipelineError::Subscriber(format!("{} on {}: {}", subscription.id, event.id, e));
                            warn!("⚠️  {}", failure);
                            failures.push(failure);
                            subscriber_failures += 1;
                        }
                        Err(_) => {
                            let failure =
                                PipelineError::Subscriber(format!("{} panicked on {}", subscription.id, event.id));
                            warn!("⚠️  {}", failure);
                            failures.push(failure);
                            subscriber_failures += 1;
                        }
                    }
                }
            }
        }

        let mut stats = self.stats.lock().await;
        stats.events_processed += events.len() as u64;
        stats.batches_processed += 1;
        stats.processor_failures += processor_failures;
        stats.subscriber_failures += subscriber_failures;
        if let Some(failure) = failures.pop() {
            stats.last_failure = Some(failure);
        }
    }

    /// Start the batch loop
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut receiver = pipeline.receiver.lock().await;
            while pipeline.running.load(Ordering::SeqCst) {
                let batch = pipeline.next_batch(&mut receiver).await;
                pipeline.process_batch(batch).await;
            }
        });

        *self.batch_task.lock().await = Some(handle);
        info!("🚀 Event pipeline started (capacity {})", self.sender.max_capacity());
    }

    /// Spawn one producer per registered real-time server. Producers run
    /// while the pipeline is running.
    pub async fn start_producers(
        self: &Arc<Self>,
        registry: Arc<ServerRegistry>,
        invoker: Arc<dyn ServerInvoker>,
    ) -> usize {
        let mut tasks = self.producer_tasks.lock().await;
        for record in registry.all().await {
            let producer = EventProducer::for_record(
                &record,
                Arc::clone(self),
                Arc::clone(&registry),
                Arc::clone(&invoker),
            );
            if let Some(producer) = producer {
                info!(
                    "📡 Producer started for {} ({:?})",
                    producer.server_id(),
                    producer.stream_types()
                );
                tasks.push(producer.spawn(Arc::clone(&self.running), self.config.producer_interval_ms));
            }
        }
        tasks.len()
    }

    /// Stop the batch loop and every producer; queued events stay queued
    /// until the next start
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.batch_task.lock().await.take() {
            handle.abort();
        }
        for handle in self.producer_tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("🛑 Event pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
