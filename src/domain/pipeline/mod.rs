//! Pipeline domain - real-time event streaming with backpressure

mod event_pipeline;
mod event_producer;

pub use event_pipeline::{EventPipeline, PipelineConfig, PipelineStats};
pub use event_producer::EventProducer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::shared::errors::PipelineError;
use crate::shared::types::{EventPriority, StreamType};
use crate::shared::utils::generate_id;

/// One event flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub id: String,
    pub stream_type: StreamType,
    /// Id of the producing server
    pub source: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    /// Strictly increasing per producer
    pub sequence: u64,
    pub correlation_id: Option<String>,
}

impl StreamEvent {
    pub fn new(stream_type: StreamType, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: generate_id(),
            stream_type,
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            sequence: 0,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Equality filter over payload fields; keys may be dotted paths
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    fields: BTreeMap<String, Value>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, path: impl Into<String>, value: Value) -> Self {
        self.fields.insert(path.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        self.fields.iter().all(|(path, expected)| {
            path.split('.')
                .try_fold(&event.payload, |node, key| node.get(key))
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

/// Subscriber callback. Returned errors and panics are both contained.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &StreamEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &StreamEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Batch processor for a single stream type
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    async fn process(&self, stream_type: StreamType, events: &[StreamEvent]) -> Result<(), PipelineError>;
}

/// Live subscription
pub struct Subscription {
    pub id: String,
    /// Empty means every stream type
    pub stream_types: BTreeSet<StreamType>,
    pub filter: EventFilter,
    pub handler: Arc<dyn EventHandler>,
    pub active: bool,
    pub last_event: Option<DateTime<Utc>>,
    pub event_count: u64,
}

impl Subscription {
    pub fn wants(&self, event: &StreamEvent) -> bool {
        self.active
            && (self.stream_types.is_empty() || self.stream_types.contains(&event.stream_type))
            && self.filter.matches(event)
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            stream_types: self.stream_types.clone(),
            active: self.active,
            last_event: self.last_event,
            event_count: self.event_count,
        }
    }
}

/// Snapshot of a subscription without its callback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub stream_types: BTreeSet<StreamType>,
    pub active: bool,
    pub last_event: Option<DateTime<Utc>>,
    pub event_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_nested_fields() {
        let event = StreamEvent::new(
            StreamType::PriceUpdates,
            "binance",
            json!({ "pair": "ETH/USDC", "venue": { "chain": "arbitrum" } }),
        );

        assert!(EventFilter::new().matches(&event));
        assert!(EventFilter::new()
            .with_field("pair", json!("ETH/USDC"))
            .with_field("venue.chain", json!("arbitrum"))
            .matches(&event));
        assert!(!EventFilter::new().with_field("pair", json!("BTC/USDC")).matches(&event));
        assert!(!EventFilter::new().with_field("venue.dex", json!("uni")).matches(&event));
    }
}
