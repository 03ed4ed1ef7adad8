//! Per-server producers polling real-time servers for events

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::debug;

use super::EventPipeline;
use crate::domain::registry::{invoke_with_timeout, ServerInvoker, ServerRecord, ServerRegistry};
use crate::shared::types::{EventPriority, StreamType};

/// Polls one real-time server with `stream_events` and publishes what it
/// returns. Each producer owns its server's sequence numbering.
pub struct EventProducer {
    server_id: String,
    stream_types: Vec<StreamType>,
    pipeline: Arc<EventPipeline>,
    registry: Arc<ServerRegistry>,
    invoker: Arc<dyn ServerInvoker>,
    timeout_ms: u64,
}

impl EventProducer {
    /// Producer for a record advertising a real-time capability
    pub fn for_record(
        record: &ServerRecord,
        pipeline: Arc<EventPipeline>,
        registry: Arc<ServerRegistry>,
        invoker: Arc<dyn ServerInvoker>,
    ) -> Option<Self> {
        if !record.is_real_time() {
            return None;
        }

        let mut stream_types: Vec<StreamType> = record
            .capabilities
            .iter()
            .filter(|c| c.real_time)
            .flat_map(|c| c.data_kinds.iter())
            .filter_map(|kind| kind.parse().ok())
            .collect();
        stream_types.sort();
        stream_types.dedup();
        if stream_types.is_empty() {
            stream_types.push(StreamType::PriceUpdates);
        }

        let timeout_ms = pipeline.config().producer_timeout_ms;
        Some(Self {
            server_id: record.id.clone(),
            stream_types,
            pipeline,
            registry,
            invoker,
            timeout_ms,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn stream_types(&self) -> &[StreamType] {
        &self.stream_types
    }

    /// One poll; returns how many events were accepted by the pipeline
    pub async fn poll_once(&self) -> usize {
        match self.registry.get(&self.server_id).await {
            Some(record) if record.is_connected() => {}
            _ => return 0,
        }

        let arguments = json!({
            "stream_types": self.stream_types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        });
        let reply = match invoke_with_timeout(
            self.invoker.as_ref(),
            &self.server_id,
            "stream_events",
            arguments,
            self.timeout_ms,
        )
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Producer {} poll failed: {}", self.server_id, e);
                return 0;
            }
        };

        let items = match reply {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("events") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let mut accepted = 0;
        for item in items {
            let stream_type = item
                .get("stream_type")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.stream_types[0]);
            let priority: EventPriority = item
                .get("priority")
                .cloned()
                .and_then(|p| serde_json::from_value(p).ok())
                .unwrap_or_default();
            let correlation_id = item
                .get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let payload = item.get("payload").cloned().unwrap_or(item);

            if self
                .pipeline
                .publish(&self.server_id, stream_type, payload, priority, correlation_id)
                .await
                .is_ok()
            {
                accepted += 1;
            }
        }
        accepted
    }

    /// Run until `running` clears
    pub fn spawn(self, running: Arc<AtomicBool>, interval_ms: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let accepted = self.poll_once().await;
                if accepted > 0 {
                    debug!("Producer {} published {} events", self.server_id, accepted);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::{Capability, ServerKind, ServerStatus};
    use crate::testing::{connected_registry, ScriptedInvoker};

    fn feed(id: &str) -> ServerRecord {
        let mut capability = Capability::new("price_feed").real_time();
        capability.data_kinds = vec!["price_updates".to_string(), "trades".to_string(), "candles".to_string()];
        ServerRecord::new(id, id, ServerKind::MarketData).with_capability(capability)
    }

    #[tokio::test]
    async fn test_only_real_time_servers_get_producers() {
        let registry = connected_registry(vec![]).await;
        let pipeline = Arc::new(EventPipeline::new_default());
        let invoker = Arc::new(ScriptedInvoker::new());

        let batch_only = ServerRecord::new("x", "x", ServerKind::Analytics)
            .with_capability(Capability::new("analytics"));
        assert!(EventProducer::for_record(&batch_only, pipeline.clone(), registry.clone(), invoker.clone()).is_none());

        let producer = EventProducer::for_record(&feed("f"), pipeline, registry, invoker).unwrap();
        assert_eq!(producer.stream_types(), &[StreamType::PriceUpdates, StreamType::Trades]);
    }

    #[tokio::test]
    async fn test_poll_publishes_returned_events() {
        let registry = connected_registry(vec![feed("f")]).await;
        let pipeline = Arc::new(EventPipeline::new_default());
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply(
            "f",
            "stream_events",
            json!([
                { "stream_type": "trades", "payload": { "size": 1.5 }, "priority": "high" },
                { "price": 101.2 },
            ]),
        );

        let producer =
            EventProducer::for_record(&feed("f"), pipeline.clone(), registry.clone(), invoker.clone()).unwrap();
        assert_eq!(producer.poll_once().await, 2);
        assert_eq!(pipeline.queue_depth(), 2);

        registry
            .update_status("f", ServerStatus::Disconnected, None)
            .await
            .unwrap();
        assert_eq!(producer.poll_once().await, 0);
        assert_eq!(invoker.servers_called("stream_events").len(), 1);
    }
}
