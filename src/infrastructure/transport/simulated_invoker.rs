//! In-process invoker producing synthetic market data

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{hash_map::DefaultHasher, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use super::TransportConfig;
use crate::domain::registry::ServerInvoker;
use crate::shared::errors::InvokeError;

/// Answers every operation with plausible synthetic data. Each server
/// carries a small fixed price bias so sources disagree realistically.
pub struct SimulatedInvoker {
    servers: HashSet<String>,
    failure_rate: f64,
    latency_ms: u64,
}

impl SimulatedInvoker {
    pub fn new(server_ids: impl IntoIterator<Item = String>, config: &TransportConfig) -> Self {
        Self {
            servers: server_ids.into_iter().collect(),
            failure_rate: config.simulated_failure_rate.clamp(0.0, 1.0),
            latency_ms: config.simulated_latency_ms,
        }
    }

    /// Reference price for the base asset of a pair like `ETH/USDC`
    fn base_price(symbol: &str) -> f64 {
        let base = symbol.split(['/', '-']).next().unwrap_or(symbol).to_uppercase();
        match base.as_str() {
            "BTC" | "WBTC" => 65_000.0,
            "ETH" | "WETH" => 3_200.0,
            "SOL" => 150.0,
            "BNB" => 580.0,
            "USDC" | "USDT" | "DAI" => 1.0,
            _ => 10.0,
        }
    }

    /// Fixed per-server bias in [-0.5%, +0.5%]
    fn server_bias(server_id: &str) -> f64 {
        let mut hasher = DefaultHasher::new();
        server_id.hash(&mut hasher);
        ((hasher.finish() % 1001) as f64 / 1000.0 - 0.5) * 0.01
    }

    fn respond(&self, server_id: &str, operation: &str, arguments: &Value) -> Value {
        let mut rng = rand::thread_rng();
        let symbol = arguments
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or("ETH/USDC")
            .to_string();
        let price = Self::base_price(&symbol)
            * (1.0 + Self::server_bias(server_id) + rng.gen_range(-0.001..0.001));

        match operation {
            "ping" | "health_check" => json!({ "ok": true }),
            "get_load" => json!({
                "cpu_usage": rng.gen_range(10.0..60.0),
                "memory_usage": rng.gen_range(20.0..70.0),
            }),
            "get_market_data" => json!({
                "symbol": symbol,
                "price": price,
                "volume_24h": rng.gen_range(1.0e6..5.0e7),
                "bid": price * 0.9995,
                "ask": price * 1.0005,
            }),
            "get_price" => json!({ "symbol": symbol, "price": price }),
            "get_order_book" => json!({
                "symbol": symbol,
                "best_bid": price * 0.9995,
                "best_ask": price * 1.0005,
                "depth": { "bid": rng.gen_range(10.0..500.0), "ask": rng.gen_range(10.0..500.0) },
            }),
            "get_liquidity" => json!({
                "symbol": symbol,
                "pool_depth_usd": rng.gen_range(1.0e5..1.0e7),
                "slippage_bps": rng.gen_range(1.0..50.0),
            }),
            "get_sentiment" => json!({ "symbol": symbol, "score": rng.gen_range(-1.0..1.0) }),
            "search_relationships" => {
                let count = rng.gen_range(0..15);
                let relationships: Vec<Value> = (0..count)
                    .map(|i| json!({ "id": format!("rel-{}", i), "weight": rng.gen_range(0.0..1.0) }))
                    .collect();
                json!({ "relationships": relationships })
            }
            "stream_events" => {
                let count = rng.gen_range(1..4);
                let events: Vec<Value> = (0..count)
                    .map(|_| {
                        json!({
                            "stream_type": "price_updates",
                            "payload": {
                                "symbol": symbol,
                                "price": price * (1.0 + rng.gen_range(-0.002..0.002)),
                            },
                        })
                    })
                    .collect();
                json!({ "events": events })
            }
            "prepare" | "commit" | "rollback" => json!({
                "ok": true,
                "phase": operation,
                "transaction_id": arguments.get("transaction_id").cloned().unwrap_or(Value::Null),
            }),
            _ => json!({ "ok": true, "operation": operation, "server": server_id }),
        }
    }
}

#[async_trait]
impl ServerInvoker for SimulatedInvoker {
    async fn invoke(
        &self,
        server_id: &str,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, InvokeError> {
        if !self.servers.contains(server_id) {
            return Err(InvokeError::UnknownServer(server_id.to_string()));
        }

        // Roll everything random before the first await
        let (fails, latency, reply) = {
            let mut rng = rand::thread_rng();
            let fails = self.failure_rate >= 1.0
                || (self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate));
            let latency = rng.gen_range(0..=self.latency_ms);
            (fails, latency, self.respond(server_id, operation, &arguments))
        };

        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if fails {
            return Err(InvokeError::Failed(format!("simulated {} failure", operation)));
        }
        Ok(reply)
    }
}
