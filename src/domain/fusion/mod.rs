//! Fusion domain - reconciling answers from several providers

mod conflict;
mod fusion_engine;

pub use conflict::{detect_conflicts, reconcile, FieldConflict};
pub use fusion_engine::{CacheStats, DataFusionEngine, FusionConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of data a fusion request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    MarketData,
    PriceData,
    OrderBook,
    Liquidity,
    Relationships,
    Sentiment,
}

impl DataType {
    /// Capability a server must advertise to answer this data type
    pub fn capability(&self) -> &'static str {
        match self {
            DataType::MarketData => "market_data",
            DataType::PriceData => "price_data",
            DataType::OrderBook => "exchange_data",
            DataType::Liquidity => "liquidity_data",
            DataType::Relationships => "knowledge_graph",
            DataType::Sentiment => "analytics",
        }
    }

    /// Downstream operation invoked on each source
    pub fn operation(&self) -> &'static str {
        match self {
            DataType::MarketData => "get_market_data",
            DataType::PriceData => "get_price",
            DataType::OrderBook => "get_order_book",
            DataType::Liquidity => "get_liquidity",
            DataType::Relationships => "search_relationships",
            DataType::Sentiment => "get_sentiment",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market_data" => Ok(DataType::MarketData),
            "price_data" => Ok(DataType::PriceData),
            "order_book" => Ok(DataType::OrderBook),
            "liquidity" => Ok(DataType::Liquidity),
            "relationships" => Ok(DataType::Relationships),
            "sentiment" => Ok(DataType::Sentiment),
            other => Err(format!("unknown data type: {}", other)),
        }
    }
}

/// How disagreeing sources are ranked before merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    PriorityBased,
    MajorityVote,
    QualityWeighted,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" | "priority_based" => Ok(ConflictStrategy::PriorityBased),
            "majority" | "majority_vote" => Ok(ConflictStrategy::MajorityVote),
            "quality" | "quality_weighted" => Ok(ConflictStrategy::QualityWeighted),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// Quality tier of a fused result, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Invalid,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl DataQuality {
    pub fn classify(source_count: usize, conflicts: usize) -> Self {
        match (source_count, conflicts) {
            (0, _) => DataQuality::Invalid,
            (s, 0) if s >= 3 => DataQuality::Excellent,
            (s, c) if c <= 1 && s >= 2 => DataQuality::Good,
            (_, c) if c <= 2 => DataQuality::Fair,
            _ => DataQuality::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Invalid => "invalid",
            DataQuality::Poor => "poor",
            DataQuality::Fair => "fair",
            DataQuality::Good => "good",
            DataQuality::Excellent => "excellent",
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for reconciled data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionRequest {
    pub data_type: DataType,
    pub parameters: Value,
    pub required_capabilities: Vec<String>,
    pub preferred_servers: Vec<String>,
    pub strategy: ConflictStrategy,
    pub max_sources: usize,
    pub timeout_ms: u64,
    pub min_quality: DataQuality,
}

impl FusionRequest {
    pub fn new(data_type: DataType, parameters: Value) -> Self {
        Self {
            data_type,
            parameters,
            required_capabilities: vec![data_type.capability().to_string()],
            preferred_servers: Vec::new(),
            strategy: ConflictStrategy::default(),
            max_sources: 5,
            timeout_ms: 5000,
            min_quality: DataQuality::Poor,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.required_capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_sources(mut self, max_sources: usize) -> Self {
        self.max_sources = max_sources;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_preferred(mut self, servers: &[&str]) -> Self {
        self.preferred_servers = servers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_min_quality(mut self, min_quality: DataQuality) -> Self {
        self.min_quality = min_quality;
        self
    }
}

/// One successful answer from a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResponse {
    pub server_id: String,
    /// Position in candidate order, 0 = most preferred
    pub rank: usize,
    pub reliability: f64,
    pub value: Value,
}

/// Reconciled result of a fusion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedData {
    pub data: Value,
    pub sources: Vec<String>,
    pub quality: DataQuality,
    /// In [0, 1]
    pub confidence: f64,
    pub conflicts_detected: usize,
    pub conflicts: Vec<FieldConflict>,
    pub notes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl FusedData {
    pub fn invalid(note: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            sources: Vec::new(),
            quality: DataQuality::Invalid,
            confidence: 0.0,
            conflicts_detected: 0,
            conflicts: Vec::new(),
            notes: vec![note.into()],
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tiers() {
        assert_eq!(DataQuality::classify(0, 0), DataQuality::Invalid);
        assert_eq!(DataQuality::classify(3, 0), DataQuality::Excellent);
        assert_eq!(DataQuality::classify(2, 0), DataQuality::Good);
        assert_eq!(DataQuality::classify(4, 1), DataQuality::Good);
        assert_eq!(DataQuality::classify(1, 0), DataQuality::Fair);
        assert_eq!(DataQuality::classify(3, 2), DataQuality::Fair);
        assert_eq!(DataQuality::classify(3, 3), DataQuality::Poor);
        assert!(DataQuality::Excellent > DataQuality::Good);
    }

    #[test]
    fn test_request_defaults_to_data_type_capability() {
        let request = FusionRequest::new(DataType::OrderBook, Value::Null);
        assert_eq!(request.required_capabilities, vec!["exchange_data".to_string()]);
        assert_eq!(request.strategy, ConflictStrategy::PriorityBased);
        assert_eq!("majority".parse::<ConflictStrategy>(), Ok(ConflictStrategy::MajorityVote));
    }
}
