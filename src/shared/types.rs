//! Common types used across the application

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of event streams carried by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    PriceUpdates,
    OrderBook,
    Trades,
    Liquidity,
    ArbitrageSignals,
    MarketSentiment,
    SystemHealth,
}

impl StreamType {
    pub const ALL: [StreamType; 7] = [
        StreamType::PriceUpdates,
        StreamType::OrderBook,
        StreamType::Trades,
        StreamType::Liquidity,
        StreamType::ArbitrageSignals,
        StreamType::MarketSentiment,
        StreamType::SystemHealth,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::PriceUpdates => "price_updates",
            StreamType::OrderBook => "order_book",
            StreamType::Trades => "trades",
            StreamType::Liquidity => "liquidity",
            StreamType::ArbitrageSignals => "arbitrage_signals",
            StreamType::MarketSentiment => "market_sentiment",
            StreamType::SystemHealth => "system_health",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown stream type: {}", s))
    }
}

/// Event priority, highest last so that `Ord` sorts ascending by urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}
