//! Registry domain - known servers, their capabilities and connectivity

mod server_interface;
mod server_registry;

pub use server_interface::{invoke_with_timeout, ServerInvoker};
pub use server_registry::{RegistryConfig, RegistryStats, ServerRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of provider behind a server id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Memory,
    KnowledgeGraph,
    MarketData,
    Exchange,
    Analytics,
    Organization,
    Custom(String),
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Memory => f.write_str("memory"),
            ServerKind::KnowledgeGraph => f.write_str("knowledge_graph"),
            ServerKind::MarketData => f.write_str("market_data"),
            ServerKind::Exchange => f.write_str("exchange"),
            ServerKind::Analytics => f.write_str("analytics"),
            ServerKind::Organization => f.write_str("organization"),
            ServerKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Connectivity status of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Error => "error",
            ServerStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named ability a server advertises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub data_kinds: Vec<String>,
    #[serde(default)]
    pub real_time: bool,
    #[serde(default = "default_capability_priority")]
    pub priority: u32,
}

fn default_capability_priority() -> u32 {
    5
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            operations: Vec::new(),
            data_kinds: Vec::new(),
            real_time: false,
            priority: default_capability_priority(),
        }
    }

    pub fn with_operations(mut self, operations: &[&str]) -> Self {
        self.operations = operations.iter().map(|op| op.to_string()).collect();
        self
    }

    pub fn real_time(mut self) -> Self {
        self.real_time = true;
        self
    }
}

/// Catalog entry for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub kind: ServerKind,
    pub capabilities: Vec<Capability>,
    pub status: ServerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub uptime_start: Option<DateTime<Utc>>,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    pub required: bool,
    /// Lower is preferred
    pub priority: u32,
    pub tags: BTreeSet<String>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ServerKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            capabilities: Vec::new(),
            status: ServerStatus::Unknown,
            last_seen: None,
            uptime_start: None,
            connection_attempts: 0,
            last_error: None,
            required: false,
            priority: 5,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn is_real_time(&self) -> bool {
        self.capabilities.iter().any(|c| c.real_time)
    }

    pub fn is_connected(&self) -> bool {
        self.status == ServerStatus::Connected
    }
}
