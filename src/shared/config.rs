//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::{fs, path::Path};

use crate::domain::coordinator::CoordinatorConfig;
use crate::domain::fusion::FusionConfig;
use crate::domain::health::HealthConfig;
use crate::domain::pipeline::PipelineConfig;
use crate::domain::registry::{Capability, RegistryConfig, ServerKind, ServerRecord};
use crate::infrastructure::transport::TransportConfig;
use crate::shared::errors::AppError;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "Config.toml";

/// One `[[servers]]` registration entry
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ServerKind,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_server_priority")]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// HTTP endpoint; servers without one are only reachable in simulation
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_server_priority() -> u32 {
    5
}

impl ServerEntry {
    pub fn to_record(&self) -> ServerRecord {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut record = ServerRecord::new(self.id.clone(), name, self.kind.clone()).with_priority(self.priority);
        for capability in &self.capabilities {
            record = record.with_capability(capability.clone());
        }
        for tag in &self.tags {
            record = record.with_tag(tag.clone());
        }
        if self.required {
            record = record.required();
        }
        record
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub fusion: FusionConfig,
    pub pipeline: PipelineConfig,
    pub coordinator: CoordinatorConfig,
    pub health: HealthConfig,
    pub transport: TransportConfig,
    pub servers: Vec<ServerEntry>,
}

impl OrchestratorConfig {
    /// Parse TOML text without touching the filesystem
    pub fn parse(content: &str) -> Result<Self, AppError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |message: String| Err(AppError::ConfigError(message));

        if self.pipeline.queue_capacity == 0 || self.pipeline.batch_size == 0 {
            return invalid("pipeline queue_capacity and batch_size must be positive".to_string());
        }
        let threshold = self.pipeline.backpressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid(format!("pipeline backpressure_threshold {} outside (0, 1]", threshold));
        }
        if self.fusion.cache_capacity == 0 {
            return invalid("fusion cache_capacity must be positive".to_string());
        }
        if !(self.fusion.conflict_threshold > 0.0 && self.fusion.conflict_threshold < 1.0) {
            return invalid(format!(
                "fusion conflict_threshold {} outside (0, 1)",
                self.fusion.conflict_threshold
            ));
        }
        if self.health.trend_window < 2 {
            return invalid("health trend_window needs at least 2 samples".to_string());
        }
        if self.health.history_size < self.health.trend_window {
            return invalid("health history_size must cover the trend window".to_string());
        }
        for (kind, threshold) in self.health.thresholds.iter() {
            let ordered = if threshold.higher_is_worse {
                threshold.warning < threshold.critical
            } else {
                threshold.warning > threshold.critical
            };
            if !ordered {
                return invalid(format!(
                    "{} thresholds out of order: warning {} critical {}",
                    kind, threshold.warning, threshold.critical
                ));
            }
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return invalid("server id must not be empty".to_string());
            }
            if !seen.insert(server.id.as_str()) {
                return invalid(format!("duplicate server id: {}", server.id));
            }
        }

        Ok(())
    }

    pub fn records(&self) -> Vec<ServerRecord> {
        self.servers.iter().map(ServerEntry::to_record).collect()
    }

    pub fn server_ids(&self) -> BTreeSet<String> {
        self.servers.iter().map(|s| s.id.clone()).collect()
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config = OrchestratorConfig::parse(&content).with_context(|| format!("load {}", path.display()))?;
        Ok(config)
    }

    /// Load the default `Config.toml`
    pub fn load_config() -> Result<OrchestratorConfig> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::health::MetricKind;
    use std::io::Write;

    const SAMPLE: &str = r#"
[pipeline]
queue_capacity = 500

[health]
trend_window = 10
leading_metric = "cpu"

[health.thresholds.cpu]
warning = 60.0
critical = 85.0

[[servers]]
id = "binance"
kind = "exchange"
required = true
priority = 1
tags = ["cex"]
endpoint = "http://localhost:9001/invoke"

[[servers.capabilities]]
name = "exchange_data"
operations = ["get_order_book"]
data_kinds = ["order_book"]
real_time = true

[[servers]]
id = "graph"
kind = "knowledge_graph"

[[servers.capabilities]]
name = "knowledge_graph"
"#;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = OrchestratorConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.pipeline.queue_capacity, 500);
        assert_eq!(config.pipeline.batch_size, 100);
        assert_eq!(config.registry.staleness_secs, 300);
        assert_eq!(config.health.trend_window, 10);
        assert_eq!(config.health.leading_metric, MetricKind::Cpu);
        assert_eq!(config.health.thresholds.cpu.critical, 85.0);
        assert_eq!(config.health.thresholds.memory.critical, 90.0);
        assert!(!config.health.thresholds.availability.higher_is_worse);

        let records = config.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "binance");
        assert!(records[0].required);
        assert!(records[0].is_real_time());
        assert!(records[0].tags.contains("cex"));
        assert_eq!(records[1].kind, ServerKind::KnowledgeGraph);
        assert_eq!(records[1].priority, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let duplicate = r#"
[[servers]]
id = "a"
kind = "memory"

[[servers]]
id = "a"
kind = "analytics"
"#;
        assert!(matches!(OrchestratorConfig::parse(duplicate), Err(AppError::ConfigError(_))));

        let threshold = "[pipeline]\nbackpressure_threshold = 1.5\n";
        assert!(OrchestratorConfig::parse(threshold).is_err());

        let inverted = "[health.thresholds.cpu]\nwarning = 95.0\ncritical = 90.0\n";
        assert!(OrchestratorConfig::parse(inverted).is_err());

        assert!(OrchestratorConfig::parse("").is_ok());
    }

    #[test]
    fn test_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ConfigLoader::from_file(file.path()).unwrap();
        assert_eq!(config.server_ids().len(), 2);

        assert!(ConfigLoader::from_file("/definitely/not/here.toml").is_err());
    }
}
