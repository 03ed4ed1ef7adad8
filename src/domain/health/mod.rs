//! Health domain - per-server profiles, trends, prediction and alerts

mod alerts;
mod health_monitor;
mod trend;

pub use alerts::AlertBook;
pub use health_monitor::{HealthConfig, HealthMonitor, HealthSummary, ThresholdTable};
pub use trend::{classify_trend, seconds_to_threshold};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Metric kinds a profile can track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    ResponseTime,
    ErrorRate,
    Throughput,
    Availability,
    DiskUsage,
    NetworkLatency,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::ResponseTime => "response_time",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::Throughput => "throughput",
            MetricKind::Availability => "availability",
            MetricKind::DiskUsage => "disk_usage",
            MetricKind::NetworkLatency => "network_latency",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health classification, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    #[default]
    Unknown,
    Warning,
    Critical,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    #[default]
    InsufficientData,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Degrading => "degrading",
            Trend::InsufficientData => "insufficient_data",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Emergency => "emergency",
        };
        f.write_str(label)
    }
}

/// Warning and critical levels for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub warning: f64,
    pub critical: f64,
    /// False for metrics like availability where low values are bad
    #[serde(default = "default_higher_is_worse")]
    pub higher_is_worse: bool,
}

fn default_higher_is_worse() -> bool {
    true
}

impl MetricThreshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            higher_is_worse: true,
        }
    }

    pub fn lower_is_worse(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            higher_is_worse: false,
        }
    }

    fn breaches(&self, value: f64, level: f64) -> bool {
        if self.higher_is_worse {
            value >= level
        } else {
            value <= level
        }
    }

    pub fn classify(&self, value: f64) -> HealthStatus {
        if self.breaches(value, self.critical) {
            HealthStatus::Critical
        } else if self.breaches(value, self.warning) {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Latest observation of one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetric {
    pub kind: MetricKind,
    pub value: f64,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Everything the monitor knows about one server
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerHealthProfile {
    pub server_id: String,
    pub status: HealthStatus,
    pub metrics: BTreeMap<MetricKind, HealthMetric>,
    pub history: BTreeMap<MetricKind, VecDeque<f64>>,
    pub trends: BTreeMap<MetricKind, Trend>,
    /// Trend of the leading metric
    pub trend: Trend,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    /// Outcomes of the most recent probes, newest last
    pub recent_probes: VecDeque<bool>,
    pub predicted_failure: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

impl ServerHealthProfile {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Self::default()
        }
    }

    /// Successful checks over all checks; 1.0 before the first check
    pub fn availability(&self) -> f64 {
        if self.total_checks == 0 {
            1.0
        } else {
            (self.total_checks - self.failed_checks) as f64 / self.total_checks as f64
        }
    }

    /// Failed share of the recent probe window
    pub fn error_rate(&self) -> f64 {
        if self.recent_probes.is_empty() {
            0.0
        } else {
            self.recent_probes.iter().filter(|ok| !**ok).count() as f64 / self.recent_probes.len() as f64
        }
    }

    pub fn record_check(&mut self, success: bool, probe_window: usize, now: DateTime<Utc>) {
        self.total_checks += 1;
        self.last_check = Some(now);
        if success {
            self.consecutive_failures = 0;
        } else {
            self.failed_checks += 1;
            self.consecutive_failures += 1;
        }
        self.recent_probes.push_back(success);
        while self.recent_probes.len() > probe_window.max(1) {
            self.recent_probes.pop_front();
        }
    }
}

/// A raised health alert. Alerts are resolved, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAlert {
    pub id: String,
    pub server_id: String,
    pub severity: AlertSeverity,
    pub metric: MetricKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
}
