//! Health monitor - periodic checks, trend tracking and failure prediction

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use super::trend::{classify_trend, seconds_to_threshold};
use super::{
    AlertBook, AlertSeverity, HealthAlert, HealthMetric, HealthStatus, MetricKind, MetricThreshold,
    ServerHealthProfile, Trend,
};
use crate::domain::coordinator::CoordinatorService;
use crate::domain::registry::ServerRecord;
use crate::shared::types::{EventPriority, StreamType};
use crate::shared::utils::calculate_percentage_change;

/// Warning/critical thresholds per metric
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub cpu: MetricThreshold,
    pub memory: MetricThreshold,
    pub response_time: MetricThreshold,
    pub error_rate: MetricThreshold,
    pub throughput: MetricThreshold,
    pub availability: MetricThreshold,
    pub disk_usage: MetricThreshold,
    pub network_latency: MetricThreshold,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            cpu: MetricThreshold::new(70.0, 90.0),
            memory: MetricThreshold::new(75.0, 90.0),
            response_time: MetricThreshold::new(1000.0, 3000.0), // ms
            error_rate: MetricThreshold::new(0.05, 0.15),
            throughput: MetricThreshold::lower_is_worse(10.0, 1.0), // requests/s
            availability: MetricThreshold::lower_is_worse(0.95, 0.90),
            disk_usage: MetricThreshold::new(80.0, 95.0),
            network_latency: MetricThreshold::new(200.0, 500.0), // ms
        }
    }
}

impl ThresholdTable {
    pub fn get(&self, kind: MetricKind) -> &MetricThreshold {
        match kind {
            MetricKind::Cpu => &self.cpu,
            MetricKind::Memory => &self.memory,
            MetricKind::ResponseTime => &self.response_time,
            MetricKind::ErrorRate => &self.error_rate,
            MetricKind::Throughput => &self.throughput,
            MetricKind::Availability => &self.availability,
            MetricKind::DiskUsage => &self.disk_usage,
            MetricKind::NetworkLatency => &self.network_latency,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, &MetricThreshold)> {
        [
            MetricKind::Cpu,
            MetricKind::Memory,
            MetricKind::ResponseTime,
            MetricKind::ErrorRate,
            MetricKind::Throughput,
            MetricKind::Availability,
            MetricKind::DiskUsage,
            MetricKind::NetworkLatency,
        ]
        .into_iter()
        .map(move |kind| (kind, self.get(kind)))
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub prediction_interval_secs: u64,
    /// Samples kept per metric
    pub history_size: usize,
    pub trend_window: usize,
    /// Relative slope per sample below which a trend is stable
    pub trend_epsilon: f64,
    pub alert_cooldown_secs: u64,
    pub max_alerts: usize,
    pub prediction_horizon_secs: u64,
    /// Probes considered for the error rate
    pub probe_window: usize,
    pub leading_metric: MetricKind,
    pub thresholds: ThresholdTable,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            prediction_interval_secs: 300,
            history_size: 100,
            trend_window: 20,
            trend_epsilon: 0.01,
            alert_cooldown_secs: 300,
            max_alerts: 1000,
            prediction_horizon_secs: 3600,
            probe_window: 20,
            leading_metric: MetricKind::ResponseTime,
            thresholds: ThresholdTable::default(),
        }
    }
}

/// System-wide health rollup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_servers: usize,
    pub by_status: BTreeMap<HealthStatus, usize>,
    pub mean_availability: f64,
    pub active_alerts: usize,
    pub predicted_failures: usize,
}

/// Alert waiting to be raised once the profile lock is released
struct PendingAlert {
    metric: MetricKind,
    severity: AlertSeverity,
    message: String,
    value: f64,
    threshold: f64,
}

/// Samples every registered server on an interval, keeps per-server
/// profiles and raises rate-limited alerts
pub struct HealthMonitor {
    config: HealthConfig,
    coordinator: Arc<CoordinatorService>,
    profiles: RwLock<HashMap<String, ServerHealthProfile>>,
    alerts: RwLock<AlertBook>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create new health monitor
    pub fn new(config: HealthConfig, coordinator: Arc<CoordinatorService>) -> Self {
        let alerts = AlertBook::new(config.alert_cooldown_secs, config.max_alerts);
        Self {
            config,
            coordinator,
            profiles: RwLock::new(HashMap::new()),
            alerts: RwLock::new(alerts),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub async fn profile(&self, server_id: &str) -> Option<ServerHealthProfile> {
        self.profiles.read().await.get(server_id).cloned()
    }

    /// Profiles ordered by server id
    pub async fn profiles(&self) -> Vec<ServerHealthProfile> {
        let mut profiles: Vec<_> = self.profiles.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        profiles
    }

    pub async fn run_health_cycle(&self) -> usize {
        self.run_health_cycle_at(Utc::now()).await
    }

    /// Check every registered server once; returns alerts raised
    pub async fn run_health_cycle_at(&self, now: DateTime<Utc>) -> usize {
        let mut raised = 0;
        for record in self.coordinator.registry().all().await {
            raised += self.check_server_at(&record, now).await.len();
        }
        debug!("Health cycle raised {} alerts", raised);
        raised
    }

    pub async fn check_server_at(&self, record: &ServerRecord, now: DateTime<Utc>) -> Vec<HealthAlert> {
        if !record.is_connected() {
            let pending = {
                let mut profiles = self.profiles.write().await;
                let profile = profiles
                    .entry(record.id.clone())
                    .or_insert_with(|| ServerHealthProfile::new(record.id.clone()));
                profile.record_check(false, self.config.probe_window, now);
                profile.status = HealthStatus::Failed;

                let availability = profile.availability();
                vec![PendingAlert {
                    metric: MetricKind::Availability,
                    severity: AlertSeverity::Critical,
                    message: format!("Server {} is {}", record.id, record.status.as_str()),
                    value: availability,
                    threshold: self.config.thresholds.availability.critical,
                }]
            };
            return self.raise_pending(&record.id, pending, now).await;
        }

        let started = Instant::now();
        let probe = self.coordinator.invoke(&record.id, "health_check", json!({})).await;
        let probe_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = &probe {
            warn!("⚠️  Health probe failed for {}: {}", record.id, e);
        }
        let load = self.coordinator.load_of(&record.id).await;

        let (pending, healthy_metrics) = {
            let mut profiles = self.profiles.write().await;
            let profile = profiles
                .entry(record.id.clone())
                .or_insert_with(|| ServerHealthProfile::new(record.id.clone()));
            profile.record_check(probe.is_ok(), self.config.probe_window, now);

            let mut samples = Vec::new();
            match &load {
                Some(load) => {
                    samples.push((MetricKind::Cpu, load.cpu_usage));
                    samples.push((MetricKind::Memory, load.memory_usage));
                    samples.push((MetricKind::ResponseTime, load.response_time_ms));
                }
                None => samples.push((MetricKind::ResponseTime, probe_ms)),
            }
            samples.push((MetricKind::ErrorRate, profile.error_rate()));
            samples.push((MetricKind::Availability, profile.availability()));

            let mut pending = Vec::new();
            let mut healthy_metrics = Vec::new();
            let mut worst = HealthStatus::Healthy;
            for (kind, value) in samples {
                let status = self.record_metric(profile, kind, value, now);
                worst = worst.max(status);

                let threshold = self.config.thresholds.get(kind);
                let (severity, level) = match status {
                    HealthStatus::Critical => (AlertSeverity::Critical, threshold.critical),
                    HealthStatus::Warning => (AlertSeverity::Warning, threshold.warning),
                    HealthStatus::Healthy => {
                        healthy_metrics.push(kind);
                        continue;
                    }
                    HealthStatus::Unknown | HealthStatus::Failed => continue,
                };
                pending.push(PendingAlert {
                    metric: kind,
                    severity,
                    message: format!("{} {} at {:.2} (threshold {:.2})", record.id, kind, value, level),
                    value,
                    threshold: level,
                });
            }

            profile.status = worst;
            profile.trend = profile
                .trends
                .get(&self.config.leading_metric)
                .copied()
                .unwrap_or_default();
            (pending, healthy_metrics)
        };

        {
            let mut alerts = self.alerts.write().await;
            for kind in healthy_metrics {
                let resolved = alerts.resolve_metric(&record.id, kind);
                if resolved > 0 {
                    info!("✅ {} {} back to healthy, resolved {} alerts", record.id, kind, resolved);
                }
            }
        }

        self.raise_pending(&record.id, pending, now).await
    }

    /// Store a sample, classify it and refresh that metric's trend
    fn record_metric(
        &self,
        profile: &mut ServerHealthProfile,
        kind: MetricKind,
        value: f64,
        now: DateTime<Utc>,
    ) -> HealthStatus {
        let threshold = self.config.thresholds.get(kind);
        let status = threshold.classify(value);

        profile.metrics.insert(
            kind,
            HealthMetric {
                kind,
                value,
                status,
                timestamp: now,
            },
        );

        let history = profile.history.entry(kind).or_default();
        history.push_back(value);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }

        let samples: Vec<f64> = history.iter().copied().collect();
        let trend = classify_trend(
            &samples,
            self.config.trend_window,
            self.config.trend_epsilon,
            threshold.higher_is_worse,
        );
        profile.trends.insert(kind, trend);
        status
    }

    async fn raise_pending(&self, server_id: &str, pending: Vec<PendingAlert>, now: DateTime<Utc>) -> Vec<HealthAlert> {
        let raised: Vec<HealthAlert> = {
            let mut alerts = self.alerts.write().await;
            pending
                .into_iter()
                .filter_map(|p| alerts.raise(server_id, p.metric, p.severity, p.message, p.value, p.threshold, now))
                .collect()
        };

        for alert in &raised {
            match alert.severity {
                AlertSeverity::Critical | AlertSeverity::Emergency => error!("🚨 {}", alert.message),
                AlertSeverity::Warning | AlertSeverity::Info => warn!("⚠️  {}", alert.message),
            }
            self.publish_alert(alert).await;
        }
        raised
    }

    async fn publish_alert(&self, alert: &HealthAlert) {
        let priority = match alert.severity {
            AlertSeverity::Emergency | AlertSeverity::Critical => EventPriority::Critical,
            AlertSeverity::Warning => EventPriority::High,
            AlertSeverity::Info => EventPriority::Normal,
        };
        let payload = match serde_json::to_value(alert) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("⚠️  Alert {} not serializable: {}", alert.id, e);
                return;
            }
        };
        if let Err(e) = self
            .coordinator
            .pipeline()
            .publish("health_monitor", StreamType::SystemHealth, payload, priority, None)
            .await
        {
            debug!("Alert {} not published: {}", alert.id, e);
        }
    }

    pub async fn run_prediction(&self) -> usize {
        self.run_prediction_at(Utc::now()).await
    }

    /// Extrapolate the leading metric of every degrading profile. Returns the
    /// number of profiles with an outstanding prediction afterwards.
    pub async fn run_prediction_at(&self, now: DateTime<Utc>) -> usize {
        let leading = self.config.leading_metric;
        let threshold = *self.config.thresholds.get(leading);
        let horizon = self.config.prediction_horizon_secs as f64;

        let mut pending: Vec<(String, PendingAlert)> = Vec::new();
        let predicted = {
            let mut profiles = self.profiles.write().await;
            for profile in profiles.values_mut() {
                let trend = profile.trends.get(&leading).copied().unwrap_or_default();
                if trend != Trend::Degrading {
                    if profile.predicted_failure.take().is_some() {
                        info!("📉 Failure prediction cleared for {}", profile.server_id);
                    }
                    continue;
                }

                let samples: Vec<f64> = match profile.history.get(&leading) {
                    Some(history) => {
                        let skip = history.len().saturating_sub(self.config.trend_window);
                        history.iter().skip(skip).copied().collect()
                    }
                    None => continue,
                };
                let seconds = match seconds_to_threshold(&samples, &threshold, self.config.check_interval_secs) {
                    Some(seconds) if seconds <= horizon => seconds,
                    _ => continue,
                };

                let eta = now + ChronoDuration::seconds(seconds as i64);
                profile.predicted_failure = Some(eta);

                let first = samples.first().copied().unwrap_or_default();
                let last = samples.last().copied().unwrap_or_default();
                pending.push((
                    profile.server_id.clone(),
                    PendingAlert {
                        metric: leading,
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "{} {} up {:.1}% over the trend window, critical level expected in ~{} min",
                            profile.server_id,
                            leading,
                            calculate_percentage_change(first, last),
                            (seconds / 60.0).ceil() as i64
                        ),
                        value: last,
                        threshold: threshold.critical,
                    },
                ));
            }
            profiles.values().filter(|p| p.predicted_failure.is_some()).count()
        };

        for (server_id, alert) in pending {
            self.raise_pending(&server_id, vec![alert], now).await;
        }
        predicted
    }

    pub async fn active_alerts(&self) -> Vec<HealthAlert> {
        self.alerts.read().await.active()
    }

    pub async fn all_alerts(&self) -> Vec<HealthAlert> {
        self.alerts.read().await.all()
    }

    pub async fn acknowledge_alert(&self, id: &str) -> bool {
        self.alerts.write().await.acknowledge(id)
    }

    pub async fn resolve_alert(&self, id: &str) -> bool {
        self.alerts.write().await.resolve(id)
    }

    pub async fn summary(&self) -> HealthSummary {
        let profiles = self.profiles.read().await;
        let mut by_status = BTreeMap::new();
        for profile in profiles.values() {
            *by_status.entry(profile.status).or_insert(0) += 1;
        }
        let mean_availability = if profiles.is_empty() {
            0.0
        } else {
            profiles.values().map(|p| p.availability()).sum::<f64>() / profiles.len() as f64
        };

        HealthSummary {
            total_servers: profiles.len(),
            by_status,
            mean_availability,
            active_alerts: self.alerts.read().await.active().len(),
            predicted_failures: profiles.values().filter(|p| p.predicted_failure.is_some()).count(),
        }
    }

    /// Start the check loop and the prediction loop
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = Arc::clone(self);
        let checks = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(monitor.config.check_interval_secs.max(1)));
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                monitor.run_health_cycle().await;
            }
        });

        let monitor = Arc::clone(self);
        let predictions = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(monitor.config.prediction_interval_secs.max(1)));
            ticker.tick().await;
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let predicted = monitor.run_prediction().await;
                if predicted > 0 {
                    warn!("🔮 {} servers predicted to breach critical levels", predicted);
                }
            }
        });

        self.tasks.lock().await.extend([checks, predictions]);
        info!("🚀 Health monitor started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("🛑 Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::coordinator::CoordinatorConfig;
    use crate::domain::fusion::{DataFusionEngine, FusionConfig};
    use crate::domain::pipeline::EventPipeline;
    use crate::domain::registry::{Capability, ServerKind, ServerStatus};
    use crate::testing::{connected_registry, ScriptedInvoker};
    use std::collections::VecDeque;

    async fn monitor(invoker: Arc<ScriptedInvoker>) -> HealthMonitor {
        let registry = connected_registry(vec![
            ServerRecord::new("a", "a", ServerKind::Exchange).with_capability(Capability::new("exchange_data")),
        ])
        .await;
        let fusion = Arc::new(DataFusionEngine::new(
            FusionConfig::default(),
            registry.clone(),
            invoker.clone(),
        ));
        let pipeline = Arc::new(EventPipeline::new_default());
        let coordinator = Arc::new(CoordinatorService::new(
            CoordinatorConfig::default(),
            registry,
            fusion,
            pipeline,
            invoker,
        ));
        HealthMonitor::new(HealthConfig::default(), coordinator)
    }

    async fn record(monitor: &HealthMonitor, id: &str) -> ServerRecord {
        monitor.coordinator.registry().get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_trend_insufficient_until_window_filled() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_load", json!({ "cpu_usage": 40.0, "memory_usage": 40.0 }));
        let monitor = monitor(invoker).await;
        monitor.coordinator.sample_loads().await;

        let now = Utc::now();
        for _ in 0..19 {
            monitor.run_health_cycle_at(now).await;
        }
        let profile = monitor.profile("a").await.unwrap();
        assert_eq!(profile.trends[&MetricKind::Cpu], Trend::InsufficientData);
        assert_eq!(profile.trend, Trend::InsufficientData);

        monitor.run_health_cycle_at(now).await;
        let profile = monitor.profile("a").await.unwrap();
        assert_eq!(profile.trends[&MetricKind::Cpu], Trend::Stable);
        assert_eq!(profile.trend, Trend::Stable);
        assert_eq!(profile.status, HealthStatus::Healthy);
        assert_eq!(profile.total_checks, 20);
    }

    #[tokio::test]
    async fn test_repeated_breach_inside_cooldown_alerts_once() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_load", json!({ "cpu_usage": 95.0, "memory_usage": 40.0 }));
        let monitor = monitor(invoker).await;
        monitor.coordinator.sample_loads().await;

        let now = Utc::now();
        assert_eq!(monitor.run_health_cycle_at(now).await, 1);
        assert_eq!(monitor.run_health_cycle_at(now + ChronoDuration::seconds(30)).await, 0);

        let alerts = monitor.active_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, MetricKind::Cpu);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(monitor.profile("a").await.unwrap().status, HealthStatus::Critical);
        // Published as system health events
        assert_eq!(monitor.coordinator.pipeline().queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_server_fails_with_critical_alert() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let monitor = monitor(invoker.clone()).await;
        monitor
            .coordinator
            .registry()
            .update_status("a", ServerStatus::Disconnected, None)
            .await
            .unwrap();

        let alerts = monitor.check_server_at(&record(&monitor, "a").await, Utc::now()).await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].metric, MetricKind::Availability);
        let profile = monitor.profile("a").await.unwrap();
        assert_eq!(profile.status, HealthStatus::Failed);
        assert_eq!(profile.failed_checks, 1);
        assert!(invoker.servers_called("health_check").is_empty());
    }

    #[tokio::test]
    async fn test_failed_probes_raise_error_rate() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("a", "health_check", "unhealthy");
        let monitor = monitor(invoker).await;

        monitor.run_health_cycle().await;

        let profile = monitor.profile("a").await.unwrap();
        assert_eq!(profile.metrics[&MetricKind::ErrorRate].value, 1.0);
        assert_eq!(profile.metrics[&MetricKind::Availability].value, 0.0);
        assert_eq!(profile.status, HealthStatus::Critical);
        assert_eq!(profile.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_alert_auto_resolves_when_healthy() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("a", "get_load", json!({ "cpu_usage": 95.0, "memory_usage": 40.0 }));
        let monitor = monitor(invoker.clone()).await;
        monitor.coordinator.sample_loads().await;
        monitor.run_health_cycle().await;
        assert_eq!(monitor.active_alerts().await.len(), 1);

        invoker.reply("a", "get_load", json!({ "cpu_usage": 20.0, "memory_usage": 40.0 }));
        monitor.coordinator.sample_loads().await;
        monitor.run_health_cycle().await;

        assert!(monitor.active_alerts().await.is_empty());
        assert_eq!(monitor.all_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_prediction_for_degrading_leading_metric() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let monitor = monitor(invoker).await;
        let now = Utc::now();

        {
            let mut profiles = monitor.profiles.write().await;
            let mut profile = ServerHealthProfile::new("a");
            let history: VecDeque<f64> = (0..20).map(|i| 100.0 + 40.0 * i as f64).collect();
            profile.history.insert(MetricKind::ResponseTime, history);
            profile.trends.insert(MetricKind::ResponseTime, Trend::Degrading);
            profiles.insert("a".to_string(), profile);
        }

        assert_eq!(monitor.run_prediction_at(now).await, 1);
        let profile = monitor.profile("a").await.unwrap();
        // Last sample 860ms rising 40ms per 30s check, critical at 3000ms
        assert_eq!(profile.predicted_failure, Some(now + ChronoDuration::seconds(1605)));
        let alerts = monitor.active_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        monitor
            .profiles
            .write()
            .await
            .get_mut("a")
            .unwrap()
            .trends
            .insert(MetricKind::ResponseTime, Trend::Stable);
        assert_eq!(monitor.run_prediction_at(now).await, 0);
        assert!(monitor.profile("a").await.unwrap().predicted_failure.is_none());
        assert_eq!(monitor.summary().await.predicted_failures, 0);
    }

    #[tokio::test]
    async fn test_summary_counts_statuses() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let monitor = monitor(invoker).await;
        monitor.run_health_cycle().await;

        let summary = monitor.summary().await;
        assert_eq!(summary.total_servers, 1);
        assert_eq!(summary.by_status.get(&HealthStatus::Healthy), Some(&1));
        assert_eq!(summary.mean_availability, 1.0);
        assert_eq!(summary.active_alerts, 0);
    }
}
