//! Alert history with per-(server, metric, severity) cooldown

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use super::{AlertSeverity, HealthAlert, MetricKind};
use crate::shared::utils::generate_id;

type CooldownKey = (String, MetricKind, AlertSeverity);

/// Capped alert history. When full, the oldest resolved alert is evicted
/// first; unresolved alerts only go once no resolved one is left.
pub struct AlertBook {
    alerts: VecDeque<HealthAlert>,
    last_raised: HashMap<CooldownKey, DateTime<Utc>>,
    cooldown: Duration,
    capacity: usize,
}

impl AlertBook {
    pub fn new(cooldown_secs: u64, capacity: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            last_raised: HashMap::new(),
            cooldown: Duration::seconds(cooldown_secs as i64),
            capacity: capacity.max(1),
        }
    }

    /// Record an alert unless the same (server, metric, severity) fired
    /// within the cooldown window
    #[allow(clippy::too_many_arguments)]
    pub fn raise(
        &mut self,
        server_id: &str,
        metric: MetricKind,
        severity: AlertSeverity,
        message: String,
        value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<HealthAlert> {
        let key = (server_id.to_string(), metric, severity);
        if let Some(last) = self.last_raised.get(&key) {
            if now - *last < self.cooldown {
                return None;
            }
        }
        self.last_raised.insert(key, now);

        let alert = HealthAlert {
            id: generate_id(),
            server_id: server_id.to_string(),
            severity,
            metric,
            message,
            value,
            threshold,
            timestamp: now,
            acknowledged: false,
            resolved: false,
        };

        if self.alerts.len() >= self.capacity {
            match self.alerts.iter().position(|a| a.resolved) {
                Some(index) => {
                    self.alerts.remove(index);
                }
                None => {
                    self.alerts.pop_front();
                }
            }
        }
        self.alerts.push_back(alert.clone());
        Some(alert)
    }

    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn resolve(&mut self, id: &str) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Resolve every open alert for a metric that is healthy again
    pub fn resolve_metric(&mut self, server_id: &str, metric: MetricKind) -> usize {
        let mut resolved = 0;
        for alert in self
            .alerts
            .iter_mut()
            .filter(|a| !a.resolved && a.server_id == server_id && a.metric == metric)
        {
            alert.resolved = true;
            resolved += 1;
        }
        resolved
    }

    pub fn active(&self) -> Vec<HealthAlert> {
        self.alerts.iter().filter(|a| !a.resolved).cloned().collect()
    }

    pub fn all(&self) -> Vec<HealthAlert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
