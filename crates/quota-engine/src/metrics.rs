//! Prometheus metrics for accounting and enforcement

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::info;

/// Engine metrics, registered in a private registry
#[derive(Clone)]
pub struct UsageMetrics {
    /// Log lines by outcome
    pub log_lines_total: IntCounterVec,

    /// Bytes attributed to tracked users
    pub bytes_accounted_total: IntCounter,

    /// Successful lock state changes
    pub lock_transitions_total: IntCounterVec,

    /// Failures during enforcement ticks
    pub enforcement_failures_total: IntCounterVec,

    pub enforcement_tick_seconds: HistogramVec,

    pub tracked_users: IntGauge,

    registry: Registry,
}

impl UsageMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let log_lines_total = IntCounterVec::new(
            Opts::new("quota_log_lines_total", "Proxy log lines processed by outcome"),
            &["result"],
        )?;

        let bytes_accounted_total = IntCounter::new(
            "quota_bytes_accounted_total",
            "Bytes attributed to tracked users",
        )?;

        let lock_transitions_total = IntCounterVec::new(
            Opts::new("quota_lock_transitions_total", "Account lock state changes"),
            &["action"],
        )?;

        let enforcement_failures_total = IntCounterVec::new(
            Opts::new(
                "quota_enforcement_failures_total",
                "Failures during enforcement ticks",
            ),
            &["stage"],
        )?;

        let enforcement_tick_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quota_enforcement_tick_seconds",
                "Duration of one enforcement tick",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["outcome"],
        )?;

        let tracked_users = IntGauge::new("quota_tracked_users", "Users in the registry")?;

        registry.register(Box::new(log_lines_total.clone()))?;
        registry.register(Box::new(bytes_accounted_total.clone()))?;
        registry.register(Box::new(lock_transitions_total.clone()))?;
        registry.register(Box::new(enforcement_failures_total.clone()))?;
        registry.register(Box::new(enforcement_tick_seconds.clone()))?;
        registry.register(Box::new(tracked_users.clone()))?;

        info!("Usage metrics initialized");

        Ok(Self {
            log_lines_total,
            bytes_accounted_total,
            lock_transitions_total,
            enforcement_failures_total,
            enforcement_tick_seconds,
            tracked_users,
            registry,
        })
    }

    pub fn record_line(&self, result: &str) {
        self.log_lines_total.with_label_values(&[result]).inc();
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_accounted_total.inc_by(bytes);
    }

    pub fn record_lock_transition(&self, locked: bool) {
        let action = if locked { "lock" } else { "unlock" };
        self.lock_transitions_total.with_label_values(&[action]).inc();
    }

    pub fn record_enforcement_failure(&self, stage: &str) {
        self.enforcement_failures_total
            .with_label_values(&[stage])
            .inc();
    }

    /// Text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::EngineError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_export() {
        let metrics = UsageMetrics::new().unwrap();
        metrics.record_line("matched");
        metrics.record_bytes(1024);
        metrics.record_lock_transition(true);

        let text = metrics.export().unwrap();
        assert!(text.contains("quota_log_lines_total{result=\"matched\"} 1"));
        assert!(text.contains("quota_bytes_accounted_total 1024"));
        assert!(text.contains("quota_lock_transitions_total{action=\"lock\"} 1"));
    }

    #[test]
    fn test_independent_instances() {
        // private registries allow several engines per process
        assert!(UsageMetrics::new().is_ok());
        assert!(UsageMetrics::new().is_ok());
    }
}
