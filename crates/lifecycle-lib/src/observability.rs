//! Observability for the lifecycle manager
//!
//! Provides:
//! - Prometheus metrics in an owned registry (resident models, cache bytes,
//!   cold starts, evictions, checkpoint failures, score latency)
//! - Structured lifecycle event logging with tracing

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for score latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Lifecycle metrics registered in their own registry
///
/// Cheap to clone; clones share the underlying collectors.
#[derive(Clone)]
pub struct LifecycleMetrics {
    registry: Registry,
    resident_models: IntGauge,
    cache_bytes: IntGauge,
    cache_budget_bytes: IntGauge,
    pending_flushes: IntGauge,
    ring_version: IntGauge,
    cold_starts: IntCounterVec,
    evictions: IntCounterVec,
    checkpoint_failures: IntCounter,
    score_latency_seconds: Histogram,
}

impl LifecycleMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("ad_lifecycle".to_string()), None)?;

        let resident_models = IntGauge::new("resident_models", "Model pairs resident in memory")?;
        let cache_bytes = IntGauge::new("cache_bytes", "Bytes used by resident model pairs")?;
        let cache_budget_bytes =
            IntGauge::new("cache_budget_bytes", "Memory budget for resident model pairs")?;
        let pending_flushes = IntGauge::new(
            "pending_flushes",
            "Evicted models whose checkpoint save has not succeeded yet",
        )?;
        let ring_version = IntGauge::new("ring_version", "Membership version of the hash ring")?;
        let cold_starts = IntCounterVec::new(
            Opts::new("cold_starts_total", "Cold-start jobs by outcome"),
            &["outcome"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Model evictions by reason"),
            &["reason"],
        )?;
        let checkpoint_failures =
            IntCounter::new("checkpoint_failures_total", "Failed checkpoint saves")?;
        let score_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("score_latency_seconds", "Time spent scoring one vector")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(resident_models.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(cache_budget_bytes.clone()))?;
        registry.register(Box::new(pending_flushes.clone()))?;
        registry.register(Box::new(ring_version.clone()))?;
        registry.register(Box::new(cold_starts.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(checkpoint_failures.clone()))?;
        registry.register(Box::new(score_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            resident_models,
            cache_bytes,
            cache_budget_bytes,
            pending_flushes,
            ring_version,
            cold_starts,
            evictions,
            checkpoint_failures,
            score_latency_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every lifecycle metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn set_cache_usage(&self, resident: usize, bytes: usize) {
        self.resident_models.set(resident as i64);
        self.cache_bytes.set(bytes as i64);
    }

    pub fn set_cache_budget(&self, bytes: usize) {
        self.cache_budget_bytes.set(bytes as i64);
    }

    pub fn set_pending_flushes(&self, count: usize) {
        self.pending_flushes.set(count as i64);
    }

    pub fn set_ring_version(&self, version: u64) {
        self.ring_version.set(version as i64);
    }

    pub fn inc_cold_start(&self, outcome: &str) {
        self.cold_starts.with_label_values(&[outcome]).inc();
    }

    pub fn inc_eviction(&self, reason: &str) {
        self.evictions.with_label_values(&[reason]).inc();
    }

    pub fn inc_checkpoint_failures(&self) {
        self.checkpoint_failures.inc();
    }

    pub fn observe_score_latency(&self, elapsed: Duration) {
        self.score_latency_seconds.observe(elapsed.as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn cold_start_count(&self, outcome: &str) -> u64 {
        self.cold_starts.with_label_values(&[outcome]).get()
    }

    #[cfg(test)]
    pub(crate) fn eviction_count(&self, reason: &str) -> u64 {
        self.evictions.with_label_values(&[reason]).get()
    }
}

impl std::fmt::Debug for LifecycleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMetrics").finish_non_exhaustive()
    }
}

/// Structured logger for lifecycle events
///
/// Every event carries the `event` name and the local node id so logs from
/// a cluster can be joined on them.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_id: String,
}

impl StructuredLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn log_model_evicted(&self, detector_id: &str, reason: &str, size_bytes: usize, checkpointed: bool) {
        info!(
            event = "model_evicted",
            node = %self.node_id,
            detector_id = %detector_id,
            reason = %reason,
            size_bytes = size_bytes,
            checkpointed = checkpointed,
            "Model evicted"
        );
    }

    /// Eviction whose checkpoint could not be written
    pub fn log_flush_pending(&self, detector_id: &str, error: &str) {
        error!(
            event = "checkpoint_flush_pending",
            node = %self.node_id,
            detector_id = %detector_id,
            error = %error,
            "Checkpoint save failed; model state will be lost if the retry also fails"
        );
    }

    pub fn log_cold_start_completed(&self, detector_id: &str, outcome: &str, elapsed: Duration) {
        info!(
            event = "cold_start_completed",
            node = %self.node_id,
            detector_id = %detector_id,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cold start completed"
        );
    }

    pub fn log_cold_start_failed(&self, detector_id: &str, error: &str) {
        warn!(
            event = "cold_start_failed",
            node = %self.node_id,
            detector_id = %detector_id,
            error = %error,
            "Cold start failed"
        );
    }

    pub fn log_ring_rebuilt(&self, version: u64, nodes: usize, handed_off: usize) {
        info!(
            event = "ring_rebuilt",
            node = %self.node_id,
            version = version,
            nodes = nodes,
            handed_off = handed_off,
            "Hash ring rebuilt"
        );
    }

    pub fn log_checkpoint_purge(&self, reason: &str, purged: usize) {
        info!(
            event = "checkpoint_purge",
            node = %self.node_id,
            reason = %reason,
            purged = purged,
            "Purged checkpoints"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "node_started",
            node = %self.node_id,
            version = %version,
            "Anomaly detection node started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, flushed: usize) {
        info!(
            event = "node_shutdown",
            node = %self.node_id,
            reason = %reason,
            flushed = flushed,
            "Anomaly detection node shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_rendered() {
        let metrics = LifecycleMetrics::new().unwrap();
        metrics.set_cache_usage(3, 4096);
        metrics.inc_cold_start("trained");
        metrics.inc_eviction("memory_pressure");
        metrics.observe_score_latency(Duration::from_micros(300));

        let text = metrics.render();
        assert!(text.contains("ad_lifecycle_resident_models 3"));
        assert!(text.contains("ad_lifecycle_cold_starts_total{outcome=\"trained\"} 1"));
        assert!(text.contains("ad_lifecycle_score_latency_seconds_count 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = LifecycleMetrics::new().unwrap();
        let b = LifecycleMetrics::new().unwrap();
        a.inc_checkpoint_failures();
        assert!(a.render().contains("ad_lifecycle_checkpoint_failures_total 1"));
        assert!(b.render().contains("ad_lifecycle_checkpoint_failures_total 0"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("node-1");
        assert_eq!(logger.node_id, "node-1");
    }
}
