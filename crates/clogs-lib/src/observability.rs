//! Observability infrastructure for the Clogs server
//!
//! Provides:
//! - Prometheus metrics (event intake, store write failures, agent and container gauges, latencies)
//! - Structured JSON logging with tracing

use crate::models::HealthStatus;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ServerMetricsInner {
    events_accepted: IntCounterVec,
    events_rejected: IntCounterVec,
    events_dropped: IntCounterVec,
    store_write_retries: IntCounter,
    store_write_failures: IntCounter,
    ingest_latency_seconds: Histogram,
    sweep_latency_seconds: Histogram,
    agents: IntGaugeVec,
    containers_tracked: IntGauge,
    containers_by_status: IntGaugeVec,
    out_of_order_samples: IntCounter,
}

impl ServerMetricsInner {
    fn new() -> Self {
        Self {
            events_accepted: register_int_counter_vec!(
                "clogs_server_events_accepted_total",
                "Envelopes accepted into an intake queue",
                &["kind"]
            )
            .expect("Failed to register events_accepted"),

            events_rejected: register_int_counter_vec!(
                "clogs_server_events_rejected_total",
                "Envelopes rejected at the transport endpoint",
                &["reason"]
            )
            .expect("Failed to register events_rejected"),

            events_dropped: register_int_counter_vec!(
                "clogs_server_events_dropped_total",
                "Samples or log lines dropped after store retries were exhausted",
                &["kind"]
            )
            .expect("Failed to register events_dropped"),

            store_write_retries: register_int_counter!(
                "clogs_server_store_write_retries_total",
                "Store writes retried after a failure"
            )
            .expect("Failed to register store_write_retries"),

            store_write_failures: register_int_counter!(
                "clogs_server_store_write_failures_total",
                "Store writes that failed on every attempt"
            )
            .expect("Failed to register store_write_failures"),

            ingest_latency_seconds: register_histogram!(
                "clogs_server_ingest_latency_seconds",
                "Time spent processing one event through the pipeline",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ingest_latency_seconds"),

            sweep_latency_seconds: register_histogram!(
                "clogs_server_sweep_latency_seconds",
                "Time spent in one liveness sweep",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sweep_latency_seconds"),

            agents: register_int_gauge_vec!(
                "clogs_server_agents",
                "Known agents by liveness state",
                &["state"]
            )
            .expect("Failed to register agents"),

            containers_tracked: register_int_gauge!(
                "clogs_server_containers_tracked",
                "Number of containers known to the registry"
            )
            .expect("Failed to register containers_tracked"),

            containers_by_status: register_int_gauge_vec!(
                "clogs_server_containers_by_status",
                "Containers per derived health status",
                &["status"]
            )
            .expect("Failed to register containers_by_status"),

            out_of_order_samples: register_int_counter!(
                "clogs_server_out_of_order_samples_total",
                "Metric samples that arrived after a newer sample of the same series"
            )
            .expect("Failed to register out_of_order_samples"),
        }
    }
}

/// Server metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    _private: (),
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServerMetricsInner {
        GLOBAL_METRICS.get_or_init(ServerMetricsInner::new)
    }

    pub fn inc_events_accepted(&self, kind: &str) {
        self.inner().events_accepted.with_label_values(&[kind]).inc();
    }

    pub fn inc_events_rejected(&self, reason: &str) {
        self.inner().events_rejected.with_label_values(&[reason]).inc();
    }

    pub fn inc_events_dropped(&self, kind: &str) {
        self.inner().events_dropped.with_label_values(&[kind]).inc();
    }

    pub fn events_dropped(&self, kind: &str) -> u64 {
        self.inner().events_dropped.with_label_values(&[kind]).get()
    }

    pub fn inc_store_write_retries(&self) {
        self.inner().store_write_retries.inc();
    }

    pub fn inc_store_write_failures(&self) {
        self.inner().store_write_failures.inc();
    }

    pub fn inc_out_of_order_samples(&self) {
        self.inner().out_of_order_samples.inc();
    }

    pub fn observe_ingest_latency(&self, duration_secs: f64) {
        self.inner().ingest_latency_seconds.observe(duration_secs);
    }

    pub fn observe_sweep_latency(&self, duration_secs: f64) {
        self.inner().sweep_latency_seconds.observe(duration_secs);
    }

    /// Update agent gauges after a sweep
    pub fn set_agents(&self, active: i64, stale: i64, retired: i64) {
        let agents = &self.inner().agents;
        agents.with_label_values(&["active"]).set(active);
        agents.with_label_values(&["stale"]).set(stale);
        agents.with_label_values(&["retired"]).set(retired);
    }

    pub fn set_containers_tracked(&self, count: i64) {
        self.inner().containers_tracked.set(count);
    }

    /// Replace the per-status container gauges
    pub fn set_containers_by_status(&self, counts: &[(HealthStatus, i64)]) {
        for status in HealthStatus::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            self.inner()
                .containers_by_status
                .with_label_values(&[status.as_str()])
                .set(count);
        }
    }
}

/// Structured logger for server events
///
/// Provides consistent JSON-formatted logging for agent lifecycle,
/// health transitions and dropped data.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log server startup
    pub fn log_startup(&self, version: &str, listen_port: u16) {
        info!(
            event = "server_started",
            instance = %self.instance,
            server_version = %version,
            listen_port = listen_port,
            "Clogs server started"
        );
    }

    /// Log server shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Clogs server shutting down"
        );
    }

    /// Log an agent registration (explicit or implicit)
    pub fn log_agent_registered(&self, agent_id: &str, implicit: bool, containers: usize) {
        info!(
            event = "agent_registered",
            instance = %self.instance,
            agent_id = %agent_id,
            implicit = implicit,
            declared_containers = containers,
            "Agent registered"
        );
    }

    /// Log an agent that missed its heartbeat deadline
    pub fn log_agent_stale(&self, agent_id: &str, silent_for_ms: i64) {
        warn!(
            event = "agent_stale",
            instance = %self.instance,
            agent_id = %agent_id,
            silent_for_ms = silent_for_ms,
            "Agent missed heartbeat deadline, marked stale"
        );
    }

    /// Log a container health transition
    pub fn log_status_change(
        &self,
        container: &str,
        from: &str,
        to: &str,
        reason: Option<&str>,
    ) {
        match to {
            "unhealthy" | "stale" => {
                warn!(
                    event = "container_status_changed",
                    instance = %self.instance,
                    container = %container,
                    from = %from,
                    to = %to,
                    reason = ?reason,
                    "Container health degraded"
                );
            }
            _ => {
                info!(
                    event = "container_status_changed",
                    instance = %self.instance,
                    container = %container,
                    from = %from,
                    to = %to,
                    reason = ?reason,
                    "Container health changed"
                );
            }
        }
    }

    /// Log data dropped after the store gave up
    pub fn log_dropped(&self, agent_id: &str, container: &str, kind: &str, attempts: u32, error: &str) {
        warn!(
            event = "event_dropped",
            instance = %self.instance,
            agent_id = %agent_id,
            container = %container,
            kind = %kind,
            attempts = attempts,
            error = %error,
            "Store write failed after retries, dropping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_metrics_creation() {
        // Prometheus uses a global registry; the OnceLock keeps registration single.
        let metrics = ServerMetrics::new();
        let again = ServerMetrics::new();

        metrics.inc_events_accepted("heartbeat");
        metrics.inc_events_rejected("decode");
        metrics.inc_store_write_retries();
        metrics.observe_ingest_latency(0.001);
        metrics.observe_sweep_latency(0.002);
        metrics.set_agents(2, 1, 0);
        metrics.set_containers_tracked(5);
        metrics.set_containers_by_status(&[(HealthStatus::Healthy, 4), (HealthStatus::Stale, 1)]);

        let before = again.events_dropped("test_only");
        metrics.inc_events_dropped("test_only");
        assert_eq!(again.events_dropped("test_only"), before + 1);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("clogs-test");
        assert_eq!(logger.instance, "clogs-test");
    }
}
