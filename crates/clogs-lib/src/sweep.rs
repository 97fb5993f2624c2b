//! Periodic liveness sweep
//!
//! The sole source of liveness-lost transitions for agents that go silent
//! without a final message. Each tick marks overdue agents stale, re-evaluates
//! every container, credits uptime, evicts expired data and touches the
//! liveness marker.

use crate::engine::{HealthEngine, Transition};
use crate::health::{components, HealthRegistry, LivenessMarker, ProgressTracker};
use crate::models::{now_millis, HealthStatus, Timestamp};
use crate::observability::{ServerMetrics, StructuredLogger};
use crate::registry::AgentRegistry;
use crate::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub newly_stale_agents: Vec<String>,
    pub transitions: Vec<Transition>,
    pub evicted: usize,
    pub containers: usize,
}

pub struct SweepTask {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    engine: Arc<HealthEngine>,
    health: HealthRegistry,
    /// Marked after each completed sweep
    progress: ProgressTracker,
    metrics: ServerMetrics,
    logger: StructuredLogger,
    marker: Option<LivenessMarker>,
    interval: Duration,
    last_tick: Option<Timestamp>,
}

impl SweepTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn Store>,
        engine: Arc<HealthEngine>,
        health: HealthRegistry,
        progress: ProgressTracker,
        metrics: ServerMetrics,
        logger: StructuredLogger,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            engine,
            health,
            progress,
            metrics,
            logger,
            marker: None,
            interval: interval.max(Duration::from_millis(10)),
            last_tick: None,
        }
    }

    pub fn with_marker(mut self, marker: LivenessMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting liveness sweep"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once(now_millis()).await;
                    if !report.transitions.is_empty() || !report.newly_stale_agents.is_empty() {
                        debug!(
                            stale_agents = report.newly_stale_agents.len(),
                            transitions = report.transitions.len(),
                            containers = report.containers,
                            "Sweep complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down liveness sweep");
                    break;
                }
            }
        }
    }

    /// One sweep at `now`
    pub async fn sweep_once(&mut self, now: Timestamp) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        let agents = self.registry.sweep(now);
        for (agent_id, silent_for) in &agents.newly_stale {
            self.logger.log_agent_stale(agent_id, *silent_for);
            report.newly_stale_agents.push(agent_id.clone());
        }

        // Credit at most two intervals, so a stalled process does not count as uptime
        let cap = 2 * self.interval.as_millis() as i64;
        let elapsed_ms = self
            .last_tick
            .map(|last| (now - last).clamp(0, cap))
            .unwrap_or(0);
        self.last_tick = Some(now);
        let elapsed = Duration::from_millis(elapsed_ms as u64);

        let containers = self.registry.containers();
        report.containers = containers.len();
        for container in &containers {
            let live = self.registry.is_container_live(&container.key, now);
            if let Some(transition) = self.engine.tick(&container.key, live, now, elapsed).await {
                if transition.to == HealthStatus::Stale {
                    debug!(container = %container.key, "Container lost all live agents");
                }
                report.transitions.push(transition);
            }
        }

        report.evicted = self.store.evict_expired(now).await;

        self.metrics.set_agents(
            agents.active as i64,
            agents.stale as i64,
            agents.retired as i64,
        );
        self.metrics.set_containers_tracked(report.containers as i64);
        self.metrics
            .set_containers_by_status(&self.engine.status_counts().await);

        self.progress.mark(now);
        match &self.marker {
            Some(marker) => match marker.touch(now).await {
                Ok(()) => self.health.set_healthy(components::SWEEP).await,
                Err(e) => {
                    warn!(path = %marker.path().display(), error = %e, "Failed to touch liveness marker");
                    self.health
                        .set_degraded(components::SWEEP, format!("liveness marker: {e}"))
                        .await;
                }
            },
            None => self.health.set_healthy(components::SWEEP).await,
        }

        self.metrics
            .observe_sweep_latency(started.elapsed().as_secs_f64());
        report
    }
}
