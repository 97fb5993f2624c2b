//! Health state machine
//!
//! One cell per container, each behind its own lock. A cell holds the
//! buffered signals, the current status and uptime accounting. Status is
//! recomputed from the cell alone on every signal and on every sweep tick.

mod evaluator;
mod rules;

pub use evaluator::{evaluate, rule_fires, Evaluation, LogLatch, RunStateSignal, SignalBuffer};
pub use rules::{
    Comparator, LogPatternRule, LogPatternSpec, RuleSet, Severity, ThresholdRule, ThresholdRuleSpec,
};

use crate::models::{ContainerKey, ContainerRunState, HealthStatus, Timestamp};
use crate::observability::StructuredLogger;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default evaluation window (5 minutes)
pub const DEFAULT_EVALUATION_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub evaluation_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_window: DEFAULT_EVALUATION_WINDOW,
        }
    }
}

/// A metric value routed from the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSignal {
    pub metric: String,
    pub value: f64,
    pub timestamp: Timestamp,
}

/// A log line routed from the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct LogSignal {
    pub text: String,
    pub level: Option<String>,
    pub timestamp: Timestamp,
}

/// Time a container has spent up, accumulated per sweep tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Uptime {
    pub first_seen: Timestamp,
    pub up_ms: i64,
}

impl Uptime {
    /// Share of observed lifetime spent up, in percent, capped at 100
    pub fn percentage(&self, now: Timestamp) -> f64 {
        let observed = now - self.first_seen;
        if observed <= 0 {
            return 0.0;
        }
        (self.up_ms as f64 / observed as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug)]
struct HealthCell {
    signals: SignalBuffer,
    status: HealthStatus,
    reason: Option<String>,
    since: Timestamp,
    uptime: Uptime,
}

impl HealthCell {
    fn new(now: Timestamp) -> Self {
        Self {
            signals: SignalBuffer::default(),
            status: HealthStatus::Unknown,
            reason: None,
            since: now,
            uptime: Uptime {
                first_seen: now,
                up_ms: 0,
            },
        }
    }
}

/// Point-in-time health of one container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerHealth {
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the container entered its current status
    pub since: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal_at: Option<Timestamp>,
    /// Runtime state last reported by an agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<ContainerRunState>,
}

impl ContainerHealth {
    /// Health of a container nothing is known about
    pub fn unknown(key: &ContainerKey, now: Timestamp) -> Self {
        Self {
            container: key.id(),
            stack: key.stack.clone(),
            name: key.name.clone(),
            status: HealthStatus::Unknown,
            reason: None,
            since: now,
            last_signal_at: None,
            run_state: None,
        }
    }
}

/// A status change produced by a re-evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub container: ContainerKey,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

/// Per-container health state machine
pub struct HealthEngine {
    cells: DashMap<ContainerKey, Arc<RwLock<HealthCell>>>,
    rules: RuleSet,
    config: EngineConfig,
    logger: StructuredLogger,
}

impl HealthEngine {
    pub fn new(rules: RuleSet, config: EngineConfig, logger: StructuredLogger) -> Self {
        Self {
            cells: DashMap::new(),
            rules,
            config,
            logger,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    fn window_ms(&self) -> i64 {
        self.config.evaluation_window.as_millis() as i64
    }

    fn cell(&self, key: &ContainerKey, now: Timestamp) -> Arc<RwLock<HealthCell>> {
        self.cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(HealthCell::new(now))))
            .value()
            .clone()
    }

    fn existing(&self, key: &ContainerKey) -> Option<Arc<RwLock<HealthCell>>> {
        self.cells.get(key).map(|c| c.value().clone())
    }

    /// Start tracking a container in the Unknown state
    pub fn track(&self, key: &ContainerKey, now: Timestamp) {
        self.cell(key, now);
    }

    /// Apply a batch of metric values. Any new signal clears a pending log latch.
    /// Only metrics a threshold rule reads are buffered.
    pub async fn on_metrics(
        &self,
        key: &ContainerKey,
        signals: &[MetricSignal],
        live: bool,
        now: Timestamp,
    ) -> Option<Transition> {
        let window = self.window_ms();
        let cell = self.cell(key, now);
        let mut cell = cell.write().await;

        cell.signals.clear_latch();
        for signal in signals {
            if self.rules.watches(&signal.metric) {
                cell.signals
                    .push_metric(&signal.metric, signal.timestamp, signal.value, window);
            } else {
                cell.signals.note_metric(signal.timestamp);
            }
        }
        self.apply(key, &mut cell, live, now)
    }

    /// Apply a batch of log lines. A line matching a pattern rule latches its
    /// severity until the next signal arrives.
    pub async fn on_logs(
        &self,
        key: &ContainerKey,
        lines: &[LogSignal],
        live: bool,
        now: Timestamp,
    ) -> Option<Transition> {
        let cell = self.cell(key, now);
        let mut cell = cell.write().await;

        cell.signals.clear_latch();
        for line in lines {
            cell.signals.note_log(line.timestamp);
            if let Some(rule) = self.rules.match_log(&line.text, line.level.as_deref()) {
                cell.signals.latch(LogLatch {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    timestamp: line.timestamp,
                });
            }
        }
        self.apply(key, &mut cell, live, now)
    }

    /// Apply a runtime state report. Exited or dead containers read Unhealthy
    /// until a newer report says otherwise.
    pub async fn on_state(
        &self,
        key: &ContainerKey,
        signal: RunStateSignal,
        live: bool,
        now: Timestamp,
    ) -> Option<Transition> {
        let cell = self.cell(key, now);
        let mut cell = cell.write().await;

        cell.signals.clear_latch();
        cell.signals.set_run_state(signal);
        self.apply(key, &mut cell, live, now)
    }

    /// Stop tracking a container. Returns `false` if it was not tracked.
    pub fn forget(&self, key: &ContainerKey) -> bool {
        self.cells.remove(key).is_some()
    }

    /// Re-evaluate without new signals, e.g. after a liveness change
    pub async fn reevaluate(&self, key: &ContainerKey, live: bool, now: Timestamp) -> Option<Transition> {
        let cell = self.existing(key)?;
        let mut cell = cell.write().await;
        self.apply(key, &mut cell, live, now)
    }

    /// Sweep tick: credit `elapsed` to uptime if the container was up
    /// during it, then re-evaluate
    pub async fn tick(
        &self,
        key: &ContainerKey,
        live: bool,
        now: Timestamp,
        elapsed: Duration,
    ) -> Option<Transition> {
        let cell = self.cell(key, now);
        let mut cell = cell.write().await;
        if cell.status.is_up() {
            cell.uptime.up_ms += elapsed.as_millis() as i64;
        }
        self.apply(key, &mut cell, live, now)
    }

    fn apply(
        &self,
        key: &ContainerKey,
        cell: &mut HealthCell,
        live: bool,
        now: Timestamp,
    ) -> Option<Transition> {
        cell.signals.prune(now - self.window_ms());
        let eval = evaluate(&cell.signals, live, now, &self.rules, self.window_ms());
        let from = cell.status;
        cell.reason = eval.reason;

        if eval.status == from {
            return None;
        }

        cell.status = eval.status;
        cell.since = now;
        self.logger.log_status_change(
            &key.id(),
            from.as_str(),
            eval.status.as_str(),
            cell.reason.as_deref(),
        );
        Some(Transition {
            container: key.clone(),
            from,
            to: eval.status,
        })
    }

    /// Current status; Unknown for containers never seen
    pub async fn status(&self, key: &ContainerKey) -> HealthStatus {
        match self.existing(key) {
            Some(cell) => cell.read().await.status,
            None => HealthStatus::Unknown,
        }
    }

    pub async fn health(&self, key: &ContainerKey, now: Timestamp) -> ContainerHealth {
        let Some(cell) = self.existing(key) else {
            return ContainerHealth::unknown(key, now);
        };
        let cell = cell.read().await;
        ContainerHealth {
            container: key.id(),
            stack: key.stack.clone(),
            name: key.name.clone(),
            status: cell.status,
            reason: cell.reason.clone(),
            since: cell.since,
            last_signal_at: cell.signals.last_signal_at(),
            run_state: cell.signals.run_state().map(|s| s.state),
        }
    }

    pub async fn uptime(&self, key: &ContainerKey) -> Option<Uptime> {
        let cell = self.existing(key)?;
        let uptime = cell.read().await.uptime;
        Some(uptime)
    }

    /// Containers with a health cell, sorted
    pub fn containers(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<ContainerKey> = self.cells.iter().map(|c| c.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of containers in each status
    pub async fn status_counts(&self) -> Vec<(HealthStatus, i64)> {
        let cells: Vec<Arc<RwLock<HealthCell>>> =
            self.cells.iter().map(|c| c.value().clone()).collect();
        let mut counts: Vec<(HealthStatus, i64)> =
            HealthStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for cell in cells {
            let status = cell.read().await.status;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 += 1;
            }
        }
        counts
    }
}
