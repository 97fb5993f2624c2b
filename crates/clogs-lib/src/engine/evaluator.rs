//! Pure health evaluation
//!
//! `evaluate` is a function of the buffered signals, the liveness flag, the
//! rules and `now`. Re-running it with the same inputs yields the same status.

use super::rules::{RuleSet, Severity, ThresholdRule};
use crate::models::{ContainerRunState, HealthStatus, Timestamp};
use std::collections::{HashMap, VecDeque};

/// Most recent signals per metric are kept up to this many entries
const MAX_SIGNALS_PER_METRIC: usize = 512;

/// A log line that matched a pattern rule. Holds until the next signal.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLatch {
    pub rule: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
}

/// Last runtime state an agent reported for the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStateSignal {
    pub state: ContainerRunState,
    pub since: Timestamp,
    pub reported_at: Timestamp,
}

/// Signals buffered for one container.
///
/// Values are only buffered for metrics some rule reads; other metrics only
/// advance the last-seen timestamp, so the buffer is bounded by the rule set.
#[derive(Debug, Clone, Default)]
pub struct SignalBuffer {
    metrics: HashMap<String, VecDeque<(Timestamp, f64)>>,
    last_metric_at: Option<Timestamp>,
    last_log_at: Option<Timestamp>,
    latch: Option<LogLatch>,
    run_state: Option<RunStateSignal>,
}

fn advance(slot: &mut Option<Timestamp>, timestamp: Timestamp) {
    *slot = Some(slot.map_or(timestamp, |t| t.max(timestamp)));
}

impl SignalBuffer {
    /// Record that a metric arrived without buffering its value
    pub fn note_metric(&mut self, timestamp: Timestamp) {
        advance(&mut self.last_metric_at, timestamp);
    }

    /// Record a metric value, trimming samples that fell out of `window_ms`
    /// relative to the newest one
    pub fn push_metric(&mut self, metric: &str, timestamp: Timestamp, value: f64, window_ms: i64) {
        self.note_metric(timestamp);
        let series = self.metrics.entry(metric.to_string()).or_default();
        // keep ordered by timestamp; agents may deliver late samples
        let pos = series.partition_point(|(ts, _)| *ts <= timestamp);
        series.insert(pos, (timestamp, value));

        if let Some(&(newest, _)) = series.back() {
            while series.front().map_or(false, |(ts, _)| *ts < newest - window_ms) {
                series.pop_front();
            }
        }
        while series.len() > MAX_SIGNALS_PER_METRIC {
            series.pop_front();
        }
    }

    pub fn note_log(&mut self, timestamp: Timestamp) {
        advance(&mut self.last_log_at, timestamp);
    }

    /// Keep the newest reported runtime state
    pub fn set_run_state(&mut self, signal: RunStateSignal) {
        if self
            .run_state
            .map_or(true, |current| signal.reported_at >= current.reported_at)
        {
            self.run_state = Some(signal);
        }
    }

    pub fn run_state(&self) -> Option<RunStateSignal> {
        self.run_state
    }

    /// Drop buffered series with nothing at or after `since`
    pub fn prune(&mut self, since: Timestamp) {
        self.metrics
            .retain(|_, series| series.back().map_or(false, |(ts, _)| *ts >= since));
    }

    /// Number of metric series currently buffered
    pub fn series_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn latch(&mut self, latch: LogLatch) {
        let replace = match &self.latch {
            Some(current) => latch.severity.status().worst(current.severity.status()) == latch.severity.status(),
            None => true,
        };
        if replace {
            self.latch = Some(latch);
        }
    }

    pub fn clear_latch(&mut self) {
        self.latch = None;
    }

    pub fn latched(&self) -> Option<&LogLatch> {
        self.latch.as_ref()
    }

    /// Newest timestamp across all signals
    pub fn last_signal_at(&self) -> Option<Timestamp> {
        [
            self.last_metric_at,
            self.last_log_at,
            self.run_state.map(|s| s.reported_at),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    fn in_window(&self, metric: &str, since: Timestamp) -> Vec<(Timestamp, f64)> {
        self.metrics
            .get(metric)
            .map(|s| s.iter().filter(|(ts, _)| *ts >= since).copied().collect())
            .unwrap_or_default()
    }
}

/// Outcome of an evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub status: HealthStatus,
    /// The rule or condition that determined the status, if any
    pub reason: Option<String>,
}

impl Evaluation {
    fn new(status: HealthStatus, reason: Option<String>) -> Self {
        Self { status, reason }
    }
}

/// Whether a threshold rule fires over the given time-ordered samples: the
/// latest sample violates and the unbroken violating run reaches back at
/// least the rule's sustain duration.
pub fn rule_fires(rule: &ThresholdRule, samples: &[(Timestamp, f64)]) -> bool {
    let Some(&(latest_ts, latest)) = samples.last() else {
        return false;
    };
    if !rule.violated_by(latest) {
        return false;
    }

    let run_start = samples
        .iter()
        .rev()
        .take_while(|(_, value)| rule.violated_by(*value))
        .last()
        .map(|(ts, _)| *ts)
        .unwrap_or(latest_ts);

    latest_ts - run_start >= rule.sustain.as_millis() as i64
}

/// Derive a container's status.
///
/// Staleness dominates every other signal. A reported runtime state that is
/// not running holds regardless of the window. Without data in the window
/// the status is Unknown. Otherwise the worst of all firing rules applies,
/// with Healthy as the baseline.
pub fn evaluate(
    signals: &SignalBuffer,
    live: bool,
    now: Timestamp,
    rules: &RuleSet,
    window_ms: i64,
) -> Evaluation {
    if !live {
        return Evaluation::new(HealthStatus::Stale, Some("no live agent".to_string()));
    }

    let since = now - window_ms;
    let has_metrics = signals.last_metric_at.map_or(false, |ts| ts >= since);
    let has_logs = signals.last_log_at.map_or(false, |ts| ts >= since);
    let latch = signals.latch.as_ref().filter(|l| l.timestamp >= since);
    let impaired = signals
        .run_state
        .and_then(|s| s.state.impairment().map(|status| (s.state, status)));
    let has_state = signals.run_state.map_or(false, |s| s.reported_at >= since);

    if !has_metrics && !has_logs && !has_state && latch.is_none() && impaired.is_none() {
        return Evaluation::new(HealthStatus::Unknown, None);
    }

    let mut result = Evaluation::new(HealthStatus::Healthy, None);

    if let Some((state, status)) = impaired {
        result = Evaluation::new(status, Some(format!("container {}", state)));
    }

    for rule in &rules.thresholds {
        let samples = signals.in_window(&rule.metric, since);
        if rule_fires(rule, &samples) {
            let status = rule.severity.status();
            if status.worst(result.status) == status && status != result.status {
                result = Evaluation::new(status, Some(rule.to_string()));
            }
        }
    }

    if let Some(latch) = latch {
        let status = latch.severity.status();
        if status.worst(result.status) == status && status != result.status {
            result = Evaluation::new(status, Some(format!("log pattern `{}`", latch.rule)));
        }
    }

    result
}
