//! Time-series and log storage
//!
//! Bounded, per-container retention of metric samples and log lines. Each
//! container's data sits behind its own lock, so writers for one container never
//! contend with readers of another.

mod logs;
mod series;

pub use logs::{LogBuffer, LogQuery};
pub use series::MetricSeries;

use crate::error::StoreError;
use crate::models::{ContainerKey, LogLine, MetricSample, TimeRange, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Default samples kept per (container, metric) series
pub const DEFAULT_MAX_SAMPLES: usize = 1_000;

/// Default distinct metric series kept per container
pub const DEFAULT_MAX_SERIES: usize = 100;

/// Default log lines kept per container
pub const DEFAULT_MAX_LOG_LINES: usize = 1_000;

/// Default maximum age of stored data (24 hours)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Retention configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_samples_per_series: usize,
    /// Metric names kept per container; the least recently updated series goes first
    pub max_series_per_container: usize,
    pub max_log_lines: usize,
    pub max_age: Duration,
    /// Fold a log line identical to the previous one into a repeat count
    pub compress_repeated_logs: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_samples_per_series: DEFAULT_MAX_SAMPLES,
            max_series_per_container: DEFAULT_MAX_SERIES,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            max_age: DEFAULT_MAX_AGE,
            compress_repeated_logs: true,
        }
    }
}

/// What happened to an appended record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The sample is older than one already stored for the series
    pub out_of_order: bool,
    /// The log line was folded into the previous identical line
    pub folded: bool,
}

/// Storage backend for samples and log lines
#[async_trait]
pub trait Store: Send + Sync {
    async fn append_metric(&self, sample: MetricSample) -> Result<AppendOutcome, StoreError>;

    async fn append_log(&self, line: LogLine) -> Result<AppendOutcome, StoreError>;

    /// Samples of one series within `range`, ordered by timestamp
    async fn query_metrics(
        &self,
        container: &ContainerKey,
        metric: &str,
        range: TimeRange,
    ) -> Vec<MetricSample>;

    async fn query_logs(&self, container: &ContainerKey, query: &LogQuery) -> Vec<LogLine>;

    /// Names of the metrics stored for a container
    async fn metric_names(&self, container: &ContainerKey) -> Vec<String>;

    /// Drop data older than the configured max age. Returns the number of records removed.
    async fn evict_expired(&self, now: Timestamp) -> usize;

    /// Forget everything stored for a container. Returns `false` if nothing was stored.
    async fn remove_container(&self, container: &ContainerKey) -> bool;
}

#[derive(Debug)]
struct TrackedSeries {
    series: MetricSeries,
    /// Write sequence number of the last append
    updated: u64,
}

#[derive(Debug)]
struct ContainerData {
    series: HashMap<String, TrackedSeries>,
    logs: LogBuffer,
    writes: u64,
}

impl ContainerData {
    fn is_empty(&self) -> bool {
        self.series.is_empty() && self.logs.is_empty()
    }

    /// Drop the least recently updated series. Returns its name and sample count.
    fn evict_stalest_series(&mut self) -> Option<(String, usize)> {
        let name = self
            .series
            .iter()
            .min_by_key(|(_, tracked)| tracked.updated)
            .map(|(name, _)| name.clone())?;
        let removed = self.series.remove(&name)?;
        Some((name, removed.series.len()))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: DashMap<ContainerKey, Arc<RwLock<ContainerData>>>,
    config: StoreConfig,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            containers: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Per-container slot, created on first write. The map guard is released
    /// before the caller awaits the inner lock.
    fn slot(&self, key: &ContainerKey) -> Arc<RwLock<ContainerData>> {
        self.containers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(ContainerData {
                    series: HashMap::new(),
                    logs: LogBuffer::new(self.config.max_log_lines, self.config.compress_repeated_logs),
                    writes: 0,
                }))
            })
            .value()
            .clone()
    }

    fn existing(&self, key: &ContainerKey) -> Option<Arc<RwLock<ContainerData>>> {
        self.containers.get(key).map(|slot| slot.value().clone())
    }

    /// Drop a container slot that holds no data. Skipped while anyone else
    /// holds the slot, since a writer may be about to fill it.
    fn release_if_empty(&self, key: &ContainerKey) -> bool {
        self.containers
            .remove_if(key, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_read().map_or(false, |data| data.is_empty())
            })
            .is_some()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_metric(&self, sample: MetricSample) -> Result<AppendOutcome, StoreError> {
        let slot = self.slot(&sample.container);
        let mut data = slot.write().await;
        data.writes += 1;
        let seq = data.writes;

        if !data.series.contains_key(&sample.metric) {
            while data.series.len() >= self.config.max_series_per_container.max(1) {
                match data.evict_stalest_series() {
                    Some((name, samples)) => debug!(
                        container = %sample.container,
                        metric = %name,
                        samples = samples,
                        "Series limit reached, evicted least recently updated series"
                    ),
                    None => break,
                }
            }
        }

        let capacity = self.config.max_samples_per_series;
        let tracked = data
            .series
            .entry(sample.metric.clone())
            .or_insert_with(|| TrackedSeries {
                series: MetricSeries::new(capacity),
                updated: seq,
            });
        tracked.updated = seq;
        let out_of_order = tracked.series.push(sample);

        Ok(AppendOutcome {
            out_of_order,
            folded: false,
        })
    }

    async fn append_log(&self, line: LogLine) -> Result<AppendOutcome, StoreError> {
        let slot = self.slot(&line.container);
        let folded = slot.write().await.logs.push(line);
        Ok(AppendOutcome {
            out_of_order: false,
            folded,
        })
    }

    async fn query_metrics(
        &self,
        container: &ContainerKey,
        metric: &str,
        range: TimeRange,
    ) -> Vec<MetricSample> {
        let Some(slot) = self.existing(container) else {
            return Vec::new();
        };
        let data = slot.read().await;
        data.series
            .get(metric)
            .map(|tracked| tracked.series.query(range))
            .unwrap_or_default()
    }

    async fn query_logs(&self, container: &ContainerKey, query: &LogQuery) -> Vec<LogLine> {
        match self.existing(container) {
            Some(slot) => slot.read().await.logs.query(query),
            None => Vec::new(),
        }
    }

    async fn metric_names(&self, container: &ContainerKey) -> Vec<String> {
        let Some(slot) = self.existing(container) else {
            return Vec::new();
        };
        let data = slot.read().await;
        let mut names: Vec<String> = data
            .series
            .iter()
            .filter(|(_, tracked)| !tracked.series.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn evict_expired(&self, now: Timestamp) -> usize {
        let cutoff = now - self.config.max_age.as_millis() as i64;
        let slots: Vec<(ContainerKey, Arc<RwLock<ContainerData>>)> = self
            .containers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = 0;
        let mut emptied = Vec::new();
        for (key, slot) in slots {
            let mut data = slot.write().await;
            for tracked in data.series.values_mut() {
                removed += tracked.series.evict_before(cutoff);
            }
            data.series.retain(|_, tracked| !tracked.series.is_empty());
            removed += data.logs.evict_before(cutoff);
            if data.is_empty() {
                emptied.push(key);
            }
        }

        let released = emptied
            .iter()
            .filter(|key| self.release_if_empty(key))
            .count();

        if removed > 0 {
            debug!(
                removed = removed,
                released_containers = released,
                cutoff = cutoff,
                "Evicted expired records"
            );
        }
        removed
    }

    async fn remove_container(&self, container: &ContainerKey) -> bool {
        self.containers.remove(container).is_some()
    }
}
