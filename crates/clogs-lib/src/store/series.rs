//! Bounded metric series

use crate::models::{MetricSample, TimeRange, Timestamp};
use std::collections::VecDeque;

/// Samples of one (container, metric) series, kept ordered by timestamp.
///
/// When full, the sample with the oldest timestamp is evicted, so the series
/// always holds the most recent samples regardless of arrival order.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    samples: VecDeque<MetricSample>,
    capacity: usize,
    /// Highest timestamp ever appended; later samples below it are out of order
    high_water: Option<Timestamp>,
}

impl MetricSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            high_water: None,
        }
    }

    /// Append a sample, evicting the oldest when full. Returns `true` if the
    /// sample arrived after a newer one.
    ///
    /// In-order appends and evictions are O(1); a late sample costs a binary
    /// search plus a shift.
    pub fn push(&mut self, mut sample: MetricSample) -> bool {
        let out_of_order = self.high_water.map_or(false, |hw| sample.timestamp < hw);
        sample.out_of_order = out_of_order;
        self.high_water = Some(self.high_water.map_or(sample.timestamp, |hw| hw.max(sample.timestamp)));

        if out_of_order {
            // after equal timestamps, so ties keep arrival order
            let pos = self.samples.partition_point(|s| s.timestamp <= sample.timestamp);
            self.samples.insert(pos, sample);
        } else {
            self.samples.push_back(sample);
        }

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        out_of_order
    }

    /// Drop samples older than `cutoff`. Returns how many were removed.
    pub fn evict_before(&mut self, cutoff: Timestamp) -> usize {
        let keep_from = self.samples.partition_point(|s| s.timestamp < cutoff);
        self.samples.drain(..keep_from);
        keep_from
    }

    /// Samples within `range`, ordered by timestamp
    pub fn query(&self, range: TimeRange) -> Vec<MetricSample> {
        self.samples
            .iter()
            .filter(|s| range.contains(s.timestamp))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerKey;

    fn sample(ts: Timestamp, value: f64) -> MetricSample {
        MetricSample {
            container: ContainerKey::standalone("web"),
            metric: "cpu".to_string(),
            value,
            timestamp: ts,
            agent_id: "a1".to_string(),
            out_of_order: false,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_timestamp() {
        let mut series = MetricSeries::new(3);
        series.push(sample(20, 1.0));
        series.push(sample(10, 2.0));
        series.push(sample(30, 3.0));
        series.push(sample(40, 4.0));

        let kept: Vec<Timestamp> = series.query(TimeRange::all()).iter().map(|s| s.timestamp).collect();
        assert_eq!(kept, vec![20, 30, 40]);
    }

    #[test]
    fn test_late_sample_older_than_everything_is_evicted_when_full() {
        let mut series = MetricSeries::new(2);
        series.push(sample(20, 1.0));
        series.push(sample(30, 2.0));
        assert!(series.push(sample(5, 3.0)));

        let kept: Vec<Timestamp> = series.query(TimeRange::all()).iter().map(|s| s.timestamp).collect();
        assert_eq!(kept, vec![20, 30]);
    }

    #[test]
    fn test_out_of_order_samples_are_flagged_and_sorted() {
        let mut series = MetricSeries::new(10);
        assert!(!series.push(sample(100, 1.0)));
        assert!(series.push(sample(50, 2.0)));
        assert!(!series.push(sample(100, 3.0)));

        let out = series.query(TimeRange::all());
        assert_eq!(out[0].timestamp, 50);
        assert!(out[0].out_of_order);
        // equal timestamps keep arrival order
        assert_eq!(out[1].value, 1.0);
        assert_eq!(out[2].value, 3.0);
    }

    #[test]
    fn test_age_eviction_and_range_query() {
        let mut series = MetricSeries::new(10);
        for ts in [10, 40, 20, 30] {
            series.push(sample(ts, ts as f64));
        }
        assert_eq!(series.evict_before(25), 2);
        assert_eq!(series.len(), 2);
        assert_eq!(series.query(TimeRange::between(35, 100)).len(), 1);
    }
}
