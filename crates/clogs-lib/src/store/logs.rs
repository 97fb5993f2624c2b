//! Per-container log ring buffer

use crate::models::{LogLine, TimeRange, Timestamp};
use std::collections::VecDeque;

/// Filters for a log history query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    pub range: TimeRange,
    /// Return at most this many of the most recent matching lines
    pub limit: Option<usize>,
    /// Case-insensitive level filter
    pub level: Option<String>,
}

impl LogQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    fn matches(&self, line: &LogLine) -> bool {
        if !self.range.contains(line.timestamp) {
            return false;
        }
        match (&self.level, &line.level) {
            (None, _) => true,
            (Some(wanted), Some(level)) => wanted.eq_ignore_ascii_case(level),
            (Some(_), None) => false,
        }
    }
}

/// Per-container log lines, kept ordered by timestamp.
///
/// Same eviction rule as metric series: when full, the line with the oldest
/// timestamp goes first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
    fold_repeats: bool,
}

impl LogBuffer {
    pub fn new(capacity: usize, fold_repeats: bool) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            fold_repeats,
        }
    }

    /// Append a line. A repeat of the newest line is folded into it when
    /// folding is enabled; returns `true` in that case.
    pub fn push(&mut self, line: LogLine) -> bool {
        let newest = self.lines.back().map(|l| l.timestamp);
        if self.fold_repeats && newest.map_or(false, |ts| line.timestamp >= ts) {
            if let Some(last) = self.lines.back_mut() {
                if last.text == line.text && last.level == line.level && last.stream == line.stream {
                    last.repeat = last.repeat.saturating_add(line.repeat.max(1));
                    last.timestamp = line.timestamp;
                    return true;
                }
            }
        }

        if newest.map_or(true, |ts| line.timestamp >= ts) {
            self.lines.push_back(line);
        } else {
            let pos = self.lines.partition_point(|l| l.timestamp <= line.timestamp);
            self.lines.insert(pos, line);
        }
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        false
    }

    pub fn evict_before(&mut self, cutoff: Timestamp) -> usize {
        let keep_from = self.lines.partition_point(|l| l.timestamp < cutoff);
        self.lines.drain(..keep_from);
        keep_from
    }

    /// Matching lines ordered by timestamp, limited to the most recent `limit`
    pub fn query(&self, query: &LogQuery) -> Vec<LogLine> {
        let mut out: Vec<LogLine> = self
            .lines
            .iter()
            .filter(|l| query.matches(l))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            let skip = out.len().saturating_sub(limit);
            out.drain(..skip);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerKey, LogStream};

    fn line(ts: Timestamp, text: &str, level: Option<&str>) -> LogLine {
        LogLine {
            container: ContainerKey::standalone("web"),
            timestamp: ts,
            text: text.to_string(),
            agent_id: "a1".to_string(),
            level: level.map(str::to_string),
            stream: Some(LogStream::Stdout),
            repeat: 1,
        }
    }

    #[test]
    fn test_ring_buffer_evicts_front() {
        let mut logs = LogBuffer::new(2, false);
        logs.push(line(1, "a", None));
        logs.push(line(2, "b", None));
        logs.push(line(3, "c", None));

        let texts: Vec<String> = logs.query(&LogQuery::default()).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_late_line_is_placed_by_timestamp_and_evicted_first() {
        let mut logs = LogBuffer::new(2, true);
        logs.push(line(10, "b", None));
        logs.push(line(20, "c", None));
        assert!(!logs.push(line(5, "c", None)));

        let texts: Vec<String> = logs.query(&LogQuery::default()).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(logs.query(&LogQuery::default())[1].repeat, 1);
    }

    #[test]
    fn test_repeated_lines_fold() {
        let mut logs = LogBuffer::new(10, true);
        assert!(!logs.push(line(1, "retrying", None)));
        assert!(logs.push(line(2, "retrying", None)));
        assert!(logs.push(line(3, "retrying", None)));
        assert!(!logs.push(line(4, "connected", None)));

        let out = logs.query(&LogQuery::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].repeat, 3);
        assert_eq!(out[0].timestamp, 3);
    }

    #[test]
    fn test_folding_disabled_keeps_every_line() {
        let mut logs = LogBuffer::new(10, false);
        logs.push(line(1, "same", None));
        logs.push(line(2, "same", None));
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn test_query_level_and_limit() {
        let mut logs = LogBuffer::new(10, false);
        logs.push(line(1, "boot", Some("INFO")));
        logs.push(line(2, "oops", Some("error")));
        logs.push(line(3, "fine", Some("info")));
        logs.push(line(4, "later", Some("info")));

        let query = LogQuery {
            level: Some("info".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let texts: Vec<String> = logs.query(&query).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["fine", "later"]);
    }
}
