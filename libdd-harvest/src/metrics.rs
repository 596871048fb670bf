// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Timing statistics accumulated for one metric name. Times are in seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub call_count: u64,
    pub total: f64,
    pub total_exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricStats {
    pub fn record(&mut self, duration: Duration, exclusive: Duration) {
        let duration = duration.as_secs_f64();
        if self.call_count == 0 || duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
        self.call_count += 1;
        self.total += duration;
        self.total_exclusive += exclusive.as_secs_f64();
        self.sum_of_squares += duration * duration;
    }

    pub fn merge(&mut self, other: &MetricStats) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 || other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.call_count += other.call_count;
        self.total += other.total;
        self.total_exclusive += other.total_exclusive;
        self.sum_of_squares += other.sum_of_squares;
    }
}

/// Metric statistics keyed by metric name.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metrics {
    stats: HashMap<String, MetricStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, duration: Duration, exclusive: Duration) {
        match self.stats.get_mut(name) {
            Some(stats) => stats.record(duration, exclusive),
            None => {
                let mut stats = MetricStats::default();
                stats.record(duration, exclusive);
                self.stats.insert(name.to_owned(), stats);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&MetricStats> {
        self.stats.get(name)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricStats)> {
        self.stats.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub fn merge(&mut self, other: &Metrics) {
        for (name, stats) in &other.stats {
            self.stats.entry(name.clone()).or_default().merge(stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let mut metrics = Metrics::new();
        metrics.record("Datastore/all", Duration::from_millis(300), Duration::from_millis(100));
        metrics.record("Datastore/all", Duration::from_millis(100), Duration::from_millis(100));

        let stats = metrics.get("Datastore/all").unwrap();
        assert_eq!(stats.call_count, 2);
        assert!((stats.total - 0.4).abs() < 1e-9);
        assert!((stats.total_exclusive - 0.2).abs() < 1e-9);
        assert!((stats.min - 0.1).abs() < 1e-9);
        assert!((stats.max - 0.3).abs() < 1e-9);
        assert!((stats.sum_of_squares - 0.1).abs() < 1e-9);
        assert!(metrics.get("other").is_none());
    }

    #[test]
    fn test_merge() {
        let mut a = Metrics::new();
        a.record("m", Duration::from_secs(2), Duration::from_secs(1));
        let mut b = Metrics::new();
        b.record("m", Duration::from_secs(1), Duration::from_secs(1));
        b.record("n", Duration::from_secs(5), Duration::from_secs(5));

        a.merge(&b);
        assert_eq!(a.len(), 2);
        let m = a.get("m").unwrap();
        assert_eq!(m.call_count, 2);
        assert_eq!(m.min, 1.0);
        assert_eq!(m.max, 2.0);
        assert_eq!(a.get("n").unwrap().call_count, 1);
    }

    #[test]
    fn test_serialize() {
        let mut metrics = Metrics::new();
        metrics.record("m", Duration::from_secs(1), Duration::ZERO);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["m"]["call_count"], 1);
        assert_eq!(json["m"]["total_exclusive"], 0.0);
    }
}
