// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::Metrics;
use std::fmt;
use std::time::{Duration, Instant};

/// Index of a tracer inside its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TracerId(pub(crate) usize);

impl TracerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Durations of a tracer handed to metric callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerTiming {
    pub duration: Duration,
    pub exclusive: Duration,
}

/// Receives the finished tracer's timing with the unscoped and scoped metric collections.
pub type MetricCallback = Box<dyn FnOnce(&TracerTiming, &mut Metrics, &mut Metrics) + Send>;

/// How a tracer turns into metrics when its transaction finishes.
#[derive(Default)]
pub enum MetricNaming {
    /// Recorded under nothing.
    #[default]
    None,
    /// Recorded as a scoped and an unscoped metric with this name.
    Name(String),
    Callback(MetricCallback),
}

impl MetricNaming {
    pub fn callback(
        record: impl FnOnce(&TracerTiming, &mut Metrics, &mut Metrics) + Send + 'static,
    ) -> Self {
        MetricNaming::Callback(Box::new(record))
    }
}

impl From<&str> for MetricNaming {
    fn from(name: &str) -> Self {
        MetricNaming::Name(name.to_owned())
    }
}

impl From<String> for MetricNaming {
    fn from(name: String) -> Self {
        MetricNaming::Name(name)
    }
}

impl fmt::Debug for MetricNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricNaming::None => f.write_str("None"),
            MetricNaming::Name(name) => f.debug_tuple("Name").field(name).finish(),
            MetricNaming::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// One timed unit of work. The parent is a back-reference by id into the owning transaction.
#[derive(Debug)]
pub(crate) struct Tracer {
    pub(crate) parent: Option<TracerId>,
    pub(crate) start: Instant,
    pub(crate) end: Option<Instant>,
    pub(crate) child_total: Duration,
    pub(crate) naming: MetricNaming,
}

impl Tracer {
    pub(crate) fn new(parent: Option<TracerId>, start: Instant, naming: MetricNaming) -> Self {
        Self {
            parent,
            start,
            end: None,
            child_total: Duration::ZERO,
            naming,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// Time from start to end, or to `now` while still open.
    pub(crate) fn duration(&self, now: Instant) -> Duration {
        self.end
            .unwrap_or(now)
            .saturating_duration_since(self.start)
    }

    /// Own time not covered by finished children, floored at zero.
    pub(crate) fn exclusive(&self, now: Instant) -> Duration {
        self.duration(now).saturating_sub(self.child_total)
    }

    pub(crate) fn timing(&self, now: Instant) -> TracerTiming {
        TracerTiming {
            duration: self.duration(now),
            exclusive: self.exclusive(now),
        }
    }

    pub(crate) fn display_name(&self) -> &str {
        match &self.naming {
            MetricNaming::Name(name) => name,
            MetricNaming::Callback(_) => "<callback>",
            MetricNaming::None => "<unnamed>",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_is_floored() {
        let start = Instant::now();
        let mut tracer = Tracer::new(None, start, MetricNaming::None);
        tracer.end = Some(start + Duration::from_millis(10));
        tracer.child_total = Duration::from_millis(4);
        assert_eq!(tracer.exclusive(start), Duration::from_millis(6));

        // Overlapping children can add up to more than the parent.
        tracer.child_total = Duration::from_millis(25);
        assert_eq!(tracer.exclusive(start), Duration::ZERO);
    }

    #[test]
    fn test_open_tracer_measures_to_now() {
        let start = Instant::now();
        let tracer = Tracer::new(None, start, "Custom/x".into());
        assert!(!tracer.is_finished());
        assert_eq!(
            tracer.duration(start + Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        assert_eq!(tracer.display_name(), "Custom/x");
    }
}
