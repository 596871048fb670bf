// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction timing model.
//!
//! A [`Transaction`] owns every tracer created while it is open in an arena indexed by
//! [`TracerId`]. Finishing the first tracer, the root, finishes the transaction: open tracers
//! are force-finished, metrics are recorded once per tracer and the listeners are notified
//! exactly once.

mod clock;
pub mod tracer;

use crate::aggregator::{EventAggregator, TransactionEvents};
use crate::attribute_filter::AttributeFilter;
use crate::attributes::{Attributes, MAXIMUM_CUSTOM_ATTRIBUTES};
use crate::destinations::Destinations;
use crate::metrics::Metrics;
use crate::normalizer::TxSegmentNormalizer;
use crate::segment_tree::{SegmentTree, TreeSegment};
use clock::Now;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracer::Tracer;
use tracing::{debug, error};

pub use tracer::{MetricCallback, MetricNaming, TracerId, TracerTiming};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionKind {
    #[default]
    Web,
    Background,
}

impl TransactionKind {
    fn name_prefix(&self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Background => "OtherTransaction",
        }
    }

    fn rollup_metric(&self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Background => "OtherTransaction/all",
        }
    }
}

/// Notified once when a transaction finishes.
pub trait TransactionListener: Send + Sync {
    fn transaction_finished(&self, transaction: &Transaction);
}

/// Segment view of a tracer, used to rebuild the trace hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub timing: TracerTiming,
}

impl TreeSegment for SegmentRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
}

pub struct Transaction {
    id: String,
    kind: TransactionKind,
    name: Option<String>,
    final_name: Option<String>,
    url: Option<String>,
    status_code: Option<u16>,
    start_time: SystemTime,
    priority: f64,
    tracers: Vec<Tracer>,
    finished: bool,
    metrics: Metrics,
    scoped_metrics: Metrics,
    attributes: Attributes,
    filter: Arc<AttributeFilter>,
    normalizer: Option<Arc<TxSegmentNormalizer>>,
    listeners: Vec<Arc<dyn TransactionListener>>,
    clock: Now,
}

impl Transaction {
    pub fn new(kind: TransactionKind, filter: Arc<AttributeFilter>) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            id: format!("{:016x}", rng.gen::<u64>()),
            kind,
            name: None,
            final_name: None,
            url: None,
            status_code: None,
            start_time: SystemTime::now(),
            priority: rng.gen(),
            tracers: Vec::new(),
            finished: false,
            metrics: Metrics::new(),
            scoped_metrics: Metrics::new(),
            attributes: Attributes::new(Destinations::TRANS_SCOPE, MAXIMUM_CUSTOM_ATTRIBUTES),
            filter,
            normalizer: None,
            listeners: Vec::new(),
            clock: Now::default(),
        }
    }

    /// Normalize the final transaction name with `normalizer`.
    pub fn with_normalizer(mut self, normalizer: Arc<TxSegmentNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn TransactionListener>) {
        self.listeners.push(listener);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Name below the kind prefix, e.g. `Uri/store/checkout`.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Full, normalized name. Set once the transaction finished.
    pub fn final_name(&self) -> Option<&str> {
        self.final_name.as_deref()
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = Some(url.into());
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = Some(status_code);
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn scoped_metrics(&self) -> &Metrics {
        &self.scoped_metrics
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn add_attribute(
        &mut self,
        destinations: Destinations,
        key: &str,
        value: impl Into<Value>,
    ) -> Destinations {
        self.attributes
            .add_attribute(destinations, key, value, &self.filter)
    }

    /// Start a tracer under the most recent tracer that is still open.
    pub fn push_tracer(&mut self, naming: impl Into<MetricNaming>) -> Option<TracerId> {
        let parent = self
            .tracers
            .iter()
            .rposition(|t| !t.is_finished())
            .map(TracerId);
        self.push(parent, naming.into())
    }

    /// Start a tracer under an explicit parent.
    pub fn push_child(
        &mut self,
        parent: TracerId,
        naming: impl Into<MetricNaming>,
    ) -> Option<TracerId> {
        if self.tracers.get(parent.0).is_none() {
            error!(parent = parent.0, "Unknown parent tracer, not creating tracer");
            return None;
        }
        self.push(Some(parent), naming.into())
    }

    fn push(&mut self, parent: Option<TracerId>, naming: MetricNaming) -> Option<TracerId> {
        if self.finished {
            error!(
                transaction = %self.id,
                "Tracer pushed onto a finished transaction, ignoring it"
            );
            return None;
        }
        let id = TracerId(self.tracers.len());
        self.tracers.push(Tracer::new(parent, self.clock.now(), naming));
        Some(id)
    }

    /// Finish a tracer and account its duration to its parent. Finishing the root finishes the
    /// transaction.
    pub fn finish_tracer(&mut self, id: TracerId) {
        if self.finished {
            error!(
                transaction = %self.id,
                tracer = id.0,
                "Tracer finished on a finished transaction, ignoring it"
            );
            return;
        }
        let Some(tracer) = self.tracers.get(id.0) else {
            error!(tracer = id.0, "Finishing an unknown tracer, ignoring it");
            return;
        };
        if tracer.is_finished() {
            debug!(tracer = id.0, "Tracer already finished");
            return;
        }

        let now = self.clock.now();
        if id.0 != 0 {
            self.end_tracer(id.0, now);
            return;
        }
        // Children first, so that their durations reach their parents before those end.
        for index in (1..self.tracers.len()).rev() {
            if let Some(open) = self.tracers.get(index).filter(|t| !t.is_finished()) {
                debug!(
                    tracer = index,
                    name = open.display_name(),
                    duration_ms = open.duration(now).as_millis() as u64,
                    "Force finishing open tracer"
                );
                self.end_tracer(index, now);
            }
        }
        self.end_tracer(0, now);
        self.finish(now);
    }

    fn end_tracer(&mut self, index: usize, now: Instant) {
        let Some(tracer) = self.tracers.get_mut(index) else {
            return;
        };
        tracer.end = Some(now);
        let duration = tracer.duration(now);
        if let Some(parent) = tracer.parent.and_then(|p| self.tracers.get_mut(p.0)) {
            parent.child_total += duration;
        }
    }

    fn finish(&mut self, now: Instant) {
        self.finished = true;
        let final_name = self.compute_final_name();

        for tracer in &mut self.tracers {
            let timing = tracer.timing(now);
            match std::mem::take(&mut tracer.naming) {
                MetricNaming::None => {}
                MetricNaming::Name(name) => {
                    self.metrics
                        .record(&name, timing.duration, timing.exclusive);
                    self.scoped_metrics
                        .record(&name, timing.duration, timing.exclusive);
                    tracer.naming = MetricNaming::Name(name);
                }
                MetricNaming::Callback(record) => {
                    record(&timing, &mut self.metrics, &mut self.scoped_metrics)
                }
            }
        }
        if let Some(root) = self.tracers.first() {
            let timing = root.timing(now);
            self.metrics
                .record(&final_name, timing.duration, timing.exclusive);
            self.metrics.record(
                self.kind.rollup_metric(),
                timing.duration,
                timing.exclusive,
            );
        }
        debug!(transaction = %self.id, name = %final_name, "Transaction finished");
        self.final_name = Some(final_name);

        let listeners = std::mem::take(&mut self.listeners);
        for listener in &listeners {
            listener.transaction_finished(self);
        }
        self.listeners = listeners;
    }

    fn compute_final_name(&self) -> String {
        let partial = match (&self.name, &self.url) {
            (Some(name), _) => name.clone(),
            (None, Some(url)) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                format!("Uri{path}")
            }
            (None, None) => String::from("Unknown"),
        };
        let full = format!("{}/{}", self.kind.name_prefix(), partial);
        match &self.normalizer {
            Some(normalizer) => normalizer.normalize(&full).value,
            None => full,
        }
    }

    /// Duration of the root tracer, zero before any tracer was pushed.
    pub fn duration(&self) -> Duration {
        self.tracers
            .first()
            .map(|root| root.duration(self.clock.now()))
            .unwrap_or_default()
    }

    pub fn tracer_count(&self) -> usize {
        self.tracers.len()
    }

    pub fn tracer_timing(&self, id: TracerId) -> Option<TracerTiming> {
        let now = self.clock.now();
        self.tracers.get(id.0).map(|t| t.timing(now))
    }

    pub fn tracer_parent(&self, id: TracerId) -> Option<TracerId> {
        self.tracers.get(id.0).and_then(|t| t.parent)
    }

    /// Hierarchy of the tracers, rooted at the root tracer.
    pub fn segment_tree(&self) -> Option<SegmentTree<SegmentRecord>> {
        let now = self.clock.now();
        let mut records = self.tracers.iter().enumerate().map(|(i, t)| SegmentRecord {
            id: i.to_string(),
            parent_id: t.parent.map(|p| p.0.to_string()),
            name: t.display_name().to_owned(),
            timing: t.timing(now),
        });
        let mut tree = SegmentTree::new(records.next()?);
        for record in records {
            tree.add(record);
        }
        Some(tree)
    }

    /// Transaction event as `[intrinsics, user attributes, agent attributes]`.
    pub fn to_event(&self) -> Value {
        let timestamp = self
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let intrinsics = json!({
            "type": "Transaction",
            "name": self.final_name.clone().unwrap_or_else(|| self.compute_final_name()),
            "timestamp": timestamp,
            "duration": self.duration().as_secs_f64(),
            "guid": self.id,
            "priority": self.priority,
        });

        let mut agent = Map::new();
        if let Some(code) = self.status_code {
            if self.filter.test(Destinations::TRANS_EVENT, "http.statusCode") {
                agent.insert(String::from("http.statusCode"), json!(code));
            }
        }
        if let Some(url) = &self.url {
            if self.filter.test(Destinations::TRANS_EVENT, "request.uri") {
                agent.insert(String::from("request.uri"), json!(url));
            }
        }
        json!([
            intrinsics,
            self.attributes.get(Destinations::TRANS_EVENT),
            agent
        ])
    }
}

/// Turns finished transactions into transaction events.
pub struct TransactionEventRecorder {
    events: EventAggregator<TransactionEvents>,
}

impl TransactionEventRecorder {
    pub fn new(events: EventAggregator<TransactionEvents>) -> Self {
        Self { events }
    }
}

impl TransactionListener for TransactionEventRecorder {
    fn transaction_finished(&self, transaction: &Transaction) {
        if !self
            .events
            .add_with_priority(transaction.to_event(), transaction.priority())
        {
            debug!(transaction = transaction.id(), "Transaction event not sampled");
        }
    }
}
