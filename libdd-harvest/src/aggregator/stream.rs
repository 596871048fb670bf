// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-stream behavior plugged into [`super::EventAggregator`].

use crate::config::AgentConfig;
use crate::sampling::{PriorityQueue, Reservoir, Sampler};
use serde_json::{json, Value};

/// Values available when wrapping formatted entries into a payload.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub config: &'a AgentConfig,
    /// Active limit of the stream.
    pub reservoir_size: usize,
    /// Events offered since the previous harvest.
    pub events_seen: usize,
}

/// One telemetry stream: its collector method, sampling policy, limit and payload shape.
pub trait EventStream: Send + Sync + 'static {
    type Event: Send + 'static;

    /// Collector method the payload is sent to, also used as the stream name in logs.
    const METHOD: &'static str;

    /// Buffer for `limit` events. Streams retaining by priority override this.
    fn sampler(&self, limit: usize) -> Sampler<Self::Event> {
        Sampler::Uniform(Reservoir::new(limit))
    }

    /// Configured limit, zero when the stream is disabled.
    fn limit(&self, config: &AgentConfig) -> usize;

    /// Format one buffered event. `None` drops it from the payload.
    fn format(&self, event: &Self::Event) -> Option<Value>;

    /// Wrap the formatted entries into the payload sent to the collector.
    fn envelope(&self, ctx: PayloadContext<'_>, entries: Vec<Value>) -> Value {
        json!([
            ctx.config.run_id,
            {
                "reservoir_size": ctx.reservoir_size,
                "events_seen": ctx.events_seen,
            },
            entries,
        ])
    }
}

fn limit_for(config: &AgentConfig, method: &str, enabled: bool, configured: usize) -> usize {
    if !enabled {
        return 0;
    }
    config
        .event_harvest_config
        .harvest_limits
        .for_method(method)
        .unwrap_or(configured)
}

fn format_value(event: &Value) -> Option<Value> {
    match event {
        Value::Null => None,
        other => Some(other.clone()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionEvents;

impl EventStream for TransactionEvents {
    type Event = Value;
    const METHOD: &'static str = "analytic_event_data";

    fn sampler(&self, limit: usize) -> Sampler<Value> {
        Sampler::Priority(PriorityQueue::new(limit))
    }

    fn limit(&self, config: &AgentConfig) -> usize {
        let events = &config.transaction_events;
        limit_for(config, Self::METHOD, events.enabled, events.max_samples_stored)
    }

    fn format(&self, event: &Value) -> Option<Value> {
        format_value(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CustomEvents;

impl EventStream for CustomEvents {
    type Event = Value;
    const METHOD: &'static str = "custom_event_data";

    fn limit(&self, config: &AgentConfig) -> usize {
        let events = &config.custom_insights_events;
        limit_for(config, Self::METHOD, events.enabled, events.max_samples_stored)
    }

    fn format(&self, event: &Value) -> Option<Value> {
        format_value(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorEvents;

impl EventStream for ErrorEvents {
    type Event = Value;
    const METHOD: &'static str = "error_event_data";

    fn sampler(&self, limit: usize) -> Sampler<Value> {
        Sampler::Priority(PriorityQueue::new(limit))
    }

    fn limit(&self, config: &AgentConfig) -> usize {
        let errors = &config.error_collector;
        limit_for(
            config,
            Self::METHOD,
            errors.enabled && errors.capture_events,
            errors.max_event_samples_stored,
        )
    }

    fn format(&self, event: &Value) -> Option<Value> {
        format_value(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpanEvents;

impl EventStream for SpanEvents {
    type Event = Value;
    const METHOD: &'static str = "span_event_data";

    fn sampler(&self, limit: usize) -> Sampler<Value> {
        Sampler::Priority(PriorityQueue::new(limit))
    }

    fn limit(&self, config: &AgentConfig) -> usize {
        let spans = &config.span_events;
        limit_for(config, Self::METHOD, spans.enabled, spans.max_samples_stored)
    }

    fn format(&self, event: &Value) -> Option<Value> {
        format_value(event)
    }
}
