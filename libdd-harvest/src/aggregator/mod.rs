// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-stream event buffers.
//!
//! An [`EventAggregator`] samples the events of one [`EventStream`] between harvests and turns
//! them into a payload for the [`Transport`]. The [`Aggregator`] trait is the type-erased view
//! the [`crate::harvester::Harvester`] drives.

pub mod log;
pub mod stream;

use crate::config::{AgentConfig, DEFAULT_REPORT_PERIOD_MS};
use crate::error::TransportError;
use crate::sampling::Sampler;
use crate::transport::Transport;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use stream::{EventStream, PayloadContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use log::{LogEntry, LogEvents};
pub use stream::{CustomEvents, ErrorEvents, SpanEvents, TransactionEvents};

/// Lifecycle operations the harvester invokes on every registered aggregator.
#[async_trait]
pub trait Aggregator: Send + Sync {
    fn method(&self) -> &'static str;

    /// False while the stream's limit is zero.
    fn is_enabled(&self) -> bool;

    /// Wait before the harvester starts this aggregator.
    fn delay(&self) -> Option<Duration> {
        None
    }

    /// Observation window after which the harvester stops this aggregator again.
    fn duration(&self) -> Option<Duration> {
        None
    }

    fn start(&self);

    fn stop(&self);

    fn reconfigure(&self, config: &AgentConfig);

    /// Flush the buffered events. Resolving is the "finished sending" notification.
    async fn send(&self) -> Result<(), TransportError>;
}

/// Supportability counters of one aggregator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Events offered while the aggregator was accepting.
    pub seen: u64,
    /// Events handed to the transport successfully.
    pub sent: u64,
    /// Events lost to sampling or to a failed send that did not ask to retain them.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    seen: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

struct State<E> {
    sampler: Sampler<E>,
    started: bool,
    period: Duration,
    delay: Option<Duration>,
    duration: Option<Duration>,
    /// Cancels the periodic send task while started.
    ticker: Option<CancellationToken>,
}

struct Inner<S: EventStream> {
    stream: S,
    transport: Arc<dyn Transport>,
    config: ArcSwap<AgentConfig>,
    state: Mutex<State<S::Event>>,
    counters: Counters,
}

impl<S: EventStream> Inner<S> {
    fn state(&self) -> MutexGuard<'_, State<S::Event>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply cloneable handle on the buffer of one telemetry stream.
pub struct EventAggregator<S: EventStream> {
    inner: Arc<Inner<S>>,
}

impl<S: EventStream> Clone for EventAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EventStream> EventAggregator<S> {
    pub fn new(stream: S, config: &AgentConfig, transport: Arc<dyn Transport>) -> Self {
        let limit = stream.limit(config);
        let sampler = stream.sampler(limit);
        let period = match config.event_harvest_config.report_period() {
            Duration::ZERO => {
                warn!(method = S::METHOD, "Zero report period, using the default");
                Duration::from_millis(DEFAULT_REPORT_PERIOD_MS)
            }
            period => period,
        };
        Self {
            inner: Arc::new(Inner {
                stream,
                transport,
                config: ArcSwap::from_pointee(config.clone()),
                state: Mutex::new(State {
                    sampler,
                    started: false,
                    period,
                    delay: None,
                    duration: None,
                    ticker: None,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn stream(&self) -> &S {
        &self.inner.stream
    }

    /// Start `delay` after the harvester starts and stop `duration` later.
    pub fn set_window(&self, delay: Option<Duration>, duration: Option<Duration>) {
        let mut state = self.inner.state();
        state.delay = delay;
        state.duration = duration;
    }

    /// Offer an event without priority. Returns whether it is buffered.
    pub fn add(&self, event: S::Event) -> bool {
        self.offer(event, None)
    }

    pub fn add_with_priority(&self, event: S::Event, priority: f64) -> bool {
        self.offer(event, Some(priority))
    }

    fn offer(&self, event: S::Event, priority: Option<f64>) -> bool {
        let mut state = self.inner.state();
        if !state.started || state.sampler.limit() == 0 {
            return false;
        }
        let counters = &self.inner.counters;
        counters.seen.fetch_add(1, Ordering::Relaxed);
        let full = state.sampler.len() >= state.sampler.limit();
        let kept = state.sampler.add(event, priority);
        // At capacity one event is always lost, the new one or the one it replaced.
        if full {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        kept
    }

    /// Replace the active limit. Going to zero clears the buffer; coming back from zero starts
    /// from an empty buffer.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.inner.state();
        let previous = state.sampler.limit();
        if previous == limit {
            return;
        }
        let before = state.sampler.len();
        state.sampler.set_limit(limit);
        let lost = before - state.sampler.len();
        if lost > 0 {
            self.inner
                .counters
                .dropped
                .fetch_add(lost as u64, Ordering::Relaxed);
        }
        debug!(method = S::METHOD, previous, limit, "Aggregator limit changed");
    }

    pub fn limit(&self) -> usize {
        self.inner.state().sampler.limit()
    }

    pub fn len(&self) -> usize {
        self.inner.state().sampler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_started(&self) -> bool {
        self.inner.state().started
    }

    /// Payload for the currently buffered events, `None` when nothing formats to a value.
    pub fn to_payload(&self) -> Option<Value> {
        let state = self.inner.state();
        let entries = match &state.sampler {
            Sampler::Uniform(r) => self.format_all(r.iter()),
            Sampler::Priority(q) => self.format_all(q.iter()),
        };
        self.wrap(entries, state.sampler.limit(), state.sampler.seen())
    }

    fn format_all<'a>(&self, events: impl Iterator<Item = &'a S::Event>) -> Vec<Value> {
        events
            .filter_map(|event| self.inner.stream.format(event))
            .collect()
    }

    fn wrap(
        &self,
        entries: Vec<Value>,
        reservoir_size: usize,
        events_seen: usize,
    ) -> Option<Value> {
        if entries.is_empty() {
            return None;
        }
        let config = self.inner.config.load();
        let ctx = PayloadContext {
            config: &config,
            reservoir_size,
            events_seen,
        };
        Some(self.inner.stream.envelope(ctx, entries))
    }

    /// Drop every buffered event, keeping the limit and started state.
    pub fn clear(&self) {
        self.inner.state().sampler.clear();
    }

    pub fn stats(&self) -> AggregatorStats {
        let counters = &self.inner.counters;
        AggregatorStats {
            seen: counters.seen.load(Ordering::Relaxed),
            sent: counters.sent.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Accept events again and send periodically every report period.
    pub fn start(&self) {
        let mut state = self.inner.state();
        if state.started {
            return;
        }
        state.started = true;
        state.ticker = self.spawn_ticker(state.period);
        debug!(method = S::METHOD, "Aggregator started");
    }

    /// Stop accepting events and sending periodically. Buffered events are kept.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        state.started = false;
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
        debug!(method = S::METHOD, "Aggregator stopped");
    }

    fn spawn_ticker(&self, period: Duration) -> Option<CancellationToken> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                method = S::METHOD,
                "No tokio runtime, periodic sends are left to the harvester"
            );
            return None;
        };
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let aggregator = EventAggregator { inner };
                        if let Err(e) = aggregator.send().await {
                            debug!(method = S::METHOD, error = %e, "Periodic send failed");
                        }
                    }
                }
            }
        });
        Some(token)
    }

    /// Apply a new configuration: limit, report period and payload metadata.
    pub fn reconfigure(&self, config: &AgentConfig) {
        self.inner.config.store(Arc::new(config.clone()));
        self.set_limit(self.inner.stream.limit(config));

        let mut state = self.inner.state();
        let period = config.event_harvest_config.report_period();
        if period.is_zero() {
            warn!(
                method = S::METHOD,
                previous = ?state.period,
                "Ignoring zero report period"
            );
        } else if state.period != period {
            state.period = period;
            if let Some(ticker) = state.ticker.take() {
                ticker.cancel();
                state.ticker = self.spawn_ticker(period);
            }
        }
    }

    /// Take the buffer, send it and count the outcome. A rejection asking for retention merges
    /// the events back into the buffer.
    pub async fn send(&self) -> Result<(), TransportError> {
        let (events, limit, seen) = {
            let mut state = self.inner.state();
            let limit = state.sampler.limit();
            let seen = state.sampler.seen();
            (state.sampler.take(), limit, seen)
        };
        if events.is_empty() {
            debug!(method = S::METHOD, "Nothing to send");
            return Ok(());
        }

        let entries = self.format_all(events.iter().map(|(_, event)| event));
        let count = entries.len() as u64;
        let Some(payload) = self.wrap(entries, limit, seen) else {
            debug!(method = S::METHOD, "Every buffered event formatted to nothing");
            return Ok(());
        };

        let counters = &self.inner.counters;
        match self.inner.transport.send(S::METHOD, &payload).await {
            Ok(()) => {
                counters.sent.fetch_add(count, Ordering::Relaxed);
                debug!(method = S::METHOD, events = count, "Payload sent");
                Ok(())
            }
            Err(e) if e.should_retain() => {
                warn!(
                    method = S::METHOD,
                    error = %e,
                    "Send failed, keeping events for the next harvest"
                );
                self.inner.state().sampler.merge(events, seen);
                Err(e)
            }
            Err(e) => {
                counters.dropped.fetch_add(count, Ordering::Relaxed);
                warn!(
                    method = S::METHOD,
                    error = %e,
                    events = count,
                    "Send failed, dropping events"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: EventStream> Aggregator for EventAggregator<S> {
    fn method(&self) -> &'static str {
        S::METHOD
    }

    fn is_enabled(&self) -> bool {
        self.limit() > 0
    }

    fn delay(&self) -> Option<Duration> {
        self.inner.state().delay
    }

    fn duration(&self) -> Option<Duration> {
        self.inner.state().duration
    }

    fn start(&self) {
        EventAggregator::start(self)
    }

    fn stop(&self) {
        EventAggregator::stop(self)
    }

    fn reconfigure(&self, config: &AgentConfig) {
        EventAggregator::reconfigure(self, config)
    }

    async fn send(&self) -> Result<(), TransportError> {
        EventAggregator::send(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Records payloads, failing with the queued errors first.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) payloads: StdMutex<Vec<(String, Value)>>,
        pub(crate) failures: StdMutex<Vec<TransportError>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, method: &str, payload: &Value) -> Result<(), TransportError> {
            if let Some(e) = self.failures.lock().unwrap().pop() {
                return Err(e);
            }
            self.payloads
                .lock()
                .unwrap()
                .push((method.to_owned(), payload.clone()));
            Ok(())
        }
    }

    fn config_with_custom_limit(limit: usize) -> AgentConfig {
        let mut config = AgentConfig {
            run_id: Some(String::from("run")),
            ..Default::default()
        };
        config.custom_insights_events.max_samples_stored = limit;
        config
    }

    fn custom(limit: usize) -> (EventAggregator<CustomEvents>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let config = config_with_custom_limit(limit);
        let aggregator = EventAggregator::new(CustomEvents, &config, transport.clone());
        (aggregator, transport)
    }

    #[test]
    fn test_add_requires_start() {
        let (aggregator, _) = custom(10);
        assert!(!aggregator.add(json!({"a": 1})));
        aggregator.start();
        assert!(aggregator.add(json!({"a": 1})));
        aggregator.stop();
        assert!(!aggregator.add(json!({"a": 2})));
        // Stopping keeps what was buffered.
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn test_bound_and_stats() {
        let (aggregator, _) = custom(5);
        aggregator.start();
        for i in 0..50 {
            aggregator.add(json!({ "i": i }));
            assert!(aggregator.len() <= 5);
        }
        let stats = aggregator.stats();
        assert_eq!(stats.seen, 50);
        assert_eq!(stats.dropped, 45);
    }

    #[test]
    fn test_reconfigure_to_zero_and_back() {
        let (aggregator, _) = custom(5);
        aggregator.start();
        aggregator.add(json!(1));
        aggregator.add(json!(2));

        aggregator.reconfigure(&config_with_custom_limit(0));
        assert!(aggregator.is_empty());
        assert!(!aggregator.is_enabled());
        assert!(!aggregator.add(json!(3)));
        assert!(aggregator.is_empty());

        aggregator.reconfigure(&config_with_custom_limit(3));
        assert!(aggregator.is_empty());
        assert!(aggregator.add(json!(4)));
        assert_eq!(aggregator.limit(), 3);
    }

    #[test]
    fn test_to_payload() {
        let (aggregator, _) = custom(5);
        assert_eq!(aggregator.to_payload(), None);
        aggregator.start();
        aggregator.add(json!({"a": 1}));
        assert_eq!(
            aggregator.to_payload(),
            Some(json!(["run", {"reservoir_size": 5, "events_seen": 1}, [{"a": 1}]]))
        );
        // Building the payload does not consume the buffer.
        assert_eq!(aggregator.len(), 1);
        aggregator.clear();
        assert_eq!(aggregator.to_payload(), None);
        assert_eq!(aggregator.limit(), 5);
    }

    #[test]
    fn test_log_payload_skips_empty_entries() {
        let transport = Arc::new(RecordingTransport::default());
        let aggregator = EventAggregator::new(
            LogEvents::new(crate::info::MetadataCache::new(|| Ok(String::from("h")))),
            &AgentConfig::default(),
            transport,
        );
        aggregator.start();
        aggregator.add(LogEntry::lazy(|| Ok(Value::Null)));
        aggregator.add(LogEntry::lazy(|| anyhow::bail!("bad line")));
        assert_eq!(aggregator.to_payload(), None);

        aggregator.add(LogEntry::Eager(json!({"message": "ok"})));
        let payload = aggregator.to_payload().unwrap();
        assert_eq!(payload[0]["logs"], json!([{"message": "ok"}]));
        assert_eq!(payload[0]["common"]["attributes"]["hostname"], "h");
    }

    #[tokio::test]
    async fn test_send_clears_and_counts() {
        let (aggregator, transport) = custom(5);
        aggregator.start();
        aggregator.add(json!({"a": 1}));
        aggregator.add(json!({"a": 2}));
        aggregator.send().await.unwrap();

        assert!(aggregator.is_empty());
        assert_eq!(aggregator.stats().sent, 2);
        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, "custom_event_data");
        assert_eq!(payloads[0].1[2].as_array().unwrap().len(), 2);
        drop(payloads);

        // Nothing buffered, nothing sent.
        aggregator.send().await.unwrap();
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_retention() {
        let (aggregator, transport) = custom(5);
        aggregator.start();
        aggregator.add(json!(1));
        transport.failures.lock().unwrap().push(TransportError::Rejected {
            status: 503,
            retain: true,
        });
        assert!(aggregator.send().await.is_err());
        assert_eq!(aggregator.len(), 1);

        transport.failures.lock().unwrap().push(TransportError::Rejected {
            status: 413,
            retain: false,
        });
        assert!(aggregator.send().await.is_err());
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_retained_events_are_counted_once() {
        let (aggregator, transport) = custom(5);
        aggregator.start();
        aggregator.add(json!(1));
        aggregator.add(json!(2));
        transport.failures.lock().unwrap().push(TransportError::Rejected {
            status: 503,
            retain: true,
        });
        assert!(aggregator.send().await.is_err());
        aggregator.add(json!(3));
        aggregator.send().await.unwrap();

        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads[0].1[1]["events_seen"], 3);
        assert_eq!(payloads[0].1[2].as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_send() {
        let mut config = config_with_custom_limit(5);
        config.event_harvest_config.report_period_ms = 1000;
        let transport = Arc::new(RecordingTransport::default());
        let aggregator = EventAggregator::new(CustomEvents, &config, transport.clone());
        aggregator.start();
        aggregator.add(json!(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);

        aggregator.stop();
        aggregator.add(json!(2));
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_keeps_periodic_send() {
        let mut config = config_with_custom_limit(5);
        config.event_harvest_config.report_period_ms = 1000;
        let transport = Arc::new(RecordingTransport::default());
        let aggregator = EventAggregator::new(CustomEvents, &config, transport.clone());
        aggregator.start();

        config.event_harvest_config.report_period_ms = 0;
        aggregator.reconfigure(&config);
        aggregator.add(json!(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_at_creation_uses_default() {
        let mut config = config_with_custom_limit(5);
        config.event_harvest_config.report_period_ms = 0;
        let transport = Arc::new(RecordingTransport::default());
        let aggregator = EventAggregator::new(CustomEvents, &config, transport.clone());
        aggregator.start();
        aggregator.add(json!(1));

        tokio::time::sleep(Duration::from_millis(DEFAULT_REPORT_PERIOD_MS + 500)).await;
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
    }
}
