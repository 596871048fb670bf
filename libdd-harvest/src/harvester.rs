// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::Aggregator;
use crate::config::AgentConfig;
use crate::error::TransportError;
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one aggregator's part in a harvest round.
#[derive(Debug)]
pub enum SendStatus {
    Sent,
    /// The aggregator was disabled and resolved without sending.
    Disabled,
    Failed(TransportError),
}

#[derive(Debug)]
pub struct SendOutcome {
    pub method: &'static str,
    pub status: SendStatus,
}

/// Per-aggregator outcome of a harvest round, in registration order.
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub outcomes: Vec<SendOutcome>,
}

impl HarvestReport {
    pub fn failures(&self) -> impl Iterator<Item = &SendOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SendStatus::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Drives start / send / stop / reconfigure across every registered aggregator.
#[derive(Default)]
pub struct Harvester {
    aggregators: Vec<Arc<dyn Aggregator>>,
    /// Per registered aggregator, whether `start` already started or scheduled it.
    scheduled: Mutex<Vec<bool>>,
    /// Cancels the delayed start and stop timers.
    timers: CancellationToken,
}

impl Harvester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, aggregator: Arc<dyn Aggregator>) {
        debug!(method = aggregator.method(), "Registering aggregator");
        self.aggregators.push(aggregator);
    }

    pub fn len(&self) -> usize {
        self.aggregators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }

    /// Start every enabled aggregator, after its delay if it has one, and schedule its stop
    /// when it declares an observation window. Aggregators handled by an earlier call are
    /// skipped.
    pub fn start(&self) {
        let runtime = Handle::try_current().ok();
        let mut flags = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        flags.resize(self.aggregators.len(), false);
        for (aggregator, scheduled) in self.aggregators.iter().zip(flags.iter_mut()) {
            if *scheduled || !aggregator.is_enabled() {
                continue;
            }
            *scheduled = true;
            let delay = aggregator.delay().filter(|d| !d.is_zero());
            let duration = aggregator.duration().filter(|d| !d.is_zero());
            let Some(runtime) = runtime.as_ref() else {
                if delay.is_some() || duration.is_some() {
                    warn!(
                        method = aggregator.method(),
                        "No tokio runtime to schedule the aggregator window, starting now"
                    );
                }
                aggregator.start();
                continue;
            };

            match delay {
                Some(delay) => self.schedule(runtime, aggregator.clone(), delay, |a| a.start()),
                None => aggregator.start(),
            }
            if let Some(duration) = duration {
                let stop_after = delay.unwrap_or_default() + duration;
                self.schedule(runtime, aggregator.clone(), stop_after, |a| a.stop());
            }
        }
    }

    fn schedule(
        &self,
        runtime: &Handle,
        aggregator: Arc<dyn Aggregator>,
        after: Duration,
        action: fn(&dyn Aggregator),
    ) {
        let cancelled = self.timers.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(after) => action(aggregator.as_ref()),
            }
        });
    }

    /// Send every enabled aggregator concurrently and wait for all of them, whatever their
    /// individual outcome. Disabled aggregators resolve immediately.
    pub async fn clear(&self) -> HarvestReport {
        harvest(self.aggregators.clone()).await
    }

    /// Run [`Harvester::clear`] in the background and hand the report to `callback` in a task
    /// of its own, so a panicking callback cannot be mistaken for a failed harvest.
    pub fn clear_then<F>(&self, callback: F) -> Result<JoinHandle<()>, TryCurrentError>
    where
        F: FnOnce(HarvestReport) + Send + 'static,
    {
        let runtime = Handle::try_current()?;
        let aggregators = self.aggregators.clone();
        let spawner = runtime.clone();
        Ok(runtime.spawn(async move {
            let report = harvest(aggregators).await;
            if let Err(e) = spawner.spawn(async move { callback(report) }).await {
                warn!(error = %e, "Harvest callback failed");
            }
        }))
    }

    pub fn stop(&self) {
        for aggregator in &self.aggregators {
            aggregator.stop();
        }
    }

    pub fn update(&self, config: &AgentConfig) {
        for aggregator in &self.aggregators {
            aggregator.reconfigure(config);
        }
    }
}

impl Drop for Harvester {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

async fn harvest(aggregators: Vec<Arc<dyn Aggregator>>) -> HarvestReport {
    let sends = aggregators.into_iter().map(|aggregator| async move {
        let status = if aggregator.is_enabled() {
            match aggregator.send().await {
                Ok(()) => SendStatus::Sent,
                Err(e) => {
                    debug!(method = aggregator.method(), error = %e, "Aggregator send failed");
                    SendStatus::Failed(e)
                }
            }
        } else {
            SendStatus::Disabled
        };
        SendOutcome {
            method: aggregator.method(),
            status,
        }
    });
    HarvestReport {
        outcomes: join_all(sends).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeAggregator {
        disabled: bool,
        fail: bool,
        delay: Option<Duration>,
        duration: Option<Duration>,
        started: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        sends: AtomicUsize,
        reconfigures: AtomicUsize,
    }

    #[async_trait]
    impl Aggregator for FakeAggregator {
        fn method(&self) -> &'static str {
            "fake_event_data"
        }

        fn is_enabled(&self) -> bool {
            !self.disabled
        }

        fn delay(&self) -> Option<Duration> {
            self.delay
        }

        fn duration(&self) -> Option<Duration> {
            self.duration
        }

        fn start(&self) {
            self.started.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.started.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn reconfigure(&self, _config: &AgentConfig) {
            self.reconfigures.fetch_add(1, Ordering::SeqCst);
        }

        async fn send(&self) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(std::io::Error::other("connection reset").into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_respects_delay_and_window() {
        let immediate = Arc::new(FakeAggregator::default());
        let delayed = Arc::new(FakeAggregator {
            delay: Some(Duration::from_secs(5)),
            duration: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let disabled = Arc::new(FakeAggregator {
            disabled: true,
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(immediate.clone());
        harvester.add(delayed.clone());
        harvester.add(disabled.clone());
        harvester.start();

        assert!(immediate.started.load(Ordering::SeqCst));
        assert!(!delayed.started.load(Ordering::SeqCst));
        assert_eq!(disabled.starts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(delayed.started.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!delayed.started.load(Ordering::SeqCst));
        assert_eq!(delayed.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_does_not_reschedule() {
        let delayed = Arc::new(FakeAggregator {
            delay: Some(Duration::from_secs(5)),
            duration: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(delayed.clone());
        harvester.start();

        tokio::time::sleep(Duration::from_secs(12)).await;
        let late = Arc::new(FakeAggregator::default());
        harvester.add(late.clone());
        harvester.start();
        assert_eq!(late.starts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(delayed.starts.load(Ordering::SeqCst), 1);
        assert_eq!(delayed.stops.load(Ordering::SeqCst), 1);
        assert!(!delayed.started.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_harvester_cancels_timers() {
        let delayed = Arc::new(FakeAggregator {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(delayed.clone());
        harvester.start();
        drop(harvester);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(delayed.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_waits_for_every_aggregator() {
        let ok = Arc::new(FakeAggregator::default());
        let failing = Arc::new(FakeAggregator {
            fail: true,
            ..Default::default()
        });
        let disabled = Arc::new(FakeAggregator {
            disabled: true,
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(ok.clone());
        harvester.add(failing.clone());
        harvester.add(disabled.clone());

        let report = harvester.clear().await;
        assert_eq!(report.outcomes.len(), 3);
        assert!(matches!(report.outcomes[0].status, SendStatus::Sent));
        assert!(matches!(report.outcomes[1].status, SendStatus::Failed(_)));
        assert!(matches!(report.outcomes[2].status, SendStatus::Disabled));
        assert_eq!(report.failures().count(), 1);
        assert!(!report.is_success());
        assert_eq!(ok.sends.load(Ordering::SeqCst), 1);
        assert_eq!(failing.sends.load(Ordering::SeqCst), 1);
        assert_eq!(disabled.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_then_runs_callback_once() {
        let aggregator = Arc::new(FakeAggregator::default());
        let mut harvester = Harvester::new();
        harvester.add(aggregator.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = calls.clone();
        harvester
            .clear_then(move |report| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(report.outcomes.len());
            })
            .unwrap()
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_fail_the_round() {
        let mut harvester = Harvester::new();
        harvester.add(Arc::new(FakeAggregator::default()));
        let handle = harvester.clear_then(|_| panic!("callback bug")).unwrap();
        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_stop_and_update_reach_every_aggregator() {
        let enabled = Arc::new(FakeAggregator::default());
        let disabled = Arc::new(FakeAggregator {
            disabled: true,
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(enabled.clone());
        harvester.add(disabled.clone());

        harvester.stop();
        harvester.update(&AgentConfig::default());
        for aggregator in [&enabled, &disabled] {
            assert_eq!(aggregator.stops.load(Ordering::SeqCst), 1);
            assert_eq!(aggregator.reconfigures.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_start_without_runtime_starts_immediately() {
        let delayed = Arc::new(FakeAggregator {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mut harvester = Harvester::new();
        harvester.add(delayed.clone());
        harvester.start();
        assert!(delayed.started.load(Ordering::SeqCst));
    }
}
