// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::destinations::Destinations;
use crate::error::ConfigError;
use crate::log::LogLevel;
use serde::Deserialize;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::watch;

pub const DEFAULT_FILTER_CACHE_LIMIT: usize = 1000;
pub const DEFAULT_REPORT_PERIOD_MS: u64 = 60_000;

/// Attribute names that never leave the process unless explicitly included.
const DEFAULT_ATTRIBUTE_EXCLUDES: &[&str] = &[
    "request.headers.cookie",
    "request.headers.authorization",
    "request.headers.proxyAuthorization",
    "request.headers.setCookie*",
    "request.headers.x*",
    "response.headers.cookie",
    "response.headers.authorization",
    "response.headers.proxyAuthorization",
    "response.headers.setCookie*",
    "response.headers.x*",
];

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalAttributesConfig {
    pub enabled: bool,
    /// When false every include rule, global or per destination, is ignored.
    pub include_enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub filter_cache_limit: usize,
}

impl Default for GlobalAttributesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_enabled: true,
            include: Vec::new(),
            exclude: DEFAULT_ATTRIBUTE_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            filter_cache_limit: DEFAULT_FILTER_CACHE_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DestinationAttributesConfig {
    pub enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for DestinationAttributesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl DestinationAttributesConfig {
    fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionEventsConfig {
    pub enabled: bool,
    pub max_samples_stored: usize,
    pub attributes: DestinationAttributesConfig,
}

impl Default for TransactionEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: 10_000,
            attributes: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionTracerConfig {
    pub attributes: DestinationAttributesConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorCollectorConfig {
    pub enabled: bool,
    pub capture_events: bool,
    pub max_event_samples_stored: usize,
    pub attributes: DestinationAttributesConfig,
}

impl Default for ErrorCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_events: true,
            max_event_samples_stored: 100,
            attributes: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserMonitoringConfig {
    pub attributes: DestinationAttributesConfig,
}

impl Default for BrowserMonitoringConfig {
    fn default() -> Self {
        Self {
            attributes: DestinationAttributesConfig::disabled(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpanEventsConfig {
    pub enabled: bool,
    pub max_samples_stored: usize,
    pub attributes: DestinationAttributesConfig,
}

impl Default for SpanEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: 2000,
            attributes: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionSegmentsConfig {
    pub attributes: DestinationAttributesConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CustomEventsConfig {
    pub enabled: bool,
    pub max_samples_stored: usize,
}

impl Default for CustomEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: 3000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogForwardingConfig {
    pub enabled: bool,
    pub max_samples_stored: usize,
}

impl Default for LogForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationLoggingConfig {
    pub enabled: bool,
    pub forwarding: LogForwardingConfig,
}

impl Default for ApplicationLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            forwarding: Default::default(),
        }
    }
}

/// Per-method limits sent back by the collector on connect. A present value wins over the
/// locally configured `max_samples_stored`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarvestLimits {
    pub analytic_event_data: Option<usize>,
    pub custom_event_data: Option<usize>,
    pub error_event_data: Option<usize>,
    pub span_event_data: Option<usize>,
    pub log_event_data: Option<usize>,
}

impl HarvestLimits {
    pub fn for_method(&self, method: &str) -> Option<usize> {
        match method {
            "analytic_event_data" => self.analytic_event_data,
            "custom_event_data" => self.custom_event_data,
            "error_event_data" => self.error_event_data,
            "span_event_data" => self.span_event_data,
            "log_event_data" => self.log_event_data,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventHarvestConfig {
    pub report_period_ms: u64,
    pub harvest_limits: HarvestLimits,
}

impl Default for EventHarvestConfig {
    fn default() -> Self {
        Self {
            report_period_ms: DEFAULT_REPORT_PERIOD_MS,
            harvest_limits: Default::default(),
        }
    }
}

impl EventHarvestConfig {
    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

/// Agent configuration as seen by the harvest core.
///
/// Loading it from files or the collector handshake is the caller's job; this crate only reads
/// it and reacts to the changes published through a [`ConfigHandle`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub app_name: String,
    pub run_id: Option<String>,
    pub entity_guid: Option<String>,
    pub attributes: GlobalAttributesConfig,
    pub transaction_events: TransactionEventsConfig,
    pub transaction_tracer: TransactionTracerConfig,
    pub error_collector: ErrorCollectorConfig,
    pub browser_monitoring: BrowserMonitoringConfig,
    pub span_events: SpanEventsConfig,
    pub transaction_segments: TransactionSegmentsConfig,
    pub custom_insights_events: CustomEventsConfig,
    pub application_logging: ApplicationLoggingConfig,
    pub event_harvest_config: EventHarvestConfig,
    /// Raw rules for the transaction segment normalizer, validated when loaded.
    pub transaction_segment_terms: serde_json::Value,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("unknown_app"),
            run_id: None,
            entity_guid: None,
            attributes: Default::default(),
            transaction_events: Default::default(),
            transaction_tracer: Default::default(),
            error_collector: Default::default(),
            browser_monitoring: Default::default(),
            span_events: Default::default(),
            transaction_segments: Default::default(),
            custom_insights_events: Default::default(),
            application_logging: Default::default(),
            event_harvest_config: Default::default(),
            transaction_segment_terms: serde_json::Value::Array(Vec::new()),
            logging: Default::default(),
        }
    }
}

/// Identifies a configuration value whose change subscribers may care about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    AttributesEnabled,
    AttributesIncludeEnabled,
    AttributesInclude,
    AttributesExclude,
    FilterCacheLimit,
    DestinationEnabled(Destinations),
    DestinationInclude(Destinations),
    DestinationExclude(Destinations),
    HarvestLimits,
    ReportPeriod,
    SegmentTerms,
    Streams,
}

impl ConfigKey {
    /// True for every key that changes how the attribute filter decides.
    pub fn affects_attributes(&self) -> bool {
        matches!(
            self,
            ConfigKey::AttributesEnabled
                | ConfigKey::AttributesIncludeEnabled
                | ConfigKey::AttributesInclude
                | ConfigKey::AttributesExclude
                | ConfigKey::FilterCacheLimit
                | ConfigKey::DestinationEnabled(_)
                | ConfigKey::DestinationInclude(_)
                | ConfigKey::DestinationExclude(_)
        )
    }
}

impl AgentConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        FromEnv::apply(&mut config);
        config
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_harvest_config.report_period_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_harvest_config.report_period_ms",
                reason: String::from("must be greater than zero"),
            });
        }
        Ok(())
    }

    /// Rule set configured for a single-bit destination.
    pub fn destination_attributes(
        &self,
        destination: Destinations,
    ) -> Option<&DestinationAttributesConfig> {
        Some(match destination {
            Destinations::TRANS_EVENT => &self.transaction_events.attributes,
            Destinations::TRANS_TRACE => &self.transaction_tracer.attributes,
            Destinations::ERROR_EVENT => &self.error_collector.attributes,
            Destinations::BROWSER_EVENT => &self.browser_monitoring.attributes,
            Destinations::SPAN_EVENT => &self.span_events.attributes,
            Destinations::TRANS_SEGMENT => &self.transaction_segments.attributes,
            _ => return None,
        })
    }

    /// Keys whose value differs between `self` and `other`.
    pub fn changed_keys(&self, other: &AgentConfig) -> Vec<ConfigKey> {
        let mut changed = Vec::new();
        let (a, b) = (&self.attributes, &other.attributes);
        if a.enabled != b.enabled {
            changed.push(ConfigKey::AttributesEnabled);
        }
        if a.include_enabled != b.include_enabled {
            changed.push(ConfigKey::AttributesIncludeEnabled);
        }
        if a.include != b.include {
            changed.push(ConfigKey::AttributesInclude);
        }
        if a.exclude != b.exclude {
            changed.push(ConfigKey::AttributesExclude);
        }
        if a.filter_cache_limit != b.filter_cache_limit {
            changed.push(ConfigKey::FilterCacheLimit);
        }
        for dest in Destinations::each() {
            let (Some(a), Some(b)) = (
                self.destination_attributes(dest),
                other.destination_attributes(dest),
            ) else {
                continue;
            };
            if a.enabled != b.enabled {
                changed.push(ConfigKey::DestinationEnabled(dest));
            }
            if a.include != b.include {
                changed.push(ConfigKey::DestinationInclude(dest));
            }
            if a.exclude != b.exclude {
                changed.push(ConfigKey::DestinationExclude(dest));
            }
        }
        if self.event_harvest_config.harvest_limits != other.event_harvest_config.harvest_limits {
            changed.push(ConfigKey::HarvestLimits);
        }
        if self.event_harvest_config.report_period_ms != other.event_harvest_config.report_period_ms
        {
            changed.push(ConfigKey::ReportPeriod);
        }
        if self.transaction_segment_terms != other.transaction_segment_terms {
            changed.push(ConfigKey::SegmentTerms);
        }
        if self.transaction_events.enabled != other.transaction_events.enabled
            || self.transaction_events.max_samples_stored
                != other.transaction_events.max_samples_stored
            || self.custom_insights_events != other.custom_insights_events
            || self.error_collector.enabled != other.error_collector.enabled
            || self.error_collector.capture_events != other.error_collector.capture_events
            || self.error_collector.max_event_samples_stored
                != other.error_collector.max_event_samples_stored
            || self.span_events.enabled != other.span_events.enabled
            || self.span_events.max_samples_stored != other.span_events.max_samples_stored
            || self.application_logging != other.application_logging
        {
            changed.push(ConfigKey::Streams);
        }
        changed
    }
}

/// Environment overrides applied on top of the defaults.
pub struct FromEnv {}

impl FromEnv {
    const HARVEST_ATTRIBUTES_ENABLED: &'static str = "HARVEST_ATTRIBUTES_ENABLED";
    const HARVEST_FILTER_CACHE_LIMIT: &'static str = "HARVEST_FILTER_CACHE_LIMIT";
    const HARVEST_LOG: &'static str = "HARVEST_LOG";

    fn attributes_enabled() -> Option<bool> {
        let var = env::var(Self::HARVEST_ATTRIBUTES_ENABLED).ok()?;
        Some(var == "true" || var == "1")
    }

    fn filter_cache_limit() -> Option<usize> {
        env::var(Self::HARVEST_FILTER_CACHE_LIMIT)
            .ok()?
            .parse::<usize>()
            .ok()
    }

    fn log_level() -> Option<LogLevel> {
        env::var(Self::HARVEST_LOG).ok()?.parse().ok()
    }

    fn apply(config: &mut AgentConfig) {
        if let Some(enabled) = Self::attributes_enabled() {
            config.attributes.enabled = enabled;
        }
        if let Some(limit) = Self::filter_cache_limit() {
            config.attributes.filter_cache_limit = limit;
        }
        if let Some(level) = Self::log_level() {
            config.logging.level = level;
        }
    }
}

/// A published configuration snapshot and the keys that changed to produce it.
#[derive(Clone, Debug)]
pub struct ConfigUpdate {
    pub config: Arc<AgentConfig>,
    pub changed: Arc<[ConfigKey]>,
}

impl ConfigUpdate {
    pub fn touches(&self, predicate: impl Fn(&ConfigKey) -> bool) -> bool {
        self.changed.iter().any(predicate)
    }
}

/// Owner of the live configuration.
///
/// Subscribers receive a [`ConfigUpdate`] for each effective change; updates that do not change
/// anything are not published.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<ConfigUpdate>>,
}

impl ConfigHandle {
    pub fn new(config: AgentConfig) -> Self {
        let (sender, _) = watch::channel(ConfigUpdate {
            config: Arc::new(config),
            changed: Arc::from(Vec::new()),
        });
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> Arc<AgentConfig> {
        self.sender.borrow().config.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigUpdate> {
        self.sender.subscribe()
    }

    /// Apply `f` to a copy of the current configuration and publish it. Returns the keys that
    /// changed, none when the result does not validate.
    pub fn update(&self, f: impl FnOnce(&mut AgentConfig)) -> Vec<ConfigKey> {
        let current = self.current();
        let mut next = (*current).clone();
        f(&mut next);
        self.publish(&current, next)
    }

    /// Replace the whole configuration with a parsed document. On error the prior configuration
    /// stays in place.
    pub fn load_json(&self, json: &str) -> Result<Vec<ConfigKey>, ConfigError> {
        let next = AgentConfig::from_json_str(json)?;
        let current = self.current();
        Ok(self.publish(&current, next))
    }

    fn publish(&self, current: &AgentConfig, next: AgentConfig) -> Vec<ConfigKey> {
        if let Err(e) = next.validate() {
            tracing::warn!(error = %e, "Ignoring invalid configuration update");
            return Vec::new();
        }
        let changed = current.changed_keys(&next);
        if changed.is_empty() {
            return changed;
        }
        tracing::debug!(changed = ?changed, "Publishing configuration change");
        self.sender.send_replace(ConfigUpdate {
            config: Arc::new(next),
            changed: Arc::from(changed.clone()),
        });
        changed
    }
}
