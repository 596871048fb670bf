// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarded application log lines.

use super::stream::{EventStream, PayloadContext};
use crate::config::AgentConfig;
use crate::info::MetadataCache;
use crate::sampling::{PriorityQueue, Sampler};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::debug;

type Deferred = Box<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// A buffered log line, either already formatted or formatted when the payload is built.
pub enum LogEntry {
    Eager(Value),
    Lazy(Deferred),
}

impl LogEntry {
    pub fn lazy(format: impl Fn() -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        LogEntry::Lazy(Box::new(format))
    }

    /// Formatted line, or `None` when formatting failed or produced nothing.
    pub fn resolve(&self) -> Option<Value> {
        let value = match self {
            LogEntry::Eager(value) => value.clone(),
            LogEntry::Lazy(format) => match format() {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "Failed to format log line, dropping it");
                    return None;
                }
            },
        };
        let empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        (!empty).then_some(value)
    }
}

impl From<Value> for LogEntry {
    fn from(value: Value) -> Self {
        LogEntry::Eager(value)
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Eager(value) => f.debug_tuple("Eager").field(value).finish(),
            LogEntry::Lazy(_) => f.write_str("Lazy"),
        }
    }
}

/// Log forwarding stream (`log_event_data`).
#[derive(Debug)]
pub struct LogEvents {
    hostname: MetadataCache<String>,
}

impl Default for LogEvents {
    fn default() -> Self {
        Self::new(MetadataCache::hostname())
    }
}

impl LogEvents {
    pub fn new(hostname: MetadataCache<String>) -> Self {
        Self { hostname }
    }

    /// Forget the memoized host metadata, e.g. after the host was renamed.
    pub fn clear_cache(&self) {
        self.hostname.clear_cache();
    }

    fn common_attributes(&self, config: &AgentConfig) -> Map<String, Value> {
        let mut attributes = Map::new();
        match self.hostname.get() {
            Ok(hostname) => {
                attributes.insert(String::from("hostname"), Value::String(hostname));
            }
            Err(e) => debug!(error = %e, "Hostname unavailable for log common attributes"),
        }
        if let Some(guid) = &config.entity_guid {
            attributes.insert(String::from("entity.guid"), Value::String(guid.clone()));
        }
        attributes.insert(
            String::from("entity.name"),
            Value::String(config.app_name.clone()),
        );
        attributes
    }
}

impl EventStream for LogEvents {
    type Event = LogEntry;
    const METHOD: &'static str = "log_event_data";

    fn sampler(&self, limit: usize) -> Sampler<LogEntry> {
        Sampler::Priority(PriorityQueue::new(limit))
    }

    fn limit(&self, config: &AgentConfig) -> usize {
        let logging = &config.application_logging;
        if !(logging.enabled && logging.forwarding.enabled) {
            return 0;
        }
        config
            .event_harvest_config
            .harvest_limits
            .for_method(Self::METHOD)
            .unwrap_or(logging.forwarding.max_samples_stored)
    }

    fn format(&self, event: &LogEntry) -> Option<Value> {
        event.resolve()
    }

    fn envelope(&self, ctx: PayloadContext<'_>, entries: Vec<Value>) -> Value {
        json!([{
            "common": { "attributes": self.common_attributes(ctx.config) },
            "logs": entries,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> LogEvents {
        LogEvents::new(MetadataCache::new(|| Ok(String::from("test-host"))))
    }

    #[test]
    fn test_entries_resolve() {
        assert_eq!(
            LogEntry::from(json!({"message": "hi"})).resolve(),
            Some(json!({"message": "hi"}))
        );
        assert_eq!(LogEntry::Eager(json!("")).resolve(), None);
        assert_eq!(LogEntry::lazy(|| Ok(json!({}))).resolve(), None);
        assert_eq!(
            LogEntry::lazy(|| anyhow::bail!("unserializable")).resolve(),
            None
        );
        assert_eq!(
            LogEntry::lazy(|| Ok(json!({"message": "late"}))).resolve(),
            Some(json!({"message": "late"}))
        );
    }

    #[test]
    fn test_envelope() {
        let config = AgentConfig {
            app_name: String::from("checkout"),
            entity_guid: Some(String::from("guid-1")),
            ..Default::default()
        };
        let ctx = PayloadContext {
            config: &config,
            reservoir_size: 1,
            events_seen: 1,
        };
        let payload = stream().envelope(ctx, vec![json!({"message": "m"})]);
        assert_eq!(
            payload,
            json!([{
                "common": { "attributes": {
                    "hostname": "test-host",
                    "entity.guid": "guid-1",
                    "entity.name": "checkout",
                }},
                "logs": [{"message": "m"}],
            }])
        );
    }

    #[test]
    fn test_limit() {
        let mut config = AgentConfig::default();
        assert_eq!(stream().limit(&config), 10_000);
        config.event_harvest_config.harvest_limits.log_event_data = Some(5);
        assert_eq!(stream().limit(&config), 5);
        config.application_logging.forwarding.enabled = false;
        assert_eq!(stream().limit(&config), 0);
    }
}
