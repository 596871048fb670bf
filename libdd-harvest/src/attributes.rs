// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::attribute_filter::AttributeFilter;
use crate::destinations::Destinations;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

pub const MAXIMUM_CUSTOM_ATTRIBUTES: usize = 64;
/// Limit in bytes for keys and string values.
pub const MAX_ATTRIBUTE_LENGTH: usize = 255;

pub trait TruncateUtf8 {
    fn truncate_utf8(&self, limit: usize) -> &str;
}

impl TruncateUtf8 for str {
    fn truncate_utf8(&self, limit: usize) -> &str {
        if self.len() <= limit {
            return self;
        }
        let mut end = limit;
        while !self.is_char_boundary(end) {
            end -= 1;
        }
        &self[..end]
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Attribute {
    value: Value,
    destinations: Destinations,
}

/// Attributes attached to a transaction or a segment, each routed to the destinations the
/// attribute filter allowed when it was added.
#[derive(Debug, Clone)]
pub struct Attributes {
    scope: Destinations,
    limit: usize,
    attributes: HashMap<String, Attribute>,
}

impl Attributes {
    /// `scope` bounds the destinations attributes of this bag can ever reach.
    pub fn new(scope: Destinations, limit: usize) -> Self {
        Self {
            scope,
            limit,
            attributes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Add `key` for `destinations`, keeping only the destinations the filter accepts.
    ///
    /// Returns the destinations the attribute was stored for, empty if it was dropped.
    pub fn add_attribute(
        &mut self,
        destinations: Destinations,
        key: &str,
        value: impl Into<Value>,
        filter: &AttributeFilter,
    ) -> Destinations {
        let destinations = filter.filter(destinations & self.scope, key);
        if destinations.is_empty() {
            return destinations;
        }
        if key.len() > MAX_ATTRIBUTE_LENGTH {
            debug!(key, "Attribute key exceeds {MAX_ATTRIBUTE_LENGTH} bytes, dropping it");
            return Destinations::empty();
        }
        if !self.attributes.contains_key(key) && self.attributes.len() >= self.limit {
            debug!(key, limit = self.limit, "Attribute limit reached, dropping attribute");
            return Destinations::empty();
        }

        let value = match value.into() {
            Value::String(s) => Value::String(s.truncate_utf8(MAX_ATTRIBUTE_LENGTH).to_owned()),
            v @ (Value::Bool(_) | Value::Number(_)) => v,
            other => {
                debug!(key, value = %other, "Unsupported attribute value type, dropping it");
                return Destinations::empty();
            }
        };
        self.attributes.insert(
            key.to_owned(),
            Attribute {
                value,
                destinations,
            },
        );
        destinations
    }

    /// Attributes visible to `destination`.
    pub fn get(&self, destination: Destinations) -> Map<String, Value> {
        self.attributes
            .iter()
            .filter(|(_, attr)| attr.destinations.intersects(destination))
            .map(|(key, attr)| (key.clone(), attr.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn filter() -> AttributeFilter {
        let mut config = AgentConfig::default();
        config.transaction_tracer.attributes.exclude = vec!["hidden".into()];
        AttributeFilter::new(&config)
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!("".truncate_utf8(5), "");
        assert_eq!("télé".truncate_utf8(6), "télé");
        assert_eq!("télé".truncate_utf8(2), "t");
        assert_eq!("ééééé".truncate_utf8(5), "éé");
    }

    #[test]
    fn test_routing() {
        let filter = filter();
        let mut attrs = Attributes::new(Destinations::TRANS_SCOPE, MAXIMUM_CUSTOM_ATTRIBUTES);
        let stored = attrs.add_attribute(Destinations::TRANS_COMMON, "hidden", 1, &filter);
        assert_eq!(stored, Destinations::TRANS_EVENT | Destinations::ERROR_EVENT);
        attrs.add_attribute(Destinations::TRANS_COMMON, "shown", "v", &filter);

        assert_eq!(attrs.get(Destinations::TRANS_TRACE).len(), 1);
        assert_eq!(attrs.get(Destinations::TRANS_EVENT).len(), 2);
        // Out of scope destinations are ignored.
        assert!(attrs
            .add_attribute(Destinations::SPAN_EVENT, "span", 1, &filter)
            .is_empty());
    }

    #[test]
    fn test_limits() {
        let filter = filter();
        let mut attrs = Attributes::new(Destinations::TRANS_SCOPE, 2);
        attrs.add_attribute(Destinations::TRANS_EVENT, "a", 1, &filter);
        attrs.add_attribute(Destinations::TRANS_EVENT, "b", 1, &filter);
        assert!(attrs
            .add_attribute(Destinations::TRANS_EVENT, "c", 1, &filter)
            .is_empty());
        // Overwriting an existing key is allowed at the limit.
        assert!(!attrs
            .add_attribute(Destinations::TRANS_EVENT, "a", 2, &filter)
            .is_empty());

        let long_key = "k".repeat(MAX_ATTRIBUTE_LENGTH + 1);
        let mut attrs = Attributes::new(Destinations::TRANS_SCOPE, 10);
        assert!(attrs
            .add_attribute(Destinations::TRANS_EVENT, &long_key, 1, &filter)
            .is_empty());
        attrs.add_attribute(
            Destinations::TRANS_EVENT,
            "long",
            "v".repeat(1000),
            &filter,
        );
        assert_eq!(
            attrs.get(Destinations::TRANS_EVENT)["long"]
                .as_str()
                .unwrap()
                .len(),
            MAX_ATTRIBUTE_LENGTH
        );
        assert!(attrs
            .add_attribute(Destinations::TRANS_EVENT, "obj", serde_json::json!({}), &filter)
            .is_empty());
    }
}
