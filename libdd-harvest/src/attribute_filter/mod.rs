// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides which attributes may be attached to which telemetry destination.
//!
//! # Decision
//! Each key is matched against the global and the destination exclude and include rules. Exact
//! matches are absolute: an exact exclude at either level rejects the key, an exact include
//! accepts it. Otherwise the longest wildcard wins, a key no exclude rule matched is accepted.
//!
//! # Cache
//! Results are cached per `(destination, key)` up to `attributes.filter_cache_limit` entries.
//! The cache lives next to the compiled rules and is replaced with them on every update.

mod rules;

use crate::config::{AgentConfig, ConfigKey, ConfigUpdate};
use crate::destinations::Destinations;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

pub use rules::{RuleMatcher, EXACT_MATCH, NO_MATCH};

#[derive(Debug, Default)]
struct RuleSet {
    include: RuleMatcher,
    exclude: RuleMatcher,
}

impl RuleSet {
    fn compile(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            include: RuleMatcher::compile(include)?,
            exclude: RuleMatcher::compile(exclude)?,
        })
    }
}

#[derive(Debug)]
struct DestinationRules {
    destination: Destinations,
    enabled: bool,
    rules: RuleSet,
}

#[derive(Debug, Default)]
struct FilterCache {
    entries: HashMap<Destinations, HashMap<String, bool>>,
    len: usize,
}

impl FilterCache {
    fn get(&self, destination: Destinations, key: &str) -> Option<bool> {
        self.entries.get(&destination)?.get(key).copied()
    }

    fn insert(&mut self, destination: Destinations, key: &str, value: bool, limit: usize) {
        if self.len >= limit {
            return;
        }
        let per_destination = self.entries.entry(destination).or_default();
        if per_destination.insert(key.to_owned(), value).is_none() {
            self.len += 1;
        }
    }
}

/// Snapshot of everything compiled from one configuration.
#[derive(Debug)]
struct CompiledRules {
    enabled: bool,
    include_enabled: bool,
    global: RuleSet,
    destinations: Vec<DestinationRules>,
    cache_limit: usize,
    cache: Mutex<FilterCache>,
}

impl CompiledRules {
    fn compile(config: &AgentConfig) -> Result<Self, regex::Error> {
        let attributes = &config.attributes;
        let mut destinations = Vec::new();
        for destination in Destinations::each() {
            let Some(dest_config) = config.destination_attributes(destination) else {
                continue;
            };
            destinations.push(DestinationRules {
                destination,
                enabled: dest_config.enabled,
                rules: RuleSet::compile(&dest_config.include, &dest_config.exclude)?,
            });
        }
        Ok(Self {
            enabled: attributes.enabled,
            include_enabled: attributes.include_enabled,
            global: RuleSet::compile(&attributes.include, &attributes.exclude)?,
            destinations,
            cache_limit: attributes.filter_cache_limit,
            cache: Mutex::default(),
        })
    }

    fn destination(&self, destination: Destinations) -> Option<&DestinationRules> {
        self.destinations
            .iter()
            .find(|d| d.destination == destination)
    }

    fn test(&self, destination: Destinations, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(dest_rules) = self.destination(destination) else {
            debug!(?destination, "Attribute test for unknown destination");
            return false;
        };
        if !dest_rules.enabled {
            return false;
        }

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(destination, key) {
            return cached;
        }
        let result = self.decide(&dest_rules.rules, key);
        cache.insert(destination, key, result, self.cache_limit);
        result
    }

    fn decide(&self, dest_rules: &RuleSet, key: &str) -> bool {
        let global_exclude = self.global.exclude.strength(key);
        let dest_exclude = dest_rules.exclude.strength(key);
        if global_exclude == EXACT_MATCH || dest_exclude == EXACT_MATCH {
            return false;
        }

        let (global_include, dest_include) = if self.include_enabled {
            (
                self.global.include.strength(key),
                dest_rules.include.strength(key),
            )
        } else {
            (NO_MATCH, NO_MATCH)
        };
        if global_include == EXACT_MATCH || dest_include == EXACT_MATCH {
            return true;
        }

        // The asymmetric comparisons are the tie-break policy: a destination include only needs
        // to equal a global exclude, a global include must beat it.
        (global_exclude == NO_MATCH && dest_exclude == NO_MATCH)
            || (dest_include > dest_exclude && dest_include >= global_exclude)
            || (global_include > dest_exclude && global_include > global_exclude)
    }

    fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len
    }
}

/// Attribute inclusion/exclusion engine.
///
/// Cheap to share behind an [`Arc`]: rules are swapped atomically by [`AttributeFilter::update`]
/// so tests in flight keep using the snapshot they started with.
#[derive(Debug)]
pub struct AttributeFilter {
    rules: ArcSwap<CompiledRules>,
}

impl AttributeFilter {
    /// Compile the rules of `config`. Rules that fail to compile leave the filter with empty
    /// rule sets, which accepts every key the enabled flags allow.
    pub fn new(config: &AgentConfig) -> Self {
        let compiled = CompiledRules::compile(config).unwrap_or_else(|err| {
            warn!(error = %err, "Failed to compile attribute rules, ignoring them");
            CompiledRules {
                enabled: config.attributes.enabled,
                include_enabled: config.attributes.include_enabled,
                global: RuleSet::default(),
                destinations: Destinations::each()
                    .map(|destination| DestinationRules {
                        destination,
                        enabled: config
                            .destination_attributes(destination)
                            .is_some_and(|d| d.enabled),
                        rules: RuleSet::default(),
                    })
                    .collect(),
                cache_limit: config.attributes.filter_cache_limit,
                cache: Mutex::default(),
            }
        });
        Self {
            rules: ArcSwap::from_pointee(compiled),
        }
    }

    /// Recompile every rule set from `config` and drop the cache. On a compilation error the
    /// previous rules stay active.
    pub fn update(&self, config: &AgentConfig) {
        match CompiledRules::compile(config) {
            Ok(compiled) => {
                debug!("Attribute rules reloaded");
                self.rules.store(Arc::new(compiled));
            }
            Err(err) => {
                warn!(error = %err, "Failed to compile attribute rules, keeping previous rules");
            }
        }
    }

    /// Whether `key` may be sent to `destination`. For a combination of destinations the key
    /// must be accepted by every one of them.
    pub fn test(&self, destination: Destinations, key: &str) -> bool {
        let rules = self.rules.load();
        if destination.bits().count_ones() == 1 {
            return rules.test(destination, key);
        }
        !destination.is_empty() && destination.iter().all(|d| rules.test(d, key))
    }

    /// The subset of `destinations` accepting `key`.
    pub fn filter(&self, destinations: Destinations, key: &str) -> Destinations {
        let rules = self.rules.load();
        destinations
            .iter()
            .filter(|d| rules.test(*d, key))
            .fold(Destinations::empty(), |acc, d| acc | d)
    }

    /// Number of cached decisions.
    pub fn cache_len(&self) -> usize {
        self.rules.load().cache_len()
    }

    /// Keep the filter in sync with `config_rx`, reloading it whenever an attribute key changes.
    ///
    /// The task ends when the configuration owner is dropped.
    pub fn watch(self: Arc<Self>, mut config_rx: watch::Receiver<ConfigUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let update = config_rx.borrow_and_update().clone();
                if update.touches(ConfigKey::affects_attributes) {
                    self.update(&update.config);
                }
            }
        })
    }
}
