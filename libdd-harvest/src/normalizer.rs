// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction segment normalization.
//!
//! Each rule names a transaction name prefix and the path segments that may follow it verbatim.
//! Any other segment after the prefix collapses into `*`, and consecutive `*` merge into one.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentTerms {
    pub prefix: String,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeResult {
    pub matched: bool,
    pub value: String,
}

#[derive(Debug, Default, Clone)]
pub struct TxSegmentNormalizer {
    rules: Vec<SegmentTerms>,
}

impl TxSegmentNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rules with `json`, which must be an array of `{prefix, terms}` objects.
    /// Anything else is ignored and the previous rules stay active. Returns whether the rules
    /// were replaced.
    pub fn load(&mut self, json: &Value) -> bool {
        let Value::Array(entries) = json else {
            warn!(
                value = %json,
                "transaction_segment_terms must be an array, keeping previous rules"
            );
            return false;
        };
        self.rules = entries
            .iter()
            .filter_map(|entry| match SegmentTerms::deserialize(entry) {
                Ok(mut rule) => {
                    if !rule.prefix.ends_with('/') {
                        rule.prefix.push('/');
                    }
                    Some(rule)
                }
                Err(e) => {
                    warn!(error = %e, entry = %entry, "Ignoring invalid segment terms rule");
                    None
                }
            })
            .collect();
        debug!(rules = self.rules.len(), "Loaded segment terms");
        true
    }

    pub fn rules(&self) -> &[SegmentTerms] {
        &self.rules
    }

    /// Apply the first rule whose prefix starts `path`.
    pub fn normalize(&self, path: &str) -> NormalizeResult {
        let Some(rule) = self.rules.iter().find(|r| path.starts_with(&r.prefix)) else {
            return NormalizeResult {
                matched: false,
                value: path.to_owned(),
            };
        };

        let fragment = &path[rule.prefix.len()..];
        let parts: Vec<&str> = fragment.split('/').collect();
        let mut result: Vec<&str> = Vec::with_capacity(parts.len());
        for (i, &segment) in parts.iter().enumerate() {
            if segment.is_empty() && i + 1 == parts.len() {
                break;
            }
            if rule.terms.iter().any(|term| term == segment) {
                result.push(segment);
            } else if result.last() != Some(&"*") {
                result.push("*");
            }
        }

        NormalizeResult {
            matched: true,
            value: format!("{}{}", rule.prefix, result.join("/")),
        }
    }
}
