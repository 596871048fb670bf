// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compilation of include/exclude rule lists into regex matchers.
//!
//! Rules are split on `.` and merged into a prefix tree so that rules sharing a dotted prefix
//! share a branch of the generated alternation. Siblings are emitted longest segment first and
//! optional deeper branches are greedy, so the first match the regex engine reports is also the
//! longest prefix any rule can match.

use regex::Regex;
use std::collections::BTreeMap;

/// Strength reported for a key matched by no rule.
pub const NO_MATCH: usize = 0;
/// Strength reported for a key matched by an exact rule. Exact rules always win.
pub const EXACT_MATCH: usize = usize::MAX;

#[derive(Debug, Default)]
struct PrefixNode {
    /// A rule ends on this node.
    terminal: bool,
    children: BTreeMap<String, PrefixNode>,
}

impl PrefixNode {
    fn insert(&mut self, rule: &str) {
        let mut node = self;
        for segment in rule.split('.') {
            node = node.children.entry(segment.to_owned()).or_default();
        }
        node.terminal = true;
    }

    fn alternation(&self) -> String {
        let mut children: Vec<(&String, &PrefixNode)> = self.children.iter().collect();
        children.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let branches: Vec<String> = children
            .into_iter()
            .map(|(segment, child)| {
                let mut branch = regex::escape(segment);
                if !child.children.is_empty() {
                    let deeper = format!(r"\.{}", child.alternation());
                    if child.terminal {
                        branch.push_str(&format!("(?:{deeper})?"));
                    } else {
                        branch.push_str(&deeper);
                    }
                }
                branch
            })
            .collect();
        format!("(?:{})", branches.join("|"))
    }
}

fn build_pattern<'a>(rules: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut root = PrefixNode::default();
    for rule in rules {
        root.insert(rule);
    }
    if root.children.is_empty() {
        return None;
    }
    Some(root.alternation())
}

/// Matcher compiled from one include or exclude rule list.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    /// Anchored on both ends, built from the rules without a trailing `*`.
    exact: Option<Regex>,
    /// Anchored at the start only, built from the literal prefixes of `*` rules.
    wildcard: Option<Regex>,
}

impl RuleMatcher {
    pub fn compile<S: AsRef<str>>(rules: &[S]) -> Result<Self, regex::Error> {
        let (wildcards, exacts): (Vec<&str>, Vec<&str>) = rules
            .iter()
            .map(AsRef::as_ref)
            .partition(|rule| rule.ends_with('*'));

        let exact = build_pattern(exacts)
            .map(|pattern| Regex::new(&format!("^{pattern}$")))
            .transpose()?;
        let wildcard = build_pattern(
            wildcards
                .into_iter()
                .map(|rule| &rule[..rule.len() - 1]),
        )
        .map(|pattern| Regex::new(&format!("^{pattern}")))
        .transpose()?;

        Ok(Self { exact, wildcard })
    }

    /// How strongly `key` is matched: [`NO_MATCH`], [`EXACT_MATCH`], or for a wildcard rule the
    /// length of the matched prefix counting the trailing `*`, so a bare `*` rule scores 1.
    pub fn strength(&self, key: &str) -> usize {
        if self.exact.as_ref().is_some_and(|re| re.is_match(key)) {
            return EXACT_MATCH;
        }
        match self.wildcard.as_ref().and_then(|re| re.find(key)) {
            Some(m) => m.end() + 1,
            None => NO_MATCH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_none() && self.wildcard.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_prefixes_are_merged() {
        assert_eq!(
            build_pattern(["foo.bar", "foo.bang", "baz"]).unwrap(),
            r"(?:foo\.(?:bang|bar)|baz)"
        );
        assert_eq!(build_pattern(["a", "a.b"]).unwrap(), r"(?:a(?:\.(?:b))?)");
        assert!(build_pattern(std::iter::empty()).is_none());
    }

    #[test]
    fn test_exact_rules() {
        let matcher = RuleMatcher::compile(&["foo.bar", "foo", "a+b"]).unwrap();
        assert_eq!(matcher.strength("foo.bar"), EXACT_MATCH);
        assert_eq!(matcher.strength("foo"), EXACT_MATCH);
        assert_eq!(matcher.strength("a+b"), EXACT_MATCH);
        assert_eq!(matcher.strength("aab"), NO_MATCH);
        assert_eq!(matcher.strength("foo.ba"), NO_MATCH);
        assert_eq!(matcher.strength("foo.bar.baz"), NO_MATCH);
    }

    #[test]
    fn test_wildcard_strength_is_longest_prefix() {
        let matcher = RuleMatcher::compile(&["b*", "bcd*", "b.x*"]).unwrap();
        assert_eq!(matcher.strength("bcde"), 4);
        assert_eq!(matcher.strength("bc"), 2);
        assert_eq!(matcher.strength("b.xyz"), 4);
        assert_eq!(matcher.strength("b.y"), 2);
        assert_eq!(matcher.strength("a"), NO_MATCH);
    }

    #[test]
    fn test_nested_wildcards_prefer_deeper_branch() {
        let matcher = RuleMatcher::compile(&["request.*", "request.headers.*"]).unwrap();
        assert_eq!(
            matcher.strength("request.headers.host"),
            "request.headers.".len() + 1
        );
        assert_eq!(matcher.strength("request.method"), "request.".len() + 1);
    }

    #[test]
    fn test_bare_star_matches_everything() {
        let matcher = RuleMatcher::compile(&["*"]).unwrap();
        assert_eq!(matcher.strength(""), 1);
        assert_eq!(matcher.strength("anything"), 1);
    }

    #[test]
    fn test_star_inside_rule_is_literal() {
        let matcher = RuleMatcher::compile(&["a*b"]).unwrap();
        assert_eq!(matcher.strength("a*b"), EXACT_MATCH);
        assert_eq!(matcher.strength("axb"), NO_MATCH);
    }

    #[test]
    fn test_agrees_with_naive_matching() {
        bolero::check!()
            .with_type::<(Vec<(u8, u8, bool)>, (u8, u8, u8))>()
            .for_each(|(rules, key)| {
                // Small alphabet with dots so that prefixes collide often.
                const ALPHABET: [&str; 4] = ["a", "b", ".", "ab"];
                let rules: Vec<String> = rules
                    .iter()
                    .take(8)
                    .map(|(x, y, wild)| {
                        let mut rule = format!(
                            "{}{}",
                            ALPHABET[*x as usize % 4],
                            ALPHABET[*y as usize % 4]
                        );
                        if *wild {
                            rule.push('*');
                        }
                        rule
                    })
                    .collect();
                let key = format!(
                    "{}{}{}",
                    ALPHABET[key.0 as usize % 4],
                    ALPHABET[key.1 as usize % 4],
                    ALPHABET[key.2 as usize % 4]
                );

                let expected = if rules.iter().any(|r| !r.ends_with('*') && *r == key) {
                    EXACT_MATCH
                } else {
                    rules
                        .iter()
                        .filter_map(|r| r.strip_suffix('*'))
                        .filter(|prefix| key.starts_with(prefix))
                        .map(|prefix| prefix.len() + 1)
                        .max()
                        .unwrap_or(NO_MATCH)
                };
                let matcher = RuleMatcher::compile(&rules).unwrap();
                assert_eq!(matcher.strength(&key), expected, "rules {rules:?} key {key}");
            });
    }
}
