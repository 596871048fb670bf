// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded sampling containers backing the event aggregators.
//!
//! [`Reservoir`] keeps a uniform random sample of everything offered since the last take.
//! [`PriorityQueue`] keeps the highest priority items, breaking ties at the minimum priority
//! with the same random rule as the reservoir.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Uniform reservoir sampling (algorithm R).
///
/// Once full, the n-th offered item replaces a random slot with probability `limit / n`, so
/// every offered item has the same chance of being retained.
#[derive(Debug)]
pub struct Reservoir<T> {
    items: Vec<T>,
    limit: usize,
    seen: usize,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(limit: usize) -> Self {
        Self::with_rng(limit, StdRng::from_entropy())
    }

    pub fn with_seed(limit: usize, seed: u64) -> Self {
        Self::with_rng(limit, StdRng::seed_from_u64(seed))
    }

    fn with_rng(limit: usize, rng: StdRng) -> Self {
        Self {
            items: Vec::new(),
            limit,
            seen: 0,
            rng,
        }
    }

    /// Offer `item`. Returns whether it was retained.
    pub fn add(&mut self, item: T) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.seen += 1;
        if self.items.len() < self.limit {
            self.items.push(item);
            return true;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.limit {
            self.items[slot] = item;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Items offered since the last take.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Change the capacity. Shrinking evicts random slots until the new limit is met.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        if limit == 0 {
            self.items.clear();
            self.seen = 0;
            return;
        }
        while self.items.len() > limit {
            let slot = self.rng.gen_range(0..self.items.len());
            self.items.swap_remove(slot);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Take every retained item and reset the sampling state.
    pub fn take(&mut self) -> Vec<T> {
        self.seen = 0;
        std::mem::take(&mut self.items)
    }

    /// Re-offer items taken earlier, under the same sampling rule. `seen` is the count reported
    /// alongside them by [`Reservoir::seen`] and replaces their per-item count.
    pub fn merge(&mut self, items: impl IntoIterator<Item = T>, seen: usize) {
        if self.limit == 0 {
            return;
        }
        let before = self.seen;
        for item in items {
            self.add(item);
        }
        self.seen = before + seen;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.seen = 0;
    }
}

#[derive(Debug)]
struct Prioritized<T> {
    priority: f64,
    /// Random key ordering items of equal priority, so the heap minimum among ties is a random
    /// one of them.
    tiebreak: u64,
    item: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.tiebreak.cmp(&other.tiebreak))
    }
}

/// Keeps the `limit` highest priority items.
///
/// A new item evicts the current minimum only when its priority is strictly greater. At equal
/// priority it replaces the minimum with probability `limit / seen`, the reservoir rule.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Reverse<Prioritized<T>>>,
    limit: usize,
    seen: usize,
    rng: StdRng,
}

impl<T> PriorityQueue<T> {
    pub fn new(limit: usize) -> Self {
        Self::with_rng(limit, StdRng::from_entropy())
    }

    pub fn with_seed(limit: usize, seed: u64) -> Self {
        Self::with_rng(limit, StdRng::seed_from_u64(seed))
    }

    fn with_rng(limit: usize, rng: StdRng) -> Self {
        Self {
            heap: BinaryHeap::new(),
            limit,
            seen: 0,
            rng,
        }
    }

    /// Offer `item` with `priority`. A NaN priority is treated as the lowest possible one.
    /// Returns whether the item was retained.
    pub fn add(&mut self, item: T, priority: f64) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.seen += 1;
        let priority = if priority.is_nan() {
            f64::NEG_INFINITY
        } else {
            priority
        };
        let entry = Prioritized {
            priority,
            tiebreak: self.rng.gen(),
            item,
        };
        if self.heap.len() < self.limit {
            self.heap.push(Reverse(entry));
            return true;
        }

        let Some(Reverse(min)) = self.heap.peek() else {
            return false;
        };
        let replace = match priority.total_cmp(&min.priority) {
            Ordering::Greater => true,
            Ordering::Equal => self.rng.gen_range(0..self.seen) < self.limit,
            Ordering::Less => false,
        };
        if replace {
            self.heap.pop();
            self.heap.push(Reverse(entry));
        }
        replace
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Lowest retained priority.
    pub fn min_priority(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(min)| min.priority)
    }

    /// Change the capacity, evicting the lowest priorities first.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        if limit == 0 {
            self.heap.clear();
            self.seen = 0;
            return;
        }
        while self.heap.len() > limit {
            self.heap.pop();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|Reverse(p)| &p.item)
    }

    /// Take every retained item with its priority, highest priority first.
    pub fn take(&mut self) -> Vec<(f64, T)> {
        self.seen = 0;
        let mut entries: Vec<Prioritized<T>> = std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(p)| p)
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|p| (p.priority, p.item)).collect()
    }

    pub fn merge(&mut self, items: impl IntoIterator<Item = (f64, T)>, seen: usize) {
        if self.limit == 0 {
            return;
        }
        let before = self.seen;
        for (priority, item) in items {
            self.add(item, priority);
        }
        self.seen = before + seen;
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.seen = 0;
    }
}

/// Either sampling policy, chosen per telemetry stream.
#[derive(Debug)]
pub enum Sampler<T> {
    Uniform(Reservoir<T>),
    Priority(PriorityQueue<T>),
}

impl<T> Sampler<T> {
    /// Offer `item`; `priority` is only considered by the priority policy.
    pub fn add(&mut self, item: T, priority: Option<f64>) -> bool {
        match self {
            Sampler::Uniform(r) => r.add(item),
            Sampler::Priority(q) => q.add(item, priority.unwrap_or(0.0)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Sampler::Uniform(r) => r.len(),
            Sampler::Priority(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        match self {
            Sampler::Uniform(r) => r.limit(),
            Sampler::Priority(q) => q.limit(),
        }
    }

    pub fn seen(&self) -> usize {
        match self {
            Sampler::Uniform(r) => r.seen(),
            Sampler::Priority(q) => q.seen(),
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        match self {
            Sampler::Uniform(r) => r.set_limit(limit),
            Sampler::Priority(q) => q.set_limit(limit),
        }
    }

    /// Take every retained item. Items of the uniform policy carry no priority.
    pub fn take(&mut self) -> Vec<(Option<f64>, T)> {
        match self {
            Sampler::Uniform(r) => r.take().into_iter().map(|i| (None, i)).collect(),
            Sampler::Priority(q) => q.take().into_iter().map(|(p, i)| (Some(p), i)).collect(),
        }
    }

    /// Re-offer previously taken items, e.g. after a failed send, with the `seen` count taken
    /// alongside them.
    pub fn merge(&mut self, items: impl IntoIterator<Item = (Option<f64>, T)>, seen: usize) {
        match self {
            Sampler::Uniform(r) => r.merge(items.into_iter().map(|(_, i)| i), seen),
            Sampler::Priority(q) => q.merge(
                items.into_iter().map(|(p, i)| (p.unwrap_or(0.0), i)),
                seen,
            ),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Sampler::Uniform(r) => r.clear(),
            Sampler::Priority(q) => q.clear(),
        }
    }
}
