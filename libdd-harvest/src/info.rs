// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub mod os {
    #[cfg(not(target_arch = "wasm32"))]
    pub fn real_hostname() -> anyhow::Result<String> {
        Ok(sys_info::hostname()?)
    }
    #[cfg(target_arch = "wasm32")]
    pub fn real_hostname() -> anyhow::Result<String> {
        anyhow::bail!("hostname lookup is not available on wasm32")
    }
}

type Fetch<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

/// Memoized process metadata lookup.
///
/// The first successful lookup is kept until [`MetadataCache::clear_cache`]; failed lookups are
/// not cached and are retried on the next call.
pub struct MetadataCache<T> {
    fetch: Fetch<T>,
    value: Mutex<Option<T>>,
}

impl<T: Clone> MetadataCache<T> {
    pub fn new(fetch: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self {
            fetch: Box::new(fetch),
            value: Mutex::new(None),
        }
    }

    pub fn get(&self) -> anyhow::Result<T> {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = value.as_ref() {
            return Ok(v.clone());
        }
        let fetched = (self.fetch)()?;
        *value = Some(fetched.clone());
        Ok(fetched)
    }

    pub fn clear_cache(&self) {
        debug!("Clearing metadata cache");
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl MetadataCache<String> {
    pub fn hostname() -> Self {
        Self::new(os::real_hostname)
    }
}

impl<T> std::fmt::Debug for MetadataCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lookup_is_memoized_until_cleared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = MetadataCache::new(move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        assert_eq!(cache.get().unwrap(), 0);
        assert_eq!(cache.get().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.clear_cache();
        assert_eq!(cache.get().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache: MetadataCache<String> = MetadataCache::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("metadata endpoint unreachable")
            }
            Ok(String::from("host"))
        });
        assert!(cache.get().is_err());
        assert_eq!(cache.get().unwrap(), "host");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_real_hostname() {
        let hostname = MetadataCache::hostname().get().unwrap();
        assert!(!hostname.is_empty());
    }
}
