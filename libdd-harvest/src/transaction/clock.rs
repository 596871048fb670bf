// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub(crate) enum Now {
    #[default]
    Std,
    #[cfg(test)]
    Mock(Arc<Mutex<Instant>>),
}

impl Now {
    pub(crate) fn now(&self) -> Instant {
        match self {
            Self::Std => Instant::now(),
            #[cfg(test)]
            #[allow(clippy::unwrap_used)]
            Self::Mock(now) => *now.lock().unwrap(),
        }
    }

    #[cfg(test)]
    pub(crate) fn mock() -> Self {
        Self::Mock(Arc::new(Mutex::new(Instant::now())))
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub(crate) fn advance(&self, by: Duration) {
        if let Self::Mock(now) = self {
            *now.lock().unwrap() += by;
        }
    }
}
