// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure of a single payload hand-off to the collector transport.
///
/// A transport error never fails a harvest round as a whole: the harvester reports it per
/// aggregator and keeps waiting for the other streams.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The collector refused the payload. When `retain` is set the events are merged back into
    /// the aggregator and sent again on the next harvest.
    #[error("payload rejected with status {status}")]
    Rejected { status: u16, retain: bool },
}

impl TransportError {
    pub fn should_retain(&self) -> bool {
        matches!(self, TransportError::Rejected { retain: true, .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("invalid log filter directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_only_for_rejections_asking_for_it() {
        assert!(TransportError::Rejected {
            status: 503,
            retain: true
        }
        .should_retain());
        assert!(!TransportError::Rejected {
            status: 413,
            retain: false
        }
        .should_retain());
        let io = TransportError::from(std::io::Error::other("boom"));
        assert!(!io.should_retain());
        assert_eq!(io.to_string(), "transport I/O failure: boom");
    }
}
