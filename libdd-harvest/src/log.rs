// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics setup for the agent.
//!
//! Every module logs through `tracing`. This module only installs the subscriber that decides
//! which of those events are printed.

use crate::error::LogInitError;
use serde::Deserialize;
use std::{fmt, str::FromStr};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Environment variable holding a full `EnvFilter` directive, taking precedence over the
/// configured level.
pub const LOG_FILTER_ENV: &str = "HARVEST_LOG";

/// Minimum level of the diagnostics that are emitted.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Designates very low priority, often extremely verbose, information.
    Trace,
    Debug,
    #[default]
    Info,
    /// Designates hazardous situations.
    Warn,
    /// Designates very serious errors.
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownLogLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(UnknownLogLevel(s.to_owned())),
        }
    }
}

/// Build the filter used by [`init`]: `HARVEST_LOG` if set, else `level` for the whole process.
pub fn build_filter(level: LogLevel) -> Result<EnvFilter, LogInitError> {
    match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) if !directives.is_empty() => Ok(EnvFilter::try_new(directives)?),
        _ => Ok(EnvFilter::builder()
            .with_default_directive(LevelFilter::from(level).into())
            .parse("")?),
    }
}

/// Install a global fmt subscriber gated at `level`.
///
/// # Errors
/// Fails if the filter directive is invalid or another global subscriber is already set.
pub fn init(level: LogLevel) -> Result<(), LogInitError> {
    let filter = build_filter(level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|_| LogInitError::AlreadyInstalled)
}
