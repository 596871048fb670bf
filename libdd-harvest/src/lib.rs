// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harvest core of the APM agent.
//!
//! Instrumentation creates [`transaction::Transaction`]s and their tracers, attaches attributes
//! through the [`attribute_filter::AttributeFilter`] and pushes events into per-stream
//! [`aggregator::EventAggregator`]s. The [`harvester::Harvester`] drives the start / send / stop
//! lifecycle of every registered aggregator.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod attribute_filter;
pub mod attributes;
pub mod config;
pub mod destinations;
pub mod error;
pub mod harvester;
pub mod info;
pub mod log;
pub mod metrics;
pub mod normalizer;
pub mod sampling;
pub mod segment_tree;
pub mod transaction;
pub mod transport;

pub use aggregator::{Aggregator, EventAggregator};
pub use attribute_filter::AttributeFilter;
pub use config::{AgentConfig, ConfigHandle};
pub use destinations::Destinations;
pub use harvester::{HarvestReport, Harvester};
pub use segment_tree::SegmentTree;
pub use transaction::Transaction;
