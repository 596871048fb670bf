// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

bitflags! {
    /// Telemetry sinks an attribute may flow to. Bits can be combined to route one attribute to
    /// several destinations with a single call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Destinations: u32 {
        const TRANS_EVENT = 0x01;
        const TRANS_TRACE = 0x02;
        const ERROR_EVENT = 0x04;
        const BROWSER_EVENT = 0x08;
        const SPAN_EVENT = 0x10;
        const TRANS_SEGMENT = 0x20;

        /// Destinations every transaction-level attribute is offered to by default.
        const TRANS_COMMON = Self::TRANS_EVENT.bits()
            | Self::TRANS_TRACE.bits()
            | Self::ERROR_EVENT.bits();
        /// Transaction-level destinations including browser monitoring.
        const TRANS_SCOPE = Self::TRANS_COMMON.bits() | Self::BROWSER_EVENT.bits();
    }
}

impl Destinations {
    /// Every single-bit destination, in bit order.
    pub fn each() -> impl Iterator<Item = Destinations> {
        Self::all().iter().filter(|d| d.bits().count_ones() == 1)
    }
}
