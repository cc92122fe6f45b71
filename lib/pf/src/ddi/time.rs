// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and engine uptime.
//!
//! State timestamps are whole seconds of engine uptime, the same
//! granularity the timeout table is configured in.

use std::time::Duration;
use std::time::Instant;

/// A moment in time, used to anchor uptime.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Moment {
    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }

    /// The time elapsed since `self`.
    pub fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }
}

/// A source of engine uptime.
pub trait Clock: Send + Sync {
    /// Whole seconds since the engine was started.
    fn uptime(&self) -> u64;
}

/// Uptime measured from the host's monotonic clock.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    boot: Moment,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { boot: Moment::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime(&self) -> u64 {
        self.boot.elapsed().as_secs()
    }
}
