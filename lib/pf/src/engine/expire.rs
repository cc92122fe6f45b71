// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! State expiry.
//!
//! A state expires its class's timeout after the last packet that
//! refreshed it. Once the number of states passes the adaptive start
//! threshold, timeouts shrink linearly until they reach zero at the
//! adaptive end threshold. A rule with its own adaptive thresholds
//! counts only its own states against them.

use super::state::State;
use pf_api::Timeouts;
use pf_api::TimeoutClass;

/// Scale `timeout` for a table holding `states` entries, returning the
/// absolute expiry of a state last refreshed at `expire`.
pub fn adaptive_expiry(
    expire: u64,
    timeout: u32,
    (start, end): (u32, u32),
    states: u32,
    now: u64,
) -> u64 {
    if end != 0 && states > start && start < end {
        if states < end {
            let left = u64::from(end - states);
            let span = u64::from(end - start);
            expire + u64::from(timeout) * left / span
        } else {
            now
        }
    } else {
        expire + u64::from(timeout)
    }
}

/// The uptime at which `st` expires. `table_states` is the number of
/// live states in the table.
pub fn state_expires(
    st: &State,
    defaults: &Timeouts,
    table_states: usize,
    now: u64,
) -> u64 {
    if st.timeout == TimeoutClass::Purge {
        return now;
    }
    let Some(default) = defaults.get(st.timeout) else {
        return now;
    };
    let rt = &st.rule.timeouts;
    let timeout = rt.overrides.get(&st.timeout).copied().unwrap_or(default);
    let (thresholds, states) = match rt.adaptive {
        Some(t) => (t, st.rule.counters().states_cur()),
        None => (
            (defaults.adaptive_start, defaults.adaptive_end),
            u32::try_from(table_states).unwrap_or(u32::MAX),
        ),
    };
    adaptive_expiry(st.expire, timeout, thresholds, states, now)
}

/// How many states one purge call should visit so that a table of
/// `tracked` states is covered once every `interval` calls.
pub fn purge_budget(tracked: usize, interval: u32) -> usize {
    1 + tracked / interval.max(1) as usize
}
