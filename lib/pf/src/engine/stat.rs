// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine-wide counters.

use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use pf_api::PfStatsDump;
use pf_api::Reason;

/// The limit and table counters, named as they are reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Counter {
    StateSearches,
    StateInserts,
    StateRemovals,
    SrcNodeSearches,
    SrcNodeInserts,
    SrcNodeRemovals,
    LimitStates,
    LimitSrcStates,
    LimitSrcNodes,
    LimitSrcConn,
    LimitSrcConnRate,
    OverloadTable,
    OverloadFlush,
}

impl Counter {
    const COUNT: usize = 13;
}

#[derive(Debug, Default)]
pub struct PfStats {
    reasons: [AtomicU64; Reason::COUNT],
    counters: [AtomicU64; Counter::COUNT],
}

impl PfStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason(&self, r: Reason) {
        self.reasons[r.idx()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr(&self, c: Counter) {
        self.add(c, 1);
    }

    pub fn add(&self, c: Counter, n: u64) {
        self.counters[c as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.counters[c as usize].load(Ordering::Relaxed)
    }

    pub fn reason_count(&self, r: Reason) -> u64 {
        self.reasons[r.idx()].load(Ordering::Relaxed)
    }

    pub fn reason_counts(&self) -> Vec<(Reason, u64)> {
        Reason::ALL.iter().map(|&r| (r, self.reason_count(r))).collect()
    }

    pub fn dump(&self, states: usize, src_nodes: usize) -> PfStatsDump {
        use Counter::*;

        PfStatsDump {
            reasons: self.reason_counts(),
            states: states as u64,
            src_nodes: src_nodes as u64,
            state_searches: self.get(StateSearches),
            state_inserts: self.get(StateInserts),
            state_removals: self.get(StateRemovals),
            src_node_searches: self.get(SrcNodeSearches),
            src_node_inserts: self.get(SrcNodeInserts),
            src_node_removals: self.get(SrcNodeRemovals),
            limit_states: self.get(LimitStates),
            limit_src_states: self.get(LimitSrcStates),
            limit_src_nodes: self.get(LimitSrcNodes),
            limit_src_conn: self.get(LimitSrcConn),
            limit_src_conn_rate: self.get(LimitSrcConnRate),
            overload_table: self.get(OverloadTable),
            overload_flush: self.get(OverloadFlush),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dump_reports_every_reason() {
        let s = PfStats::new();
        s.reason(Reason::Match);
        s.reason(Reason::Match);
        s.reason(Reason::SrcLimit);
        s.incr(Counter::OverloadFlush);
        s.incr(Counter::StateInserts);

        let d = s.dump(3, 1);
        assert_eq!(d.reasons.len(), Reason::COUNT);
        assert!(d.reasons.contains(&(Reason::Match, 2)));
        assert!(d.reasons.contains(&(Reason::SrcLimit, 1)));
        assert_eq!(d.overload_flush, 1);
        assert_eq!(d.state_inserts, 1);
        assert_eq!((d.states, d.src_nodes), (3, 1));
    }
}
