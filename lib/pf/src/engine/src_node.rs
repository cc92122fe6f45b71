// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Source nodes.
//!
//! A source node aggregates the states created for one source
//! address, either across all rules or per rule. It carries the
//! counts the per-source limits are enforced against, and the sticky
//! translation address handed to that source.

use super::rule::Rule;
use super::stat::Counter;
use super::stat::PfStats;
use crate::d_error::DError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::Ordering;
use pf_api::Af;
use pf_api::PfAddr;
use pf_api::RateLimit;
use pf_api::SrcNodeDump;
use pf_api::SrcTrack;

/// The fixed-point scale of a [`Threshold`] count.
pub const THRESHOLD_MULT: u64 = 1000;

/// A decaying event counter: "at most `limit` events in `seconds`".
///
/// The count decays linearly with time since the last update rather
/// than being tracked in a window, so the check is approximate but
/// needs no history.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Threshold {
    limit: u64,
    seconds: u64,
    count: u64,
    last: u64,
}

impl Threshold {
    pub fn new(rate: Option<RateLimit>, now: u64) -> Self {
        let (limit, seconds) = match rate {
            Some(r) => (u64::from(r.limit), u64::from(r.seconds)),
            None => (0, 0),
        };
        Self { limit: limit * THRESHOLD_MULT, seconds, count: 0, last: now }
    }

    fn decayed(&self, now: u64) -> u64 {
        let diff = now.saturating_sub(self.last);
        if diff >= self.seconds {
            0
        } else {
            self.count - self.count * diff / self.seconds
        }
    }

    /// Record one event at `now`.
    pub fn add(&mut self, now: u64) {
        self.count = self.decayed(now) + THRESHOLD_MULT;
        self.last = now;
    }

    pub fn exceeded(&self) -> bool {
        self.limit != 0 && self.count > self.limit
    }

    /// Would one more event at `now` exceed the limit?
    pub fn would_exceed(&self, now: u64) -> bool {
        self.limit != 0 && self.decayed(now) + THRESHOLD_MULT > self.limit
    }

    /// The current count in whole events.
    pub fn count(&self) -> u32 {
        (self.count / THRESHOLD_MULT) as u32
    }
}

/// The identity of a source node: per source address, and per rule
/// when the rule tracks its sources separately.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SrcNodeKey {
    pub af: Af,
    pub addr: PfAddr,
    // The address of the owning rule; a rule is pinned by the nodes
    // that reference it, so the address cannot be reused while a node
    // holds it.
    rule: Option<usize>,
}

impl SrcNodeKey {
    pub fn new(rule: &Arc<Rule>, af: Af, addr: PfAddr) -> Self {
        let per_rule = rule.src_track == SrcTrack::Rule || rule.sticky();
        let rule = per_rule.then(|| Arc::as_ptr(rule) as usize);
        Self { af, addr, rule }
    }
}

/// A handle on a source node held by a state. The generation guards
/// against the node having been cleared and recreated since.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SrcNodeRef {
    key: SrcNodeKey,
    generation: u64,
}

#[derive(Debug)]
pub struct SrcNode {
    pub(crate) af: Af,
    pub(crate) addr: PfAddr,
    /// The rule whose limits the node is counted against.
    pub(crate) rule: Arc<Rule>,
    per_rule: bool,
    /// The translation address handed to this source.
    pub(crate) raddr: Option<PfAddr>,
    pub(crate) states: u32,
    pub(crate) conn: u32,
    pub(crate) conn_rate: Threshold,
    pub(crate) creation: u64,
    /// When an unused node may be dropped; zero while in use.
    pub(crate) expire: u64,
    generation: u64,
}

impl SrcNode {
    pub fn to_dump(&self) -> SrcNodeDump {
        SrcNodeDump {
            af: self.af,
            addr: self.addr,
            raddr: self.raddr,
            rule_nr: self.per_rule.then(|| self.rule.nr()),
            states: self.states,
            conn: self.conn,
            conn_rate: self.conn_rate.count(),
            creation: self.creation,
            expire: self.expire,
        }
    }
}

/// Why a source node could not be created or used.
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq, thiserror::Error)]
pub enum LimitExceeded {
    #[error("rule has {max} source nodes")]
    SrcNodes { max: u32 },

    #[error("source has {max} states")]
    SrcStates { max: u32 },

    #[error("source node table is full ({max})")]
    Global { max: u32 },

    #[error("source connection rate exceeded")]
    ConnRate,
}

impl Display for SrcNodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let addr = self.key.addr.display(self.key.af);
        write!(f, "{addr}#{}", self.generation)
    }
}

/// The outcome of counting a completed handshake against a source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnCheck {
    pub over_conn: bool,
    pub over_rate: bool,
}

impl ConnCheck {
    pub fn is_bad(&self) -> bool {
        self.over_conn || self.over_rate
    }
}

#[derive(Debug, Default)]
pub struct SrcNodeTable {
    nodes: BTreeMap<SrcNodeKey, SrcNode>,
    next_generation: u64,
}

impl SrcNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Find or create the node for a new state of `rule` from `addr`,
    /// enforcing the rule's per-source limits and the table limit
    /// `max_nodes`.
    pub fn insert_or_get(
        &mut self,
        rule: &Arc<Rule>,
        af: Af,
        addr: PfAddr,
        now: u64,
        max_nodes: u32,
        stats: &PfStats,
    ) -> Result<SrcNodeRef, LimitExceeded> {
        let key = SrcNodeKey::new(rule, af, addr);
        stats.incr(Counter::SrcNodeSearches);

        if let Some(node) = self.nodes.get(&key) {
            if let Some(max) = rule.limits.max_src_states {
                if node.states >= max {
                    stats.incr(Counter::LimitSrcStates);
                    return Err(LimitExceeded::SrcStates { max });
                }
            }
            if node.conn_rate.would_exceed(now) {
                stats.incr(Counter::LimitSrcConnRate);
                return Err(LimitExceeded::ConnRate);
            }
            return Ok(SrcNodeRef { key, generation: node.generation });
        }

        if let Some(max) = rule.limits.max_src_nodes {
            if rule.counters().src_nodes() >= max {
                stats.incr(Counter::LimitSrcNodes);
                return Err(LimitExceeded::SrcNodes { max });
            }
        }
        if self.nodes.len() >= max_nodes as usize {
            stats.incr(Counter::LimitSrcNodes);
            return Err(LimitExceeded::Global { max: max_nodes });
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let node = SrcNode {
            af,
            addr,
            rule: Arc::clone(rule),
            per_rule: key.rule.is_some(),
            raddr: None,
            states: 0,
            conn: 0,
            conn_rate: Threshold::new(rule.limits.max_src_conn_rate, now),
            creation: now,
            expire: 0,
            generation,
        };
        rule.counters().src_nodes.fetch_add(1, Ordering::Relaxed);
        stats.incr(Counter::SrcNodeInserts);
        self.nodes.insert(key, node);
        Ok(SrcNodeRef { key, generation })
    }

    pub fn get(&self, r: &SrcNodeRef) -> Option<&SrcNode> {
        self.nodes.get(&r.key).filter(|n| n.generation == r.generation)
    }

    pub fn get_mut(&mut self, r: &SrcNodeRef) -> Option<&mut SrcNode> {
        self.nodes.get_mut(&r.key).filter(|n| n.generation == r.generation)
    }

    /// The sticky address previously handed to `addr` by `rule`.
    pub fn sticky_addr(
        &self,
        rule: &Arc<Rule>,
        af: Af,
        addr: PfAddr,
    ) -> Option<PfAddr> {
        self.nodes.get(&SrcNodeKey::new(rule, af, addr))?.raddr
    }

    /// A state now references the node.
    pub fn attach_state(&mut self, r: &SrcNodeRef) {
        if let Some(n) = self.get_mut(r) {
            n.states += 1;
            n.expire = 0;
        }
    }

    /// A state referencing the node went away. Once the last state is
    /// gone the node lingers for `timeout` seconds.
    pub fn detach_state(
        &mut self,
        r: &SrcNodeRef,
        counted_conn: bool,
        now: u64,
        timeout: u32,
    ) {
        if let Some(n) = self.get_mut(r) {
            if counted_conn {
                n.conn = n.conn.saturating_sub(1);
            }
            n.states = n.states.saturating_sub(1);
            if n.states == 0 {
                n.expire = (now + u64::from(timeout)).max(1);
            }
        }
    }

    /// Drop a node created for a state that never made it into the
    /// table.
    pub fn release_unused(&mut self, r: &SrcNodeRef, stats: &PfStats) {
        let unused =
            self.get(r).is_some_and(|n| n.states == 0 && n.expire == 0);
        if unused {
            self.remove(&r.key, stats);
        }
    }

    /// Count a completed TCP handshake from this source, checking the
    /// rule's connection limits.
    pub fn connlimit(
        &mut self,
        r: &SrcNodeRef,
        rule: &Rule,
        now: u64,
        stats: &PfStats,
    ) -> Option<ConnCheck> {
        let n = self.get_mut(r)?;
        n.conn += 1;
        n.conn_rate.add(now);

        let over_conn = rule.limits.max_src_conn.is_some_and(|m| m < n.conn);
        if over_conn {
            stats.incr(Counter::LimitSrcConn);
        }
        let over_rate = n.conn_rate.exceeded();
        if over_rate {
            stats.incr(Counter::LimitSrcConnRate);
        }
        Some(ConnCheck { over_conn, over_rate })
    }

    /// Remove nodes without states whose linger time has passed. A node
    /// that never had a state attached is still being set up by its
    /// creator and is left alone.
    pub fn purge(&mut self, now: u64, stats: &PfStats) -> usize {
        let expired: Vec<SrcNodeKey> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.states == 0 && n.expire != 0 && n.expire <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.remove(key, stats);
        }
        expired.len()
    }

    /// Orphan every node: they are dropped by the next purge, and the
    /// handles states hold on them go stale.
    pub fn clear(&mut self) {
        for n in self.nodes.values_mut() {
            n.states = 0;
            n.expire = 1;
            n.generation = 0;
        }
    }

    fn remove(&mut self, key: &SrcNodeKey, stats: &PfStats) {
        if let Some(n) = self.nodes.remove(key) {
            n.rule.counters().src_nodes.fetch_sub(1, Ordering::Relaxed);
            stats.incr(Counter::SrcNodeRemovals);
        }
    }

    pub fn dump(&self) -> Vec<SrcNodeDump> {
        self.nodes.values().map(|n| n.to_dump()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::net::Ipv4Addr;

    fn v4(s: &str) -> PfAddr {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    #[test]
    fn threshold_decays_linearly() {
        let rate = RateLimit { limit: 2, seconds: 10 };
        let mut t = Threshold::new(Some(rate), 100);
        t.add(100);
        t.add(100);
        assert!(!t.exceeded());
        assert!(t.would_exceed(100));
        // Half the window later half the count has decayed.
        assert!(!t.would_exceed(105));
        t.add(105);
        assert_eq!(t.count(), 2);
        assert!(!t.exceeded());
        t.add(105);
        assert!(t.exceeded());
        // A full window clears it.
        assert!(!t.would_exceed(116));
    }

    #[test]
    fn unlimited_threshold_never_trips() {
        let mut t = Threshold::new(None, 0);
        for _ in 0..100 {
            t.add(0);
        }
        assert!(!t.exceeded());
    }

    #[test]
    fn per_rule_and_global_keys() {
        let global = Arc::new(Rule::pass().src_track(SrcTrack::Global));
        let per_rule = Arc::new(Rule::pass().src_track(SrcTrack::Rule));
        let a = v4("10.0.0.5");
        assert_eq!(
            SrcNodeKey::new(&global, Af::Inet, a),
            SrcNodeKey::new(&Arc::new(Rule::pass()), Af::Inet, a)
        );
        assert_ne!(
            SrcNodeKey::new(&per_rule, Af::Inet, a),
            SrcNodeKey::new(&global, Af::Inet, a)
        );
    }

    #[test]
    fn src_state_limit() {
        let stats = PfStats::new();
        let rule = Arc::new(Rule::pass().max_src_states(1));
        let mut tbl = SrcNodeTable::new();
        let a = v4("10.0.0.5");

        let r = tbl.insert_or_get(&rule, Af::Inet, a, 0, 100, &stats).unwrap();
        tbl.attach_state(&r);
        assert_eq!(
            tbl.insert_or_get(&rule, Af::Inet, a, 0, 100, &stats),
            Err(LimitExceeded::SrcStates { max: 1 })
        );
        assert_eq!(stats.get(Counter::LimitSrcStates), 1);
        assert_eq!(rule.counters().src_nodes(), 1);

        tbl.detach_state(&r, false, 50, 10);
        assert_eq!(tbl.get(&r).unwrap().expire, 60);
        assert_eq!(tbl.purge(59, &stats), 0);
        assert_eq!(tbl.purge(60, &stats), 1);
        assert_eq!(rule.counters().src_nodes(), 0);
        assert!(tbl.get(&r).is_none());
    }

    #[test]
    fn global_limit_and_unused_release() {
        let stats = PfStats::new();
        let rule = Arc::new(Rule::pass().src_track(SrcTrack::Global));
        let mut tbl = SrcNodeTable::new();
        let r = tbl
            .insert_or_get(&rule, Af::Inet, v4("10.0.0.5"), 0, 1, &stats)
            .unwrap();
        assert_eq!(
            tbl.insert_or_get(&rule, Af::Inet, v4("10.0.0.6"), 0, 1, &stats),
            Err(LimitExceeded::Global { max: 1 })
        );
        tbl.release_unused(&r, &stats);
        assert_eq!(tbl.len(), 0);
    }

    #[test]
    fn cleared_handles_go_stale() {
        let stats = PfStats::new();
        let rule = Arc::new(Rule::pass().src_track(SrcTrack::Global));
        let mut tbl = SrcNodeTable::new();
        let a = v4("10.0.0.5");
        let r = tbl.insert_or_get(&rule, Af::Inet, a, 0, 10, &stats).unwrap();
        tbl.attach_state(&r);
        tbl.clear();
        assert!(tbl.get(&r).is_none());
        assert_eq!(tbl.purge(1, &stats), 1);
    }

    #[test]
    fn connection_limits() {
        let stats = PfStats::new();
        let rule = Arc::new(Rule::pass().max_src_conn(1));
        let mut tbl = SrcNodeTable::new();
        let a = v4("10.0.0.5");
        let r = tbl.insert_or_get(&rule, Af::Inet, a, 0, 10, &stats).unwrap();
        assert!(!tbl.connlimit(&r, &rule, 0, &stats).unwrap().is_bad());
        let c = tbl.connlimit(&r, &rule, 0, &stats).unwrap();
        assert!(c.over_conn && !c.over_rate);
        assert_eq!(stats.get(Counter::LimitSrcConn), 1);
    }
}
