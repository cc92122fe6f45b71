// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rules.
//!
//! A [`Rule`] is built once by configuration, frozen into a
//! [`super::ruleset::Ruleset`] and shared from then on behind an
//! `Arc`: by the active ruleset, and by every state and source node
//! it spawned. The only parts of a rule that change after activation
//! are its counters, which are atomics, and the cursor of its
//! translation pool.

use super::nat::Pool;
use super::predicate::Predicate;
use super::predicate::RuleAddr;
use super::ruleset::Anchor;
use super::table::AddrTable;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use pf_api::Af;
use pf_api::Direction;
use pf_api::FlushScope;
use pf_api::KeepState;
use pf_api::Protocol;
use pf_api::RateLimit;
use pf_api::ReturnPolicy;
use pf_api::RuleAction;
use pf_api::RuleDump;
use pf_api::SrcTrack;
use pf_api::StatePolicy;
use pf_api::TimeoutClass;

/// The number reported for the default rule.
pub const DEFAULT_RULE_NR: u32 = u32::MAX;

/// The counters kept for each rule.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pub evaluations: AtomicU64,
    pub packets: [AtomicU64; 2],
    pub bytes: [AtomicU64; 2],
    pub states_cur: AtomicU32,
    pub states_tot: AtomicU64,
    pub src_nodes: AtomicU32,
}

impl RuleCounters {
    pub fn count_packet(&self, dir: Direction, len: usize) {
        let i = dir.idx();
        self.packets[i].fetch_add(1, Ordering::Relaxed);
        self.bytes[i].fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn state_created(&self) {
        self.states_cur.fetch_add(1, Ordering::Relaxed);
        self.states_tot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_removed(&self) {
        self.states_cur.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn states_cur(&self) -> u32 {
        self.states_cur.load(Ordering::Relaxed)
    }

    pub fn src_nodes(&self) -> u32 {
        self.src_nodes.load(Ordering::Relaxed)
    }
}

/// Per-rule limits on states and source nodes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RuleLimits {
    pub max_states: Option<u32>,
    pub max_src_nodes: Option<u32>,
    pub max_src_states: Option<u32>,
    pub max_src_conn: Option<u32>,
    pub max_src_conn_rate: Option<RateLimit>,
}

impl RuleLimits {
    /// Does a state created by this rule need a source node to
    /// enforce its limits?
    pub fn needs_src_node(&self) -> bool {
        self.max_src_nodes.is_some()
            || self.max_src_states.is_some()
            || self.max_src_conn.is_some()
            || self.max_src_conn_rate.is_some()
    }
}

/// Timeout overrides for states created by a rule.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RuleTimeouts {
    pub overrides: BTreeMap<TimeoutClass, u32>,
    /// Adaptive (start, end) thresholds, counted against this rule's
    /// states instead of the whole table.
    pub adaptive: Option<(u32, u32)>,
}

/// A call into a nested ruleset.
#[derive(Debug)]
pub struct AnchorCall {
    pub anchor: Arc<Anchor>,
    /// Visit every child of `anchor` in name order rather than the
    /// anchor's own ruleset.
    pub wildcard: bool,
}

/// Where the source addresses an overloading host are put.
#[derive(Debug)]
pub struct Overload {
    pub table: Arc<AddrTable>,
    pub flush: FlushScope,
}

#[derive(Debug)]
pub struct Rule {
    pub(crate) nr: u32,
    pub(crate) action: RuleAction,
    pub(crate) quick: bool,
    pub(crate) log: bool,
    pub(crate) ifname: Option<String>,
    pub(crate) ifnot: bool,
    pub(crate) direction: Option<Direction>,
    pub(crate) af: Option<Af>,
    pub(crate) proto: Option<Protocol>,
    pub(crate) src: RuleAddr,
    pub(crate) dst: RuleAddr,
    pub(crate) preds: Vec<Predicate>,
    pub(crate) tag: Option<u16>,
    pub(crate) keep_state: KeepState,
    pub(crate) state_policy: StatePolicy,
    pub(crate) sloppy: bool,
    pub(crate) allow_opts: bool,
    pub(crate) natpass: bool,
    pub(crate) return_policy: ReturnPolicy,
    pub(crate) limits: RuleLimits,
    pub(crate) src_track: SrcTrack,
    pub(crate) overload: Option<Overload>,
    pub(crate) timeouts: RuleTimeouts,
    pub(crate) pool: Option<Pool>,
    pub(crate) anchor: Option<AnchorCall>,
    counters: RuleCounters,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            nr: 0,
            action,
            quick: false,
            log: false,
            ifname: None,
            ifnot: false,
            direction: None,
            af: None,
            proto: None,
            src: RuleAddr::any(),
            dst: RuleAddr::any(),
            preds: Vec::new(),
            tag: None,
            keep_state: KeepState::None,
            state_policy: StatePolicy::Floating,
            sloppy: false,
            allow_opts: false,
            natpass: false,
            return_policy: ReturnPolicy::Silent,
            limits: RuleLimits::default(),
            src_track: SrcTrack::None,
            overload: None,
            timeouts: RuleTimeouts::default(),
            pool: None,
            anchor: None,
            counters: RuleCounters::default(),
        }
    }

    pub fn pass() -> Self {
        Self::new(RuleAction::Pass)
    }

    pub fn block() -> Self {
        Self::new(RuleAction::Drop)
    }

    /// A rule descending into `anchor`.
    pub fn anchor(anchor: Arc<Anchor>) -> Self {
        let mut rule = Self::new(RuleAction::Pass);
        rule.anchor = Some(AnchorCall { anchor, wildcard: false });
        rule
    }

    /// A rule visiting every child of `anchor`.
    pub fn anchor_wildcard(anchor: Arc<Anchor>) -> Self {
        let mut rule = Self::new(RuleAction::Pass);
        rule.anchor = Some(AnchorCall { anchor, wildcard: true });
        rule
    }

    /// The rule taken when nothing else matches. It is numbered
    /// [`DEFAULT_RULE_NR`] so it can be told apart in logs.
    pub(crate) fn default_rule() -> Self {
        let mut rule = Self::new(RuleAction::Drop);
        rule.nr = DEFAULT_RULE_NR;
        rule
    }

    pub fn quick(mut self) -> Self {
        self.quick = true;
        self
    }

    pub fn log(mut self) -> Self {
        self.log = true;
        self
    }

    pub fn on(mut self, ifname: &str) -> Self {
        self.ifname = Some(ifname.to_string());
        self.ifnot = false;
        self
    }

    pub fn not_on(mut self, ifname: &str) -> Self {
        self.ifname = Some(ifname.to_string());
        self.ifnot = true;
        self
    }

    pub fn dir(mut self, dir: Direction) -> Self {
        self.direction = Some(dir);
        self
    }

    pub fn af(mut self, af: Af) -> Self {
        self.af = Some(af);
        self
    }

    pub fn proto(mut self, proto: Protocol) -> Self {
        self.proto = Some(proto);
        self
    }

    pub fn from(mut self, src: RuleAddr) -> Self {
        self.src = src;
        self
    }

    pub fn to(mut self, dst: RuleAddr) -> Self {
        self.dst = dst;
        self
    }

    pub fn pred(mut self, pred: Predicate) -> Self {
        self.preds.push(pred);
        self
    }

    pub fn tag(mut self, tag: u16) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn keep_state(mut self, ks: KeepState) -> Self {
        self.keep_state = ks;
        self
    }

    pub fn if_bound(mut self) -> Self {
        self.state_policy = StatePolicy::IfBound;
        self
    }

    pub fn sloppy(mut self) -> Self {
        self.sloppy = true;
        self
    }

    pub fn allow_opts(mut self) -> Self {
        self.allow_opts = true;
        self
    }

    pub fn natpass(mut self) -> Self {
        self.natpass = true;
        self
    }

    pub fn return_policy(mut self, rp: ReturnPolicy) -> Self {
        self.return_policy = rp;
        self
    }

    pub fn max_states(mut self, max: u32) -> Self {
        self.limits.max_states = Some(max);
        self
    }

    pub fn max_src_nodes(mut self, max: u32) -> Self {
        self.limits.max_src_nodes = Some(max);
        self
    }

    pub fn max_src_states(mut self, max: u32) -> Self {
        self.limits.max_src_states = Some(max);
        self
    }

    pub fn max_src_conn(mut self, max: u32) -> Self {
        self.limits.max_src_conn = Some(max);
        self
    }

    pub fn max_src_conn_rate(mut self, limit: u32, seconds: u32) -> Self {
        self.limits.max_src_conn_rate = Some(RateLimit { limit, seconds });
        self
    }

    pub fn src_track(mut self, st: SrcTrack) -> Self {
        self.src_track = st;
        self
    }

    pub fn overload(
        mut self,
        table: Arc<AddrTable>,
        flush: FlushScope,
    ) -> Self {
        self.overload = Some(Overload { table, flush });
        self
    }

    pub fn timeout(mut self, class: TimeoutClass, secs: u32) -> Self {
        self.timeouts.overrides.insert(class, secs);
        self
    }

    pub fn adaptive(mut self, start: u32, end: u32) -> Self {
        self.timeouts.adaptive = Some((start, end));
        self
    }

    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn nr(&self) -> u32 {
        self.nr
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    pub fn is_quick(&self) -> bool {
        self.quick
    }

    pub fn keeps_state(&self) -> bool {
        self.keep_state != KeepState::None
    }

    pub fn counters(&self) -> &RuleCounters {
        &self.counters
    }

    pub fn anchor_call(&self) -> Option<&AnchorCall> {
        self.anchor.as_ref()
    }

    /// Does this rule want a source node for states it creates?
    pub(crate) fn tracks_src(&self) -> bool {
        self.src_track != SrcTrack::None || self.limits.needs_src_node()
    }

    /// Does this rule want sticky translation addresses?
    /// The TTL for resets sent on this rule's behalf; zero means the
    /// sender's default.
    pub(crate) fn return_ttl(&self) -> u8 {
        match self.return_policy {
            ReturnPolicy::Rst { ttl } => ttl,
            _ => 0,
        }
    }

    pub(crate) fn sticky(&self) -> bool {
        self.pool.as_ref().is_some_and(|p| p.sticky)
    }

    pub(crate) fn matches_ifname(&self, ifname: &str) -> bool {
        match &self.ifname {
            None => true,
            Some(name) => (name == ifname) != self.ifnot,
        }
    }

    pub fn to_dump(&self) -> RuleDump {
        let c = &self.counters;
        RuleDump {
            nr: self.nr,
            action: self.action,
            desc: self.to_string(),
            evaluations: c.evaluations.load(Ordering::Relaxed),
            packets: [
                c.packets[0].load(Ordering::Relaxed),
                c.packets[1].load(Ordering::Relaxed),
            ],
            bytes: [
                c.bytes[0].load(Ordering::Relaxed),
                c.bytes[1].load(Ordering::Relaxed),
            ],
            states_cur: c.states_cur(),
            states_tot: c.states_tot.load(Ordering::Relaxed),
            src_nodes: c.src_nodes(),
        }
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.anchor {
            Some(call) => {
                let star = if call.wildcard { "/*" } else { "" };
                write!(f, "anchor \"{}{star}\"", call.anchor.name())?;
            }
            None => write!(f, "{}", self.action)?,
        }
        match self.direction {
            Some(Direction::In) => write!(f, " in")?,
            Some(Direction::Out) => write!(f, " out")?,
            None => {}
        }
        if self.log {
            write!(f, " log")?;
        }
        if self.quick {
            write!(f, " quick")?;
        }
        if let Some(ifname) = &self.ifname {
            let not = if self.ifnot { "! " } else { "" };
            write!(f, " on {not}{ifname}")?;
        }
        if let Some(af) = self.af {
            write!(f, " {af}")?;
        }
        if let Some(proto) = self.proto {
            write!(f, " proto {}", proto.to_string().to_lowercase())?;
        }
        write!(f, " from {} to {}", self.src, self.dst)?;
        for pred in &self.preds {
            write!(f, " {pred}")?;
        }
        if let Some(tag) = self.tag {
            write!(f, " tag {tag}")?;
        }
        match self.keep_state {
            KeepState::None => {}
            KeepState::Keep => write!(f, " keep state")?,
            KeepState::Modulate => write!(f, " modulate state")?,
            KeepState::Synproxy => write!(f, " synproxy state")?,
        }
        if let Some(pool) = &self.pool {
            write!(f, " -> {pool}")?;
        }
        Ok(())
    }
}
