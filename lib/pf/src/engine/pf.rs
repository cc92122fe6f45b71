// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet filter.
//!
//! A [`Pf`] owns the active ruleset, the state table and the source
//! node table, and runs every packet through them:
//!
//! 1. Header sanity checks that need no rules.
//! 2. A state lookup. A packet that finds its state is checked by the
//!    tracker for its protocol and translated as the state says; it
//!    never reaches the rules.
//! 3. Otherwise, translation rules pick a rewrite, the filter rules
//!    pick a verdict, and a passing rule that keeps state (or any
//!    translation) installs a new state for the connection.
//!
//! # Locking
//!
//! Locks are always taken in this order: the ruleset, the state
//! table, a single state, the source node table. The ruleset is read
//! once per packet and the `Arc` cloned out, so a reload never waits
//! for packets in flight. Overload table inserts and flushes triggered
//! while a state is locked are deferred until it has been released.

use super::eval::EvalMode;
use super::eval::eval_filter;
use super::expire::purge_budget;
use super::expire::state_expires;
use super::icmp;
use super::nat::Translation;
use super::nat::get_translation;
use super::packet::ICMP_UNREACH;
use super::packet::ICMP_UNREACH_PORT;
use super::packet::ICMP6_DST_UNREACH;
use super::packet::ICMP6_DST_UNREACH_NOPORT;
use super::packet::Packet;
use super::predicate::PredCtx;
use super::rule::Rule;
use super::ruleset::Anchor;
use super::ruleset::ConfigError;
use super::ruleset::Ruleset;
use super::src_node::LimitExceeded;
use super::src_node::SrcNodeRef;
use super::src_node::SrcNodeTable;
use super::stat::Counter;
use super::stat::PfStats;
use super::state::InsertError;
use super::state::Lifecycle;
use super::state::SK_STACK;
use super::state::SK_WIRE;
use super::state::State;
use super::state::StateFlags;
use super::state::StateKey;
use super::state::StateRef;
use super::state::StateTable;
use super::state::sidx;
use super::tcp_state;
use super::track::ConnLimit;
use super::track::ConnLimiter;
use super::track::TrackCtx;
use super::track::Verdict;
use super::track::track_icmp_query;
use super::track::track_single_multiple;
use super::track::translate;
use crate::d_error::DError;
use crate::d_error::ErrorChain;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::provider::IcmpReply;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::PacketSender;
use crate::provider::Providers;
use crate::provider::TcpReply;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use pf_api::Action;
use pf_api::Af;
use pf_api::Direction;
use pf_api::FlowEvent;
use pf_api::FlushScope;
use pf_api::KeepState;
use pf_api::KillFilter;
use pf_api::PacketLogRecord;
use pf_api::PeerState;
use pf_api::PfAddr;
use pf_api::PfCidr;
use pf_api::PfConfig;
use pf_api::PfStatsDump;
use pf_api::Protocol;
use pf_api::Reason;
use pf_api::ReturnPolicy;
use pf_api::RuleAction;
use pf_api::RuleClass;
use pf_api::RuleDump;
use pf_api::SrcNodeDump;
use pf_api::StateDump;
use pf_api::StatePolicy;
use pf_api::TcpFlags;
use pf_api::TimeoutClass;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// The longest error chain carried into a packet log record.
const LOG_CHAIN_LEN: usize = 4;

/// Why the engine, rather than a rule, decided what to do with a
/// packet.
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
pub enum EvalError {
    /// The egress queue is congested.
    Congested,
    /// A TCP header shorter than the minimum.
    BadOffset,
    /// An ICMP message with a bad checksum.
    BadChecksum,
    /// A later fragment no rule lets through.
    Fragment,
    /// IP options on a flow that does not allow them.
    IpOptions,
    /// The rule's own state limit was reached.
    MaxStates,
    /// The state table is full.
    StateTableFull,
    /// A source node could not be had for the new state.
    SrcNode(LimitExceeded),
    /// The new state collides with an existing one.
    State(InsertError),
    /// The packet does not fit the state it matched.
    BadState,
    /// The source exceeded a connection limit.
    ConnLimit,
}

impl EvalError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::Congested => Reason::Congestion,
            Self::BadOffset => Reason::BadOffset,
            Self::BadChecksum => Reason::ProtoChecksum,
            Self::Fragment => Reason::Fragment,
            Self::IpOptions => Reason::IpOptions,
            Self::MaxStates => Reason::MaxStates,
            Self::StateTableFull => Reason::OutOfMemory,
            Self::SrcNode(_) | Self::ConnLimit => Reason::SrcLimit,
            Self::State(_) => Reason::StateInsertFailed,
            Self::BadState => Reason::BadState,
        }
    }

    fn from_tracker(reason: Reason) -> Option<Self> {
        match reason {
            Reason::BadState => Some(Self::BadState),
            Reason::SrcLimit => Some(Self::ConnLimit),
            _ => None,
        }
    }
}

/// What became of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub action: Action,
    pub reason: Reason,
    /// The rule that decided the packet, directly or through the
    /// state it matched. `None` for the default rule and for packets
    /// dropped before rule evaluation.
    pub rule_nr: Option<u32>,
    /// The state the packet matched or created.
    pub state_id: Option<u64>,
}

impl Outcome {
    fn drop(reason: Reason) -> Self {
        Self { action: Action::Drop, reason, rule_nr: None, state_id: None }
    }
}

// The rules that decided a packet on the rule path.
struct Decision {
    rule: Arc<Rule>,
    anchor: Option<Arc<Rule>>,
    nat: Option<Translation>,
    // The packet as it arrived, kept when translation changed it.
    orig: Option<Packet>,
    tag: u16,
}

impl Decision {
    fn nat_rule(&self) -> Option<&Arc<Rule>> {
        self.nat.as_ref().map(|t| t.rule())
    }
}

// An overload table insert owed by a connection limit check.
struct PendingOverload {
    af: Af,
    addr: PfAddr,
    rule: Arc<Rule>,
    dir: Direction,
}

// Counts completed handshakes against the state's source node.
struct SrcLimiter<'a> {
    nodes: &'a KMutex<SrcNodeTable>,
    stats: &'a PfStats,
    now: u64,
    overload: Option<PendingOverload>,
}

impl ConnLimiter for SrcLimiter<'_> {
    fn connlimit(&mut self, st: &State) -> ConnLimit {
        let Some(sn) = st.src_node else {
            return ConnLimit::NoNode;
        };
        let mut nodes = self.nodes.lock();
        let Some(check) = nodes.connlimit(&sn, &st.rule, self.now, self.stats)
        else {
            return ConnLimit::NoNode;
        };
        if !check.is_bad() {
            return ConnLimit::Ok;
        }
        if st.rule.overload.is_some() {
            if let Some(n) = nodes.get(&sn) {
                self.overload = Some(PendingOverload {
                    af: n.af,
                    addr: n.addr,
                    rule: Arc::clone(&st.rule),
                    dir: st.direction,
                });
            }
        }
        ConnLimit::Over
    }
}

fn count_rules(
    rule: &Rule,
    anchor: Option<&Arc<Rule>>,
    nat_rule: Option<&Arc<Rule>>,
    dir: Direction,
    len: usize,
) {
    rule.counters().count_packet(dir, len);
    if let Some(a) = anchor {
        a.counters().count_packet(dir, len);
    }
    if let Some(nr) = nat_rule {
        nr.counters().count_packet(dir, len);
    }
}

fn anchor_name(anchor: Option<&Arc<Rule>>) -> Option<&str> {
    anchor.and_then(|a| a.anchor_call()).map(|c| c.anchor.name())
}

/// A stateful packet filter and translator.
pub struct Pf {
    cfg: PfConfig,
    rules: KRwLock<Arc<Ruleset>>,
    default_rule: Arc<Rule>,
    states: KRwLock<StateTable>,
    src_nodes: KMutex<SrcNodeTable>,
    stats: PfStats,
    providers: Providers,
    rng: KMutex<StdRng>,
    mode: EvalMode,
}

impl Pf {
    /// An engine with an empty ruleset: everything is dropped until a
    /// ruleset is activated.
    pub fn new(cfg: PfConfig, providers: Providers) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            cfg,
            rules: KRwLock::new(Arc::new(Ruleset::new())),
            default_rule: Arc::new(Rule::default_rule()),
            states: KRwLock::new(StateTable::new()),
            src_nodes: KMutex::new(SrcNodeTable::new()),
            stats: PfStats::new(),
            providers,
            rng: KMutex::new(rng),
            mode: EvalMode::default(),
        }
    }

    pub fn with_eval_mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &PfConfig {
        &self.cfg
    }

    /// Validate `rs` and make it the active ruleset. Packets already
    /// being evaluated finish against the old one, and existing states
    /// keep the rules that created them.
    pub fn activate(&self, rs: Ruleset) -> Result<(), ConfigError> {
        rs.validate()?;
        *self.rules.write() = Arc::new(rs);
        self.providers.log.log(LogLevel::Note, "ruleset activated");
        Ok(())
    }

    /// The active ruleset.
    pub fn ruleset(&self) -> Arc<Ruleset> {
        Arc::clone(&self.rules.read())
    }

    /// Evaluate a packet travelling in `dir` on `ifname`. Any header
    /// rewrites have been applied to `pkt` when this returns.
    pub fn evaluate(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
    ) -> Action {
        self.process(dir, ifname, pkt).action
    }

    /// Like [`Pf::evaluate`], but report the reason, rule and state
    /// behind the verdict as well.
    pub fn process(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
    ) -> Outcome {
        let now = self.providers.clock.uptime();
        let seed = self.rng.lock().random::<u64>();
        let mut rng = StdRng::seed_from_u64(seed);
        let out = self.test(dir, ifname, pkt, now, &mut rng);
        self.stats.reason(out.reason);
        out
    }

    fn test<R: Rng>(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
        now: u64,
        rng: &mut R,
    ) -> Outcome {
        if pkt.tcp().is_some_and(|t| t.off < 5) {
            return self.early_drop(EvalError::BadOffset, dir, ifname, pkt);
        }
        if pkt.icmp().is_some() && pkt.meta.bad_csum {
            return self.early_drop(EvalError::BadChecksum, dir, ifname, pkt);
        }
        if pkt.frag.is_later_fragment() {
            return self.test_fragment(dir, ifname, pkt, rng);
        }

        let key = if pkt.is_icmp_error() {
            icmp::quoted_key(pkt, dir)
        } else {
            Some(StateKey::from_packet(pkt, dir))
        };
        if let Some(key) = key {
            if let Some(out) =
                self.test_state(&key, dir, ifname, pkt, now, &mut *rng)
            {
                return out;
            }
        }
        self.test_rule(dir, ifname, pkt, now, rng)
    }

    fn early_drop(
        &self,
        err: EvalError,
        dir: Direction,
        ifname: &str,
        pkt: &Packet,
    ) -> Outcome {
        let reason = err.reason();
        let rule = &self.default_rule;
        self.log_packet(rule, None, reason, dir, ifname, pkt, Some(&err));
        Outcome::drop(reason)
    }

    // Later fragments carry no transport header, so they cannot be
    // matched to a state; the filter rules alone decide them.
    fn test_fragment<R: Rng>(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &Packet,
        rng: &mut R,
    ) -> Outcome {
        let rs = self.ruleset();
        let sockets = self.providers.sockets.as_deref();
        let mut ctx = PredCtx::new(pkt, dir, sockets, rng);
        let m = eval_filter(&rs, self.mode, ifname, &mut ctx, self.log());
        let (rule, anchor) = match m {
            Some(m) => (m.rule, m.anchor),
            None => (Arc::clone(&self.default_rule), None),
        };
        count_rules(&rule, anchor.as_ref(), None, dir, pkt.len());
        let rule_nr = self.rule_nr(&rule);
        let a = anchor_name(anchor.as_ref());
        if rule.action() == RuleAction::Pass {
            if rule.log {
                let r = Reason::Match;
                self.log_packet(&rule, a, r, dir, ifname, pkt, None);
            }
            return Outcome {
                action: Action::Pass,
                reason: Reason::Match,
                rule_nr,
                state_id: None,
            };
        }
        let err = EvalError::Fragment;
        if rule.log {
            let r = err.reason();
            self.log_packet(&rule, a, r, dir, ifname, pkt, Some(&err));
        }
        Outcome { rule_nr, ..Outcome::drop(err.reason()) }
    }

    // Run a packet against the state it belongs to. Returns `None` if
    // there is no such state, or the state gave way to a new
    // connection, and the rules must decide.
    fn test_state<R: Rng>(
        &self,
        key: &StateKey,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
        now: u64,
        rng: &mut R,
    ) -> Option<Outcome> {
        self.stats.incr(Counter::StateSearches);
        let sref = self.states.read().lookup(key, dir, ifname)?;
        let log = self.log();
        let mut limiter = SrcLimiter {
            nodes: &self.src_nodes,
            stats: &self.stats,
            now,
            overload: None,
        };

        let mut st = sref.lock();
        if !st.is_live() {
            return None;
        }
        let mut out = Outcome {
            rule_nr: self.rule_nr(&st.rule),
            state_id: Some(st.id),
            ..Outcome::drop(Reason::Match)
        };

        let verdict = if st.timeout == TimeoutClass::Purge {
            Verdict::Drop(Reason::Match)
        } else if pkt.is_icmp_error() {
            icmp::track_error(&st, pkt, dir, log)
        } else {
            match pkt.proto {
                Protocol::TCP => {
                    let mut ctx = TrackCtx {
                        dir,
                        now,
                        rng: &mut *rng,
                        sender: self.sender(),
                        log,
                        limiter: &mut limiter,
                    };
                    tcp_state::track(&mut st, pkt, &mut ctx)
                }
                Protocol::UDP => track_single_multiple(
                    &mut st,
                    dir,
                    now,
                    TimeoutClass::UdpSingle,
                    TimeoutClass::UdpMultiple,
                ),
                p if p.is_icmp() => track_icmp_query(&mut st, now),
                _ => track_single_multiple(
                    &mut st,
                    dir,
                    now,
                    TimeoutClass::OtherSingle,
                    TimeoutClass::OtherMultiple,
                ),
            }
        };

        let anchor_rule = st.anchor.clone();
        let anchor = anchor_name(anchor_rule.as_ref());
        match verdict {
            Verdict::Pass => {
                if !pkt.is_icmp_error() {
                    translate(&st, pkt, dir);
                }
                if st.tag != 0 {
                    pkt.meta.tag = st.tag;
                }
                if pkt.ip_opts && !st.flags.contains(StateFlags::ALLOW_OPTS) {
                    let err = EvalError::IpOptions;
                    out.reason = err.reason();
                    self.log_packet(
                        &st.rule,
                        anchor,
                        out.reason,
                        dir,
                        ifname,
                        pkt,
                        Some(&err),
                    );
                } else {
                    out.action = Action::Pass;
                    let len = pkt.len();
                    count_rules(
                        &st.rule,
                        anchor_rule.as_ref(),
                        st.nat_rule.as_ref(),
                        dir,
                        len,
                    );
                    st.count_packet(dir, len);
                    if st.log {
                        self.log_packet(
                            &st.rule,
                            anchor,
                            out.reason,
                            dir,
                            ifname,
                            pkt,
                            None,
                        );
                    }
                }
            }
            Verdict::Drop(reason) => {
                out.reason = reason;
                if st.log {
                    let err = EvalError::from_tracker(reason);
                    self.log_packet(
                        &st.rule,
                        anchor,
                        reason,
                        dir,
                        ifname,
                        pkt,
                        err.as_ref(),
                    );
                }
            }
            Verdict::SynproxyDrop => {
                out.action = Action::SynproxyDrop;
                out.reason = Reason::Synproxy;
            }
            Verdict::Reuse => {}
        }
        drop(st);

        if let Some(ov) = limiter.overload.take() {
            self.overload(ov);
        }
        if verdict == Verdict::Reuse {
            let mut tbl = self.states.write();
            let mut st = sref.lock();
            self.unlink(&mut tbl, &mut st, now);
            return None;
        }
        Some(out)
    }

    fn test_rule<R: Rng>(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
        now: u64,
        rng: &mut R,
    ) -> Outcome {
        if pkt.meta.congested {
            return self.early_drop(EvalError::Congested, dir, ifname, pkt);
        }
        let rs = self.ruleset();
        let log = self.log();
        let sockets = self.providers.sockets.as_deref();

        let mut tag = pkt.meta.tag;
        let nat = if pkt.is_icmp_error() {
            None
        } else {
            let states = self.states.read();
            let nodes = self.src_nodes.lock();
            let mut ctx = PredCtx::new(&*pkt, dir, sockets, &mut *rng);
            let t =
                get_translation(&rs, ifname, &mut ctx, &states, &nodes, log);
            tag = ctx.tag;
            t
        };
        let mut orig = None;
        if let Some(t) = &nat {
            orig = Some(pkt.clone());
            pkt.rewrite(t.endpoint, t.addr, t.port);
        }

        let natpass = nat.as_ref().is_some_and(|t| t.rule().natpass);
        let matched = if natpass {
            nat.as_ref().map(|t| t.matched.clone())
        } else {
            let mut ctx = PredCtx::new(&*pkt, dir, sockets, &mut *rng);
            ctx.tag = tag;
            let m = eval_filter(&rs, self.mode, ifname, &mut ctx, log);
            tag = ctx.tag;
            m
        };
        let (rule, anchor, ruleset) = match matched {
            Some(m) => (m.rule, m.anchor, m.ruleset),
            None => (Arc::clone(&self.default_rule), None, None),
        };
        let ruleset_name = ruleset.as_deref().map(Anchor::name);
        let logged = rule.log || nat.as_ref().is_some_and(|t| t.rule().log);
        let mut out = Outcome {
            rule_nr: self.rule_nr(&rule),
            ..Outcome::drop(Reason::Match)
        };

        if !natpass && rule.action() != RuleAction::Pass {
            count_rules(&rule, anchor.as_ref(), None, dir, pkt.len());
            if logged {
                self.log_packet(
                    &rule,
                    ruleset_name,
                    out.reason,
                    dir,
                    ifname,
                    pkt,
                    None,
                );
            }
            self.send_return(&rule, dir, orig.as_ref().unwrap_or(&*pkt));
            return out;
        }

        pkt.meta.tag = tag;
        let d = Decision { rule: Arc::clone(&rule), anchor, nat, orig, tag };
        let mut err = None;
        let mut sref = None;
        if !pkt.is_icmp_error() && (rule.keeps_state() || d.nat.is_some()) {
            match self.create_state(&d, dir, ifname, pkt, now, rng) {
                Ok((s, action)) => {
                    out.state_id = Some(s.lock().id);
                    out.action = action;
                    if action == Action::SynproxyDrop {
                        out.reason = Reason::Synproxy;
                    }
                    sref = Some(s);
                }
                Err(e @ EvalError::State(_)) => {
                    out.action = Action::Pass;
                    out.reason = e.reason();
                    err = Some(e);
                }
                Err(e) => {
                    out.reason = e.reason();
                    if logged {
                        self.log_packet(
                            &rule,
                            ruleset_name,
                            out.reason,
                            dir,
                            ifname,
                            pkt,
                            Some(&e),
                        );
                    }
                    return out;
                }
            }
        } else {
            out.action = Action::Pass;
        }

        let mut force_log = false;
        if out.action == Action::Pass && pkt.ip_opts && !rule.allow_opts {
            let e = EvalError::IpOptions;
            out.action = Action::Drop;
            out.reason = e.reason();
            err = Some(e);
            force_log = true;
        }

        if matches!(out.action, Action::Pass | Action::Defer) {
            let len = pkt.len();
            let nat_rule = d.nat_rule().filter(|nr| !Arc::ptr_eq(nr, &rule));
            count_rules(&rule, d.anchor.as_ref(), nat_rule, dir, len);
            if let Some(s) = &sref {
                s.lock().count_packet(dir, len);
            }
        }
        if logged || force_log {
            self.log_packet(
                &rule,
                ruleset_name,
                out.reason,
                dir,
                ifname,
                pkt,
                err.as_ref(),
            );
        }
        out
    }

    fn create_state<R: Rng>(
        &self,
        d: &Decision,
        dir: Direction,
        ifname: &str,
        pkt: &mut Packet,
        now: u64,
        rng: &mut R,
    ) -> Result<(StateRef, Action), EvalError> {
        let rule = &d.rule;
        if let Some(max) = rule.limits.max_states {
            if rule.counters().states_cur() >= max {
                self.stats.incr(Counter::LimitStates);
                return Err(EvalError::MaxStates);
            }
        }

        // The stack side sees the original packet, the wire side the
        // translated one, whichever way it travels.
        let sk = StateKey::from_packet(d.orig.as_ref().unwrap_or(&*pkt), dir);
        let nk = StateKey::from_packet(pkt, dir);
        let key = match dir {
            Direction::In => [sk, nk],
            Direction::Out => [nk, sk],
        };

        let (sn, nsn) = self.src_nodes_for(d, pkt, now)?;
        let nat_rule = d.nat_rule().filter(|nr| !Arc::ptr_eq(nr, rule));

        let mut st = State::new(key, dir, Arc::clone(rule), now);
        st.creatorid = self.cfg.hostid;
        if rule.state_policy == StatePolicy::IfBound {
            st.ifname = Some(ifname.to_string());
        }
        st.nat_rule = nat_rule.cloned();
        st.anchor = d.anchor.clone();
        st.src_node = sn;
        st.nat_src_node = nsn;
        st.tag = d.tag;
        st.log = rule.log || d.nat_rule().is_some_and(|nr| nr.log);
        if rule.allow_opts {
            st.flags |= StateFlags::ALLOW_OPTS;
        }
        if rule.sloppy {
            st.flags |= StateFlags::SLOPPY;
        }

        let (sref, live) = {
            let mut tbl = self.states.write();
            if tbl.len() >= self.cfg.limits.states as usize {
                drop(tbl);
                self.release_src_nodes(sn, nsn);
                return Err(EvalError::StateTableFull);
            }
            let (sref, superseded) = match tbl.insert(st) {
                Ok(v) => v,
                Err(e) => {
                    drop(tbl);
                    self.log().log(
                        LogLevel::Debug,
                        &format!("state insert failed: {sk}: {e}"),
                    );
                    self.release_src_nodes(sn, nsn);
                    return Err(EvalError::State(e));
                }
            };
            for old in superseded {
                let mut old = old.lock();
                self.unlink(&mut tbl, &mut old, now);
            }
            {
                let mut st = sref.lock();
                let modulate = rule.keep_state == KeepState::Modulate;
                init_peers(&mut st, pkt, modulate, &mut *rng);
            }
            (sref, tbl.len())
        };

        {
            let mut nodes = self.src_nodes.lock();
            if let Some(r) = &sn {
                nodes.attach_state(r);
            }
            if let Some(r) = nsn.as_ref().filter(|r| Some(*r) != sn.as_ref()) {
                nodes.attach_state(r);
            }
        }
        rule.counters().state_created();
        if let Some(nr) = nat_rule {
            nr.counters().state_created();
        }
        if let Some(a) = &d.anchor {
            a.counters().state_created();
        }
        self.stats.incr(Counter::StateInserts);

        let mut st = sref.lock();
        let dump = st.to_dump(self.expires(&st, live, now));
        if let Some(sync) = &self.providers.sync {
            sync.insert_state(&dump);
        }
        if let Some(export) = &self.providers.export {
            export.export(st.flow_record(FlowEvent::Create));
        }

        let syn_ack = TcpFlags::SYN | TcpFlags::ACK;
        let syn_only =
            pkt.tcp_flags().is_some_and(|f| f & syn_ack == TcpFlags::SYN);
        let action = if rule.keep_state == KeepState::Synproxy && syn_only {
            // The handshake is answered as the client addressed it.
            let client = d.orig.as_ref().unwrap_or(&*pkt);
            match tcp_state::start_synproxy(
                &mut st,
                client,
                dir,
                self.cfg.default_mss,
                rng,
                self.sender(),
            ) {
                Verdict::SynproxyDrop => Action::SynproxyDrop,
                _ => Action::Drop,
            }
        } else if self.cfg.defer_new_states
            && self.providers.sync.as_ref().is_some_and(|s| s.defer(&dump, pkt))
        {
            Action::Defer
        } else {
            Action::Pass
        };
        drop(st);
        Ok((sref, action))
    }

    fn src_nodes_for(
        &self,
        d: &Decision,
        pkt: &Packet,
        now: u64,
    ) -> Result<(Option<SrcNodeRef>, Option<SrcNodeRef>), EvalError> {
        let max = self.cfg.limits.src_nodes;
        let mut nodes = self.src_nodes.lock();
        let mut sn = None;
        if d.rule.tracks_src() {
            let r = nodes
                .insert_or_get(&d.rule, pkt.af, pkt.src, now, max, &self.stats)
                .map_err(EvalError::SrcNode)?;
            sn = Some(r);
        }

        let Some(t) = d.nat.as_ref().filter(|t| t.rule().sticky()) else {
            return Ok((sn, None));
        };
        // Sticky translations remember the untranslated source.
        let src = d.orig.as_ref().map_or(pkt.src, |o| o.src);
        match nodes.insert_or_get(t.rule(), pkt.af, src, now, max, &self.stats)
        {
            Ok(r) => {
                if let Some(n) = nodes.get_mut(&r) {
                    n.raddr = Some(t.addr);
                }
                Ok((sn, Some(r)))
            }
            Err(e) => {
                if let Some(r) = &sn {
                    nodes.release_unused(r, &self.stats);
                }
                Err(EvalError::SrcNode(e))
            }
        }
    }

    fn release_src_nodes(
        &self,
        sn: Option<SrcNodeRef>,
        nsn: Option<SrcNodeRef>,
    ) {
        let mut nodes = self.src_nodes.lock();
        for r in sn.iter().chain(nsn.iter()) {
            nodes.release_unused(r, &self.stats);
        }
    }

    // Answer a blocked packet as the rule asks. `pkt` is the packet
    // as it arrived, before any translation.
    fn send_return(&self, rule: &Rule, dir: Direction, pkt: &Packet) {
        let Some(sender) = self.sender() else {
            return;
        };
        let rp = rule.return_policy;
        let wants_rst =
            matches!(rp, ReturnPolicy::Rst { .. } | ReturnPolicy::Return);
        if let Some(t) = pkt.tcp().filter(|_| wants_rst) {
            if !t.flags.contains(TcpFlags::RST) && !pkt.meta.bad_csum {
                let mut ack = t.seq.wrapping_add(pkt.payload_len());
                if t.flags.contains(TcpFlags::SYN) {
                    ack = ack.wrapping_add(1);
                }
                if t.flags.contains(TcpFlags::FIN) {
                    ack = ack.wrapping_add(1);
                }
                sender.send_tcp(TcpReply {
                    af: pkt.af,
                    src: pkt.dst,
                    dst: pkt.src,
                    sport: t.dport,
                    dport: t.sport,
                    seq: 0,
                    ack,
                    flags: TcpFlags::RST | TcpFlags::ACK,
                    win: 0,
                    mss: None,
                    ttl: rule.return_ttl(),
                    tag: 0,
                    outbound: dir == Direction::In,
                });
                return;
            }
        }

        let code = match (rp, pkt.af) {
            (ReturnPolicy::Icmp { code4, .. }, Af::Inet) => code4,
            (ReturnPolicy::Icmp { code6, .. }, Af::Inet6) => code6,
            (ReturnPolicy::Return, Af::Inet) => ICMP_UNREACH_PORT,
            (ReturnPolicy::Return, Af::Inet6) => ICMP6_DST_UNREACH_NOPORT,
            _ => return,
        };
        if pkt.proto == pkt.af.icmp_proto() {
            return;
        }
        let ty = match pkt.af {
            Af::Inet => ICMP_UNREACH,
            Af::Inet6 => ICMP6_DST_UNREACH,
        };
        sender.send_icmp(IcmpReply {
            af: pkt.af,
            ty,
            code,
            orig: pkt.clone(),
            dir,
        });
    }

    // Put an offending source into the rule's overload table and, if
    // asked to, kill the states it already has.
    fn overload(&self, ov: PendingOverload) {
        let Some(o) = &ov.rule.overload else {
            return;
        };
        let log = self.log();
        self.stats.incr(Counter::OverloadTable);
        o.table.insert(PfCidr::host(ov.addr.to_ip(ov.af)));
        log.log(
            LogLevel::Debug,
            &format!(
                "overload: {} added to table <{}>",
                ov.addr.display(ov.af),
                o.table.name()
            ),
        );
        if o.flush == FlushScope::None {
            return;
        }

        let tbl = self.states.read();
        let mut killed = 0;
        for sref in tbl.iter() {
            let mut st = sref.lock();
            let wire = st.key[SK_WIRE];
            let same_rule = Arc::ptr_eq(&st.rule, &ov.rule);
            if st.is_live()
                && wire.af == ov.af
                && wire.addr[sidx(ov.dir)] == ov.addr
                && (o.flush == FlushScope::Global || same_rule)
            {
                st.kill();
                killed += 1;
            }
        }
        self.stats.incr(Counter::OverloadFlush);
        log.log(
            LogLevel::Debug,
            &format!("overload: {killed} states flushed"),
        );
    }

    // Take a state out of the lookup index and let go of its source
    // nodes. It is freed by the next purge that reaches it.
    fn unlink(&self, tbl: &mut StateTable, st: &mut State, now: u64) {
        if !tbl.detach(st) {
            return;
        }
        if st.src.state == PeerState::ProxyDst {
            // The server was told about the connection; tell it that
            // the connection is gone.
            let k = st.key[SK_WIRE];
            if let Some(sender) = self.sender() {
                sender.send_tcp(TcpReply {
                    af: k.af,
                    src: k.addr[1],
                    dst: k.addr[0],
                    sport: k.port[1],
                    dport: k.port[0],
                    seq: st.src.seqhi,
                    ack: st.src.seqlo.wrapping_add(1),
                    flags: TcpFlags::RST | TcpFlags::ACK,
                    win: 0,
                    mss: None,
                    ttl: st.rule.return_ttl(),
                    tag: st.tag,
                    outbound: true,
                });
            }
        }
        if st.creatorid == self.cfg.hostid {
            if let Some(sync) = &self.providers.sync {
                sync.delete_state(&st.to_dump(now));
            }
        }
        if let Some(export) = &self.providers.export {
            export.export(st.flow_record(FlowEvent::Delete));
        }

        let timeout = self.cfg.timeouts.src_node;
        let mut nodes = self.src_nodes.lock();
        let sn = st.src_node.take();
        if let Some(r) = &sn {
            let counted = st.flags.contains(StateFlags::SRC_CONN);
            nodes.detach_state(r, counted, now, timeout);
        }
        let nsn = st.nat_src_node.take();
        if let Some(r) = nsn.filter(|r| Some(r) != sn.as_ref()) {
            nodes.detach_state(&r, false, now, timeout);
        }
    }

    fn free(&self, tbl: &mut StateTable, st: &mut State) {
        if !tbl.release(st) {
            return;
        }
        st.rule.counters().state_removed();
        if let Some(nr) = &st.nat_rule {
            nr.counters().state_removed();
        }
        if let Some(a) = &st.anchor {
            a.counters().state_removed();
        }
        self.stats.incr(Counter::StateRemovals);
    }

    fn expires(&self, st: &State, live: usize, now: u64) -> u64 {
        state_expires(st, &self.cfg.timeouts, live, now)
    }

    /// Visit the next batch of states, freeing those already unlinked
    /// and unlinking and freeing those that have expired. The batch is
    /// sized so the whole table is visited once every
    /// `timeouts.interval` calls. Returns the number of states freed.
    pub fn purge(&self) -> usize {
        let now = self.providers.clock.uptime();
        let mut tbl = self.states.write();
        let budget = purge_budget(tbl.tracked(), self.cfg.timeouts.interval);
        let live = tbl.len();
        let mut freed = 0;
        for sref in tbl.purge_batch(budget) {
            let mut st = sref.lock();
            match st.lifecycle {
                Lifecycle::Unlinked => {}
                Lifecycle::Live if self.expires(&st, live, now) <= now => {
                    self.unlink(&mut tbl, &mut st, now);
                }
                _ => continue,
            }
            self.free(&mut tbl, &mut st);
            freed += 1;
        }
        freed
    }

    /// Drop source nodes that have outlived their last state.
    pub fn purge_src_nodes(&self) -> usize {
        let now = self.providers.clock.uptime();
        self.src_nodes.lock().purge(now, &self.stats)
    }

    /// Unlink every live state matching `filter`, returning how many
    /// were. Either key of a translated state may match.
    pub fn kill_states(&self, filter: &KillFilter) -> usize {
        let now = self.providers.clock.uptime();
        let mut tbl = self.states.write();
        let all: Vec<StateRef> = tbl.iter().cloned().collect();
        let mut killed = 0;
        for sref in all {
            let mut st = sref.lock();
            if !st.is_live() {
                continue;
            }
            let wire = st.key[SK_WIRE].tuple(st.direction);
            let stack = st.key[SK_STACK].tuple(st.direction);
            let rule_ok = filter.rule_nr.is_none_or(|nr| nr == st.rule.nr());
            if rule_ok
                && (filter.matches_tuple(&wire) || filter.matches_tuple(&stack))
            {
                self.unlink(&mut tbl, &mut st, now);
                killed += 1;
            }
        }
        if killed > 0 {
            self.log().log(
                LogLevel::Note,
                &format!("killed {killed} states"),
            );
        }
        killed
    }

    /// Detach every state from its source nodes and orphan the nodes,
    /// which the next source node purge removes.
    pub fn clear_src_nodes(&self) {
        {
            let tbl = self.states.read();
            for sref in tbl.iter() {
                let mut st = sref.lock();
                st.src_node = None;
                st.nat_src_node = None;
            }
        }
        self.src_nodes.lock().clear();
    }

    /// Hand a flow record for every live state to the exporter.
    pub fn export_states(&self) -> usize {
        let Some(export) = &self.providers.export else {
            return 0;
        };
        let tbl = self.states.read();
        let mut n = 0;
        for sref in tbl.iter() {
            let st = sref.lock();
            if st.is_live() {
                export.export(st.flow_record(FlowEvent::Update));
                n += 1;
            }
        }
        n
    }

    /// Count and log a packet dropped outside the engine, by
    /// normalization or reassembly.
    pub fn report_drop(&self, reason: Reason, pkt: &Packet, dir: Direction) {
        self.stats.reason(reason);
        self.log().log(
            LogLevel::Debug,
            &format!("dropped {dir} {}: {reason}", pkt.tuple()),
        );
    }

    pub fn state_count(&self) -> usize {
        self.states.read().len()
    }

    pub fn state_dump(&self) -> Vec<StateDump> {
        let now = self.providers.clock.uptime();
        let tbl = self.states.read();
        let live = tbl.len();
        tbl.iter()
            .filter_map(|sref| {
                let st = sref.lock();
                st.is_live().then(|| st.to_dump(self.expires(&st, live, now)))
            })
            .collect()
    }

    pub fn src_node_dump(&self) -> Vec<SrcNodeDump> {
        self.src_nodes.lock().dump()
    }

    pub fn rule_dump(&self, class: RuleClass) -> Vec<RuleDump> {
        let rs = self.ruleset();
        rs.list(class).rules().iter().map(|r| r.to_dump()).collect()
    }

    pub fn stats(&self) -> PfStatsDump {
        let states = self.state_count();
        let src_nodes = self.src_nodes.lock().len();
        self.stats.dump(states, src_nodes)
    }

    pub fn reason_count(&self, r: Reason) -> u64 {
        self.stats.reason_count(r)
    }

    pub fn reason_counters(&self) -> Vec<(Reason, u64)> {
        self.stats.reason_counts()
    }

    pub fn counter(&self, c: Counter) -> u64 {
        self.stats.get(c)
    }

    fn log(&self) -> &dyn LogProvider {
        &*self.providers.log
    }

    fn sender(&self) -> Option<&dyn PacketSender> {
        self.providers.sender.as_deref()
    }

    fn rule_nr(&self, rule: &Arc<Rule>) -> Option<u32> {
        (!Arc::ptr_eq(rule, &self.default_rule)).then(|| rule.nr())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_packet(
        &self,
        rule: &Rule,
        anchor: Option<&str>,
        reason: Reason,
        dir: Direction,
        ifname: &str,
        pkt: &Packet,
        err: Option<&EvalError>,
    ) {
        let Some(pkt_log) = &self.providers.pkt_log else {
            return;
        };
        let error = match err {
            Some(e) => ErrorChain::<LOG_CHAIN_LEN>::from_err(e)
                .unwrap_or_else(|partial| partial)
                .names()
                .to_vec(),
            None => Vec::new(),
        };
        pkt_log.log_packet(&PacketLogRecord {
            rule_nr: rule.nr(),
            anchor: anchor.map(ToString::to_string),
            action: rule.action(),
            reason,
            dir,
            af: pkt.af,
            ifname: ifname.to_string(),
            hdr: pkt.snapshot(),
            error,
        });
    }
}

fn init_peers<R: Rng>(
    st: &mut State,
    pkt: &mut Packet,
    modulate: bool,
    rng: &mut R,
) {
    match pkt.proto {
        Protocol::TCP => tcp_state::init_state(st, pkt, modulate, rng),
        Protocol::UDP => {
            st.src.state = PeerState::Single;
            st.dst.state = PeerState::NoTraffic;
            st.timeout = TimeoutClass::UdpFirstPacket;
        }
        p if p.is_icmp() => st.timeout = TimeoutClass::IcmpFirstPacket,
        _ => {
            st.src.state = PeerState::Single;
            st.dst.state = PeerState::NoTraffic;
            st.timeout = TimeoutClass::OtherFirstPacket;
        }
    }
}
