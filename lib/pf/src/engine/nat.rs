// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address translation: pools and the NAT/BINAT/RDR lookup.
//!
//! A translation rule names a [`Pool`] of replacement addresses and,
//! for NAT and RDR, a range of replacement ports. Outbound packets are
//! checked against the BINAT rules and then the NAT rules; inbound
//! packets against the RDR rules and then the BINAT rules. The first
//! matching rule decides. A matching `no nat`/`no rdr`/`no binat` rule
//! means the packet is not translated at all.
//!
//! NAT chooses a source port whose translated wire key is not already
//! held by a state, so that replies can always be told apart.

use super::eval::Cursor;
use super::eval::EvalMatch;
use super::eval::check_preds;
use super::packet::Endpoint;
use super::packet::Packet;
use super::predicate::AddrMatch;
use super::predicate::PredCtx;
use super::rule::Rule;
use super::ruleset::Ruleset;
use super::src_node::SrcNodeTable;
use super::state::StateKey;
use super::state::StateTable;
use super::table::AddrTable;
use crate::ddi::sync::KMutex;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::Ordering;
use pf_api::Af;
use pf_api::Direction;
use pf_api::PfAddr;
use pf_api::PfCidr;
use pf_api::PoolType;
use pf_api::Protocol;
use pf_api::RuleAction;
use pf_api::RuleClass;
use rand::Rng;

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("no usable pool address")]
    NoAddress,

    #[error("no free port in {lo}-{hi}")]
    Exhausted { lo: u16, hi: u16 },
}

/// One entry of a translation pool.
#[derive(Clone, Debug)]
pub enum PoolAddr {
    Cidr(PfCidr),
    /// Only usable by round-robin pools.
    Table(Arc<AddrTable>),
}

impl From<PfCidr> for PoolAddr {
    fn from(cidr: PfCidr) -> Self {
        Self::Cidr(cidr)
    }
}

impl From<Arc<AddrTable>> for PoolAddr {
    fn from(tbl: Arc<AddrTable>) -> Self {
        Self::Table(tbl)
    }
}

impl Display for PoolAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cidr(cidr) => write!(f, "{cidr}"),
            Self::Table(tbl) => write!(f, "<{}>", tbl.name()),
        }
    }
}

// Where a pool is in its walk: the current entry, the table entry
// inside it and the next address to hand out.
#[derive(Debug, Default)]
struct PoolCursor {
    cur: usize,
    tblidx: Option<usize>,
    counter: PfAddr,
}

/// The replacement addresses and ports of a translation rule.
#[derive(Debug)]
pub struct Pool {
    pub(crate) addrs: Vec<PoolAddr>,
    pub(crate) ty: PoolType,
    pub(crate) sticky: bool,
    pub(crate) proxy_port: (u16, u16),
    key: [u32; 4],
    cursor: KMutex<PoolCursor>,
}

impl Pool {
    pub fn new(ty: PoolType, addrs: Vec<PoolAddr>) -> Self {
        let counter = match addrs.first() {
            Some(PoolAddr::Cidr(cidr)) => cidr.addr,
            _ => PfAddr::ANY,
        };
        Self {
            addrs,
            ty,
            sticky: false,
            proxy_port: (0, 0),
            key: [0; 4],
            cursor: KMutex::new(PoolCursor { cur: 0, tblidx: None, counter }),
        }
    }

    /// Hand a source the same address for as long as it has states.
    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    /// The port range: NAT searches it for a free port, RDR maps the
    /// destination port into it. `(0, 0)` leaves ports alone.
    pub fn ports(mut self, lo: u16, hi: u16) -> Self {
        self.proxy_port = (lo, hi);
        self
    }

    /// The key for source-hash pools.
    pub fn hash_key(mut self, key: [u32; 4]) -> Self {
        self.key = key;
        self
    }

    pub fn ty(&self) -> PoolType {
        self.ty
    }

    fn first_cidr(&self) -> Result<&PfCidr, PoolError> {
        match self.addrs.first() {
            Some(PoolAddr::Cidr(cidr)) => Ok(cidr),
            _ => Err(PoolError::NoAddress),
        }
    }

    /// Pick the address to translate `saddr` to.
    ///
    /// `init` tracks the first address handed out during a port
    /// search: when it is zero, random pools reseed their counter and
    /// both random and round-robin pools record the address they
    /// chose in it.
    pub(crate) fn map_addr<R: Rng>(
        &self,
        af: Af,
        saddr: PfAddr,
        init: Option<&mut PfAddr>,
        rng: &mut R,
    ) -> Result<PfAddr, PoolError> {
        if self.ty == PoolType::RoundRobin {
            return self.round_robin(af, init);
        }

        let cidr = self.first_cidr()?;
        let (raddr, rmask) = (cidr.addr, cidr.mask);
        let naddr = match self.ty {
            PoolType::None | PoolType::RoundRobin => raddr,
            PoolType::Bitmask => PfAddr::poolmask(raddr, rmask, saddr, af),
            PoolType::SrcHash => {
                let hash = pf_hash(saddr, &self.key, af);
                PfAddr::poolmask(raddr, rmask, hash, af)
            }
            PoolType::Random => {
                let mut cur = self.cursor.lock();
                match init {
                    Some(init) if init.is_zero(af) => {
                        cur.counter =
                            random_counter(cur.counter, rmask, af, rng);
                        let naddr =
                            PfAddr::poolmask(raddr, rmask, cur.counter, af);
                        *init = naddr;
                        naddr
                    }
                    _ => {
                        cur.counter = cur.counter.inc(af);
                        PfAddr::poolmask(raddr, rmask, cur.counter, af)
                    }
                }
            }
        };
        Ok(naddr)
    }

    fn round_robin(
        &self,
        af: Af,
        init: Option<&mut PfAddr>,
    ) -> Result<PfAddr, PoolError> {
        let mut cur = self.cursor.lock();
        let n = self.addrs.len();
        if n == 0 {
            return Err(PoolError::NoAddress);
        }
        if cur.cur >= n {
            cur.cur = 0;
        }

        let current = match &self.addrs[cur.cur] {
            PoolAddr::Table(tbl) => tbl.pool_get(af, cur.tblidx, cur.counter),
            PoolAddr::Cidr(cidr) => {
                cidr.contains(af, cur.counter).then_some((0, cur.counter))
            }
        };

        match current {
            Some((idx, addr)) => {
                if matches!(self.addrs[cur.cur], PoolAddr::Table(_)) {
                    cur.tblidx = Some(idx);
                }
                cur.counter = addr;
            }
            None => {
                // Move on to the next entry with an address of this
                // family, giving up once we are back where we started.
                let start = cur.cur;
                loop {
                    cur.cur = (cur.cur + 1) % n;
                    match &self.addrs[cur.cur] {
                        PoolAddr::Table(tbl) => {
                            cur.tblidx = None;
                            if let Some((idx, addr)) =
                                tbl.pool_get(af, None, PfAddr::ANY)
                            {
                                cur.tblidx = Some(idx);
                                cur.counter = addr;
                                break;
                            }
                        }
                        PoolAddr::Cidr(cidr) if cidr.af == af => {
                            cur.counter = cidr.addr;
                            break;
                        }
                        PoolAddr::Cidr(_) => {}
                    }
                    if cur.cur == start {
                        return Err(PoolError::NoAddress);
                    }
                }
            }
        }

        let naddr = cur.counter;
        if let Some(init) = init {
            if init.is_zero(af) {
                *init = naddr;
            }
        }
        cur.counter = cur.counter.inc(af);
        Ok(naddr)
    }

    /// Choose a translated address and source port for a NAT.
    ///
    /// A candidate is free when no state already uses the wire key
    /// `(daddr, dport) <-> (naddr, nport)`; `in_use` answers that.
    /// Ports are searched from a random point in the range upward,
    /// then downward. Random and round-robin pools move on to their
    /// next address when a range is full.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn get_sport<R, F>(
        &self,
        af: Af,
        proto: Protocol,
        saddr: PfAddr,
        sport: u16,
        daddr: PfAddr,
        dport: u16,
        sticky: Option<PfAddr>,
        rng: &mut R,
        in_use: F,
    ) -> Result<(PfAddr, u16), PoolError>
    where
        R: Rng,
        F: Fn(&StateKey) -> bool,
    {
        let (mut low, mut high) = self.proxy_port;
        let icmp = proto == af.icmp_proto();
        if icmp {
            (low, high) = (1, 65535);
        }
        if low > high {
            core::mem::swap(&mut low, &mut high);
        }

        let mut init = PfAddr::ANY;
        let mut naddr = match sticky {
            Some(addr) => addr,
            None => self.map_addr(af, saddr, Some(&mut init), rng)?,
        };

        let free = |naddr: PfAddr, nport: u16| {
            // ICMP queries key on their identifier at both ends.
            let dport = if icmp { nport } else { dport };
            let key = StateKey::new(
                af,
                proto,
                (naddr, nport),
                (daddr, dport),
                Direction::Out,
            );
            !in_use(&key)
        };

        loop {
            if !proto.has_ports() && !icmp {
                if free(naddr, 0) {
                    return Ok((naddr, 0));
                }
            } else if low == 0 && high == 0 {
                if free(naddr, sport) {
                    return Ok((naddr, sport));
                }
            } else if low == high {
                if free(naddr, low) {
                    return Ok((naddr, low));
                }
            } else {
                let cut = rng.random_range(low..=high);
                let up = cut..=high;
                let down = (low..cut).rev();
                if let Some(p) = up.chain(down).find(|&p| free(naddr, p)) {
                    return Ok((naddr, p));
                }
            }

            let remap =
                matches!(self.ty, PoolType::Random | PoolType::RoundRobin);
            if sticky.is_some() || !remap {
                break;
            }
            naddr = self.map_addr(af, saddr, Some(&mut init), rng)?;
            if naddr == init {
                break;
            }
        }

        Err(PoolError::Exhausted { lo: low, hi: high })
    }
}

impl Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for a in &self.addrs {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{a}")?;
            first = false;
        }
        let (lo, hi) = self.proxy_port;
        match (lo, hi) {
            (0, 0) => {}
            (lo, hi) if lo == hi || hi == 0 => write!(f, " port {lo}")?,
            (lo, hi) => write!(f, " port {lo}:{hi}")?,
        }
        if self.ty != PoolType::None {
            write!(f, " {}", self.ty)?;
        }
        if self.sticky {
            write!(f, " sticky-address")?;
        }
        Ok(())
    }
}

// Randomize the host part of a pool counter. For IPv6 only the words
// below the first fully-masked one are touched.
fn random_counter<R: Rng>(
    counter: PfAddr,
    mask: PfAddr,
    af: Af,
    rng: &mut R,
) -> PfAddr {
    let mut words = counter.words32(af);
    match af {
        Af::Inet => words[0] = rng.random(),
        Af::Inet6 => {
            let mwords = mask.words32(af);
            for i in (0..4).rev() {
                if mwords[i] == u32::MAX {
                    break;
                }
                words[i] = rng.random();
            }
        }
    }
    PfAddr::from_words32(words, af)
}

/// Hash an address with a pool key: Bob Jenkins' 96-bit mix, as
/// source-hash pools have always used it.
pub fn pf_hash(addr: PfAddr, key: &[u32; 4], af: Af) -> PfAddr {
    const GOLDEN: u32 = 0x9e37_79b9;

    fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
        let (mut x, mut y, mut z) = (*a, *b, *c);
        x = x.wrapping_sub(y).wrapping_sub(z) ^ (z >> 13);
        y = y.wrapping_sub(z).wrapping_sub(x) ^ (x << 8);
        z = z.wrapping_sub(x).wrapping_sub(y) ^ (y >> 13);
        x = x.wrapping_sub(y).wrapping_sub(z) ^ (z >> 12);
        y = y.wrapping_sub(z).wrapping_sub(x) ^ (x << 16);
        z = z.wrapping_sub(x).wrapping_sub(y) ^ (y >> 5);
        x = x.wrapping_sub(y).wrapping_sub(z) ^ (z >> 3);
        y = y.wrapping_sub(z).wrapping_sub(x) ^ (x << 10);
        z = z.wrapping_sub(x).wrapping_sub(y) ^ (y >> 15);
        (*a, *b, *c) = (x, y, z);
    }

    let w = addr.words32(af);
    let (mut a, mut b, mut c) = (GOLDEN, GOLDEN, key[0]);
    let mut hash = [0u32; 4];
    match af {
        Af::Inet => {
            a = a.wrapping_add(w[0]);
            b = b.wrapping_add(key[1]);
            mix(&mut a, &mut b, &mut c);
            hash[0] = c.wrapping_add(key[2]);
        }
        Af::Inet6 => {
            let rounds = [
                (0, 2, None),
                (1, 3, Some(1)),
                (2, 1, Some(2)),
                (3, 0, Some(3)),
            ];
            for (i, (wa, wb, kc)) in rounds.into_iter().enumerate() {
                a = a.wrapping_add(w[wa]);
                b = b.wrapping_add(w[wb]);
                if let Some(k) = kc {
                    c = c.wrapping_add(key[k]);
                }
                mix(&mut a, &mut b, &mut c);
                hash[i] = c;
            }
        }
    }
    PfAddr::from_words32(hash, af)
}

/// A translation chosen for a packet.
#[derive(Clone, Debug)]
pub struct Translation {
    pub matched: EvalMatch,
    /// The end of the packet that is rewritten.
    pub endpoint: Endpoint,
    pub addr: PfAddr,
    /// Ignored for protocols without ports.
    pub port: u16,
}

impl Translation {
    pub fn rule(&self) -> &Arc<Rule> {
        &self.matched.rule
    }
}

// The address and port tests of a translation rule. Inbound BINAT is
// the reverse of its outbound form: the rule's destination is matched
// against the packet's source and its pool against the destination.
fn translation_fields(
    rule: &Rule,
    pkt: &Packet,
    dir: Direction,
    ifname: &str,
) -> bool {
    let af = pkt.af;
    let (sport, dport) = super::eval::rule_ports(pkt);
    if !rule.matches_ifname(ifname)
        || rule.direction.is_some_and(|d| d != dir)
        || rule.af.is_some_and(|a| a != af)
        || rule.proto.is_some_and(|p| p != pkt.proto)
    {
        return false;
    }

    if rule.action == RuleAction::Binat && dir == Direction::In {
        let pool_ok = match rule.pool.as_ref().and_then(|p| p.addrs.first()) {
            Some(PoolAddr::Cidr(cidr)) => cidr.contains(af, pkt.dst),
            Some(PoolAddr::Table(tbl)) => tbl.contains(af, pkt.dst),
            None => true,
        };
        return rule.dst.addr_matches(af, pkt.src)
            && rule.dst.port_matches(sport)
            && pool_ok;
    }

    rule.src.addr_matches(af, pkt.src)
        && rule.src.port_matches(sport)
        && rule.dst.addr_matches(af, pkt.dst)
        && rule.dst.port_matches(dport)
}

/// The first rule of `class` matching the packet, descending into
/// anchors. Returns `None` if nothing matches or the match is a
/// `no` rule.
pub fn match_translation<R: Rng>(
    rs: &Ruleset,
    class: RuleClass,
    ifname: &str,
    ctx: &mut PredCtx<'_, R>,
    log: &dyn LogProvider,
) -> Option<EvalMatch> {
    let mut cur = Cursor::new(rs, class);
    let mut found = None;

    while let Some(rule) = cur.current() {
        rule.counters().evaluations.fetch_add(1, Ordering::Relaxed);

        if !translation_fields(rule, ctx.pkt, ctx.dir, ifname)
            || !check_preds(rule, ctx)
        {
            cur.next();
        } else {
            if let Some(tag) = rule.tag {
                ctx.tag = tag;
            }
            match rule.anchor_call() {
                None => {
                    found = Some(cur.matched(rule));
                    break;
                }
                Some(call) => {
                    if !cur.step_into(rule, call) {
                        log.log(
                            LogLevel::Warn,
                            &format!(
                                "anchor stack overflow at {class:?} rule {}",
                                rule.nr()
                            ),
                        );
                    }
                }
            }
        }

        if cur.current().is_none() {
            cur.step_out();
        }
    }

    found.filter(|m| !m.rule.action.is_no_translation())
}

/// Find the translation for the packet in `ctx`, if any.
///
/// A NAT whose port search fails is logged and skipped: the packet
/// goes on to the filter rules untranslated.
pub fn get_translation<R: Rng>(
    rs: &Ruleset,
    ifname: &str,
    ctx: &mut PredCtx<'_, R>,
    states: &StateTable,
    src_nodes: &SrcNodeTable,
    log: &dyn LogProvider,
) -> Option<Translation> {
    let classes = match ctx.dir {
        Direction::Out => [RuleClass::Binat, RuleClass::Nat],
        Direction::In => [RuleClass::Rdr, RuleClass::Binat],
    };
    let matched = classes
        .into_iter()
        .find_map(|class| match_translation(rs, class, ifname, ctx, log))?;

    let rule = &matched.rule;
    let pool = rule.pool.as_ref()?;
    let pkt = ctx.pkt;
    let af = pkt.af;
    let (saddr, daddr) = (pkt.src, pkt.dst);
    let sport = pkt.sport().unwrap_or(0);
    let dport = pkt.dport().unwrap_or(0);

    let sticky = (pool.sticky && pool.ty != PoolType::None)
        .then(|| src_nodes.sticky_addr(rule, af, saddr))
        .flatten();
    if let Some(addr) = sticky {
        log.log(
            LogLevel::Debug,
            &format!(
                "sticky address: {} maps to {}",
                saddr.display(af),
                addr.display(af)
            ),
        );
    }

    let (endpoint, addr, port) = match (rule.action, ctx.dir) {
        (RuleAction::Nat, _) => {
            let res = pool.get_sport(
                af,
                pkt.proto,
                saddr,
                sport,
                daddr,
                dport,
                sticky,
                &mut *ctx.rng,
                |k| states.wire_key_in_use(k),
            );
            match res {
                Ok((addr, port)) => (Endpoint::Src, addr, port),
                Err(e) => {
                    log.log(
                        LogLevel::Debug,
                        &format!("NAT rule {} failed: {e}", rule.nr()),
                    );
                    return None;
                }
            }
        }

        (RuleAction::Binat, Direction::Out) => {
            let cidr = pool.first_cidr().ok()?;
            let addr = PfAddr::poolmask(cidr.addr, cidr.mask, saddr, af);
            (Endpoint::Src, addr, sport)
        }

        (RuleAction::Binat, Direction::In) => {
            let AddrMatch::Cidr(cidr) = &rule.src.addr else {
                return None;
            };
            let addr = PfAddr::poolmask(cidr.addr, cidr.mask, daddr, af);
            (Endpoint::Dst, addr, dport)
        }

        (RuleAction::Rdr, _) => {
            let mut addr = match sticky {
                Some(addr) => addr,
                None => match pool.map_addr(af, saddr, None, &mut *ctx.rng) {
                    Ok(addr) => addr,
                    Err(e) => {
                        log.log(
                            LogLevel::Debug,
                            &format!("RDR rule {} failed: {e}", rule.nr()),
                        );
                        return None;
                    }
                },
            };
            if pool.ty == PoolType::Bitmask {
                let cidr = pool.first_cidr().ok()?;
                addr = PfAddr::poolmask(addr, cidr.mask, daddr, af);
            }
            (Endpoint::Dst, addr, rdr_port(rule, pool, dport))
        }

        _ => return None,
    };

    Some(Translation { matched, endpoint, addr, port })
}

// Map a destination port into the pool's port range, relative to the
// start of the rule's destination port range.
fn rdr_port(rule: &Rule, pool: &Pool, dport: u16) -> u16 {
    let (lo, hi) = pool.proxy_port;
    if hi != 0 {
        let base = rule.dst.port.as_ref().map(|p| p.lo).unwrap_or(0);
        let span = u32::from(hi.saturating_sub(lo)) + 1;
        let off = u32::from(dport.wrapping_sub(base)) % span;
        let mut port = off + u32::from(lo);
        if port > 65535 {
            port -= 65535;
        }
        port as u16
    } else if lo != 0 {
        lo
    } else {
        dport
    }
}
