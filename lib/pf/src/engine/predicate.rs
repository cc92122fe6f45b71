// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Predicates used for `Rule` matching.
//!
//! The address and port predicates live in [`RuleAddr`]: they are the
//! fields the skip-step index is built over. Everything else a rule
//! can test is a [`Predicate`], evaluated in order after the indexed
//! fields have matched.

use super::packet::Packet;
use super::table::AddrTable;
use crate::provider::SocketLookup;
use crate::provider::SocketOwner;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use pf_api::Af;
use pf_api::Direction;
use pf_api::OWNER_UNKNOWN;
use pf_api::OpMatch;
use pf_api::PfAddr;
use pf_api::PfCidr;
use pf_api::RangeOp;
use pf_api::TcpFlags;
use rand::Rng;

/// Describe how to match an address.
#[derive(Clone, Debug, Default)]
pub enum AddrMatch {
    #[default]
    Any,
    Cidr(PfCidr),
    Table(Arc<AddrTable>),
}

impl AddrMatch {
    fn is_match(&self, af: Af, addr: PfAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Cidr(cidr) => cidr.contains(af, addr),
            Self::Table(tbl) => tbl.contains(af, addr),
        }
    }
}

/// Address matchers are equal when they would match the same set of
/// addresses: tables compare by identity.
impl PartialEq for AddrMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, Self::Any) => true,
            (Self::Cidr(a), Self::Cidr(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for AddrMatch {}

impl Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Cidr(cidr) => write!(f, "{cidr}"),
            Self::Table(tbl) => write!(f, "<{}>", tbl.name()),
        }
    }
}

/// The source or destination half of a rule.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RuleAddr {
    pub addr: AddrMatch,
    pub neg: bool,
    pub port: Option<OpMatch<u16>>,
}

impl RuleAddr {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn cidr(cidr: PfCidr) -> Self {
        Self { addr: AddrMatch::Cidr(cidr), ..Default::default() }
    }

    pub fn table(tbl: Arc<AddrTable>) -> Self {
        Self { addr: AddrMatch::Table(tbl), ..Default::default() }
    }

    pub fn with_port(mut self, port: OpMatch<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn negated(mut self) -> Self {
        self.neg = true;
        self
    }

    pub fn addr_matches(&self, af: Af, addr: PfAddr) -> bool {
        self.addr.is_match(af, addr) != self.neg
    }

    /// A port operator never matches a packet without ports.
    pub fn port_matches(&self, port: Option<u16>) -> bool {
        match (&self.port, port) {
            (None, _) => true,
            (Some(op), Some(p)) => op.matches(p),
            (Some(_), None) => false,
        }
    }
}

impl Display for RuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.neg {
            write!(f, "! ")?;
        }
        write!(f, "{}", self.addr)?;
        if let Some(port) = &self.port {
            write!(f, " port {}", OpDisplay(port))?;
        }
        Ok(())
    }
}

struct OpDisplay<'a, T>(&'a OpMatch<T>);

impl<T: Display> Display for OpDisplay<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let OpMatch { op, lo, hi } = self.0;
        match op {
            RangeOp::Eq => write!(f, "= {lo}"),
            RangeOp::Ne => write!(f, "!= {lo}"),
            RangeOp::Lt => write!(f, "< {lo}"),
            RangeOp::Le => write!(f, "<= {lo}"),
            RangeOp::Gt => write!(f, "> {lo}"),
            RangeOp::Ge => write!(f, ">= {lo}"),
            RangeOp::Irg => write!(f, "{lo} >< {hi}"),
            RangeOp::Xrg => write!(f, "{lo} <> {hi}"),
            RangeOp::Rrg => write!(f, "{lo}:{hi}"),
        }
    }
}

/// The per-packet context predicates are evaluated in.
pub struct PredCtx<'a, R: Rng> {
    pub pkt: &'a Packet,
    pub dir: Direction,
    pub sockets: Option<&'a dyn SocketLookup>,
    /// The packet's tag as updated by rules matched so far.
    pub tag: u16,
    pub rng: &'a mut R,
    owner: Option<Option<SocketOwner>>,
}

impl<'a, R: Rng> PredCtx<'a, R> {
    pub fn new(
        pkt: &'a Packet,
        dir: Direction,
        sockets: Option<&'a dyn SocketLookup>,
        rng: &'a mut R,
    ) -> Self {
        Self { pkt, dir, sockets, tag: pkt.meta.tag, rng, owner: None }
    }

    /// Resolve the local socket owner, at most once per packet.
    fn owner(&mut self) -> Option<SocketOwner> {
        if let Some(owner) = self.owner {
            return owner;
        }
        let owner = self.lookup_owner();
        self.owner = Some(owner);
        owner
    }

    fn lookup_owner(&self) -> Option<SocketOwner> {
        let sockets = self.sockets?;
        let pkt = self.pkt;
        if !pkt.proto.has_ports() {
            return None;
        }
        let src = (pkt.src, pkt.sport()?);
        let dst = (pkt.dst, pkt.dport()?);
        let (local, remote) = match self.dir {
            Direction::In => (dst, src),
            Direction::Out => (src, dst),
        };
        sockets.lookup(pkt.af, pkt.proto, local, remote)
    }
}

/// A rule predicate outside the skip-step fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    Tos(u8),
    /// The flags selected by `mask` must equal `flags`.
    TcpFlags { flags: TcpFlags, mask: TcpFlags },
    Uid(OpMatch<u32>),
    Gid(OpMatch<u32>),
    IcmpType(u8),
    IcmpCode(u8),
    /// Match with probability `prob / 2^32`.
    Prob(u32),
    Tagged { tag: u16, neg: bool },
}

impl Predicate {
    /// Build a probability predicate from a percentage, or `None` if
    /// the rule should always match.
    pub fn prob_percent(pct: f64) -> Option<Self> {
        if pct >= 100.0 {
            return None;
        }
        let scaled = (pct.max(0.0) / 100.0 * f64::from(u32::MAX)) as u32;
        Some(Self::Prob(scaled))
    }

    /// Can this predicate be answered for a non-first fragment, which
    /// carries no transport header?
    pub fn needs_l4(&self) -> bool {
        matches!(
            self,
            Self::TcpFlags { .. } | Self::IcmpType(_) | Self::IcmpCode(_)
        )
    }

    pub fn is_match<R: Rng>(&self, ctx: &mut PredCtx<'_, R>) -> bool {
        let pkt = ctx.pkt;
        match self {
            Self::Tos(tos) => pkt.tos == *tos,

            // Only TCP packets are subject to a flags test.
            Self::TcpFlags { flags, mask } => match pkt.tcp_flags() {
                Some(pf) => pf & *mask == *flags,
                None => true,
            },

            Self::Uid(op) => {
                let uid = ctx.owner().map(|o| o.uid).unwrap_or(OWNER_UNKNOWN);
                op.matches_owner(uid)
            }

            Self::Gid(op) => {
                let gid = ctx.owner().map(|o| o.gid).unwrap_or(OWNER_UNKNOWN);
                op.matches_owner(gid)
            }

            Self::IcmpType(ty) => {
                pkt.icmp_type_code().is_some_and(|(t, _)| t == *ty)
            }

            Self::IcmpCode(code) => {
                pkt.icmp_type_code().is_some_and(|(_, c)| c == *code)
            }

            Self::Prob(prob) => ctx.rng.random::<u32>() < *prob,

            Self::Tagged { tag, neg } => (ctx.tag == *tag) != *neg,
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tos(tos) => write!(f, "tos 0x{tos:02x}"),
            Self::TcpFlags { flags, mask } => write!(f, "flags {flags}/{mask}"),
            Self::Uid(op) => write!(f, "user {}", OpDisplay(op)),
            Self::Gid(op) => write!(f, "group {}", OpDisplay(op)),
            Self::IcmpType(ty) => write!(f, "icmp-type {ty}"),
            Self::IcmpCode(code) => write!(f, "code {code}"),
            Self::Prob(prob) => {
                let pct = f64::from(*prob) * 100.0 / f64::from(u32::MAX);
                write!(f, "probability {pct:.1}%")
            }
            Self::Tagged { tag, neg: false } => write!(f, "tagged {tag}"),
            Self::Tagged { tag, neg: true } => write!(f, "! tagged {tag}"),
        }
    }
}

/// Render a list of predicates for display.
pub fn preds_to_string(preds: &[Predicate]) -> String {
    preds.iter().map(|p| p.to_string()).collect::<Vec<String>>().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::L4;
    use crate::engine::packet::TcpHdr;
    use pf_api::Protocol;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::Ipv4Addr;

    struct FixedOwner;

    impl SocketLookup for FixedOwner {
        fn lookup(
            &self,
            _af: Af,
            _proto: Protocol,
            local: (PfAddr, u16),
            _remote: (PfAddr, u16),
        ) -> Option<SocketOwner> {
            (local.1 == 22).then_some(SocketOwner { uid: 0, gid: 0, pid: 1 })
        }
    }

    fn pkt(flags: TcpFlags) -> Packet {
        let tcp = TcpHdr::new(40000, 22, flags);
        Packet::new(
            Af::Inet,
            PfAddr::from(Ipv4Addr::new(10, 0, 0, 1)),
            PfAddr::from(Ipv4Addr::new(10, 0, 0, 2)),
            Protocol::TCP,
            L4::Tcp(tcp),
            vec![],
        )
    }

    #[test]
    fn flags_under_mask() {
        let p = pkt(TcpFlags::SYN | TcpFlags::ECE);
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = PredCtx::new(&p, Direction::In, None, &mut rng);
        let syn_only = Predicate::TcpFlags {
            flags: TcpFlags::SYN,
            mask: TcpFlags::SYN | TcpFlags::ACK,
        };
        assert!(syn_only.is_match(&mut ctx));
        let strict = Predicate::TcpFlags {
            flags: TcpFlags::SYN,
            mask: TcpFlags::all(),
        };
        assert!(!strict.is_match(&mut ctx));
    }

    #[test]
    fn owner_is_oriented_by_direction() {
        let p = pkt(TcpFlags::SYN);
        let mut rng = StdRng::seed_from_u64(1);
        let root = Predicate::Uid(OpMatch::exact(0));

        let mut ctx =
            PredCtx::new(&p, Direction::In, Some(&FixedOwner), &mut rng);
        assert!(root.is_match(&mut ctx));

        let mut ctx =
            PredCtx::new(&p, Direction::Out, Some(&FixedOwner), &mut rng);
        assert!(!root.is_match(&mut ctx));
    }

    #[test]
    fn port_op_needs_ports() {
        let ra = RuleAddr::any().with_port(OpMatch::exact(22));
        assert!(ra.port_matches(Some(22)));
        assert!(!ra.port_matches(None));
        assert!(RuleAddr::any().port_matches(None));
    }

    #[test]
    fn negated_any_matches_nothing() {
        let ra = RuleAddr::any().negated();
        assert!(!ra.addr_matches(Af::Inet, PfAddr::ANY));
    }

    #[test]
    fn probability_bounds() {
        assert_eq!(Predicate::prob_percent(100.0), None);
        let never = Predicate::prob_percent(0.0).unwrap();
        let p = pkt(TcpFlags::SYN);
        let mut rng = StdRng::seed_from_u64(7);
        let mut ctx = PredCtx::new(&p, Direction::In, None, &mut rng);
        assert!((0..100).all(|_| !never.is_match(&mut ctx)));
    }
}
