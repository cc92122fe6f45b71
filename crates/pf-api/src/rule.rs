// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rule vocabulary shared with configuration tooling.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// What a rule does when it is the deciding match.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum RuleAction {
    Pass,
    #[default]
    Drop,
    Nat,
    NoNat,
    Binat,
    NoBinat,
    Rdr,
    NoRdr,
}

impl RuleAction {
    /// Is this one of the "exempt this match from translation" actions?
    pub const fn is_no_translation(self) -> bool {
        matches!(self, Self::NoNat | Self::NoBinat | Self::NoRdr)
    }
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Drop => "block",
            Self::Nat => "nat",
            Self::NoNat => "no nat",
            Self::Binat => "binat",
            Self::NoBinat => "no binat",
            Self::Rdr => "rdr",
            Self::NoRdr => "no rdr",
        };
        write!(f, "{s}")
    }
}

/// The rule classes a ruleset holds a list for.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum RuleClass {
    Filter,
    Nat,
    Binat,
    Rdr,
}

impl RuleClass {
    pub const COUNT: usize = 4;

    pub const fn idx(self) -> usize {
        self as usize
    }
}

/// Comparison operators for port and owner predicates.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum RangeOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Strictly between the bounds: `lo >< hi`.
    Irg,
    /// Outside the bounds: `lo <> hi`.
    Xrg,
    /// Between the bounds, inclusive: `lo:hi`.
    Rrg,
}

/// An operator and its operands. Single-operand operators only look
/// at `lo`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct OpMatch<T> {
    pub op: RangeOp,
    pub lo: T,
    pub hi: T,
}

impl<T: Copy + Ord> OpMatch<T> {
    pub const fn exact(val: T) -> Self {
        Self { op: RangeOp::Eq, lo: val, hi: val }
    }

    pub const fn range(lo: T, hi: T) -> Self {
        Self { op: RangeOp::Rrg, lo, hi }
    }

    pub fn matches(&self, val: T) -> bool {
        let (lo, hi) = (self.lo, self.hi);
        match self.op {
            RangeOp::Eq => val == lo,
            RangeOp::Ne => val != lo,
            RangeOp::Lt => val < lo,
            RangeOp::Le => val <= lo,
            RangeOp::Gt => val > lo,
            RangeOp::Ge => val >= lo,
            RangeOp::Irg => val > lo && val < hi,
            RangeOp::Xrg => val < lo || val > hi,
            RangeOp::Rrg => val >= lo && val <= hi,
        }
    }
}

/// The socket owner value for "unknown".
pub const OWNER_UNKNOWN: u32 = u32::MAX;

impl OpMatch<u32> {
    /// Match an owner id; an unknown owner only satisfies equality
    /// tests.
    pub fn matches_owner(&self, id: u32) -> bool {
        if id == OWNER_UNKNOWN && !matches!(self.op, RangeOp::Eq | RangeOp::Ne)
        {
            return false;
        }
        self.matches(id)
    }
}

/// Whether and how a passing rule keeps state.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum KeepState {
    #[default]
    None,
    Keep,
    /// Keep state and randomize initial sequence numbers.
    Modulate,
    /// Keep state and complete the TCP handshake on the destination's
    /// behalf before admitting the connection.
    Synproxy,
}

/// Whether a state is bound to the interface it was created on.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum StatePolicy {
    #[default]
    Floating,
    IfBound,
}

/// How a translation pool picks an address.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum PoolType {
    #[default]
    None,
    Bitmask,
    Random,
    SrcHash,
    RoundRobin,
}

impl Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Bitmask => "bitmask",
            Self::Random => "random",
            Self::SrcHash => "source-hash",
            Self::RoundRobin => "round-robin",
        };
        write!(f, "{s}")
    }
}

/// What a blocking rule sends back to the originator, if anything.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum ReturnPolicy {
    #[default]
    Silent,
    /// TCP reset for TCP, nothing otherwise.
    Rst { ttl: u8 },
    /// ICMP unreachable with the given codes for each family.
    Icmp { code4: u8, code6: u8 },
    /// TCP reset for TCP, ICMP port unreachable otherwise.
    Return,
}

/// Source tracking scope for per-source limits.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum SrcTrack {
    #[default]
    None,
    /// One node per source address, shared by all rules.
    Global,
    /// One node per (rule, source address).
    Rule,
}

/// A connection-rate limit: `limit` connections per `seconds`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct RateLimit {
    pub limit: u32,
    pub seconds: u32,
}

/// Which states an overload flush kills.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FlushScope {
    #[default]
    None,
    /// Only states created by the offending rule.
    Rule,
    /// Every state from the offending source.
    Global,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_ops() {
        let irg = OpMatch { op: RangeOp::Irg, lo: 1000u16, hi: 2000 };
        assert!(!irg.matches(1000));
        assert!(irg.matches(1001));
        assert!(!irg.matches(2000));

        let xrg = OpMatch { op: RangeOp::Xrg, lo: 1000u16, hi: 2000 };
        assert!(xrg.matches(999));
        assert!(!xrg.matches(1500));
        assert!(xrg.matches(2001));

        let rrg = OpMatch::range(1000u16, 2000);
        assert!(rrg.matches(1000));
        assert!(rrg.matches(2000));
        assert!(!rrg.matches(2001));
    }

    #[test]
    fn unknown_owner() {
        let ge = OpMatch { op: RangeOp::Ge, lo: 0u32, hi: 0 };
        assert!(!ge.matches_owner(OWNER_UNKNOWN));
        let ne = OpMatch { op: RangeOp::Ne, lo: 0u32, hi: 0 };
        assert!(ne.matches_owner(OWNER_UNKNOWN));
    }
}
