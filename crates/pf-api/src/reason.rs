// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Why a packet received the disposition it did.
///
/// These codes are surfaced to logging and counters only; they are
/// never sent to the packet's originator.
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
pub enum Reason {
    /// The packet matched a rule (or a state created by one).
    Match,
    BadOffset,
    Fragment,
    Short,
    Normalize,
    OutOfMemory,
    Timestamp,
    Congestion,
    IpOptions,
    ProtoChecksum,
    BadState,
    StateInsertFailed,
    MaxStates,
    SrcLimit,
    Synproxy,
}

impl Reason {
    pub const COUNT: usize = 15;

    pub const ALL: [Reason; Self::COUNT] = [
        Self::Match,
        Self::BadOffset,
        Self::Fragment,
        Self::Short,
        Self::Normalize,
        Self::OutOfMemory,
        Self::Timestamp,
        Self::Congestion,
        Self::IpOptions,
        Self::ProtoChecksum,
        Self::BadState,
        Self::StateInsertFailed,
        Self::MaxStates,
        Self::SrcLimit,
        Self::Synproxy,
    ];

    pub const fn idx(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::BadOffset => "bad-offset",
            Self::Fragment => "fragment",
            Self::Short => "short",
            Self::Normalize => "normalize",
            Self::OutOfMemory => "memory",
            Self::Timestamp => "bad-timestamp",
            Self::Congestion => "congestion",
            Self::IpOptions => "ip-option",
            Self::ProtoChecksum => "proto-cksum",
            Self::BadState => "state-mismatch",
            Self::StateInsertFailed => "state-insert",
            Self::MaxStates => "state-limit",
            Self::SrcLimit => "src-limit",
            Self::Synproxy => "synproxy",
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The disposition of a packet handed to the engine.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum Action {
    /// Forward the packet, with any header rewrites already applied.
    Pass,
    /// Discard the packet.
    Drop,
    /// Discard the packet: the engine answered it on behalf of the
    /// destination while a synproxy handshake is in progress.
    SynproxyDrop,
    /// A state was just created for this packet and the packet must
    /// be held until state synchronization releases it.
    Defer,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Drop => "DROP",
            Self::SynproxyDrop => "SYNPROXY-DROP",
            Self::Defer => "DEFER",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reason_index_is_dense() {
        for (i, r) in Reason::ALL.iter().enumerate() {
            assert_eq!(r.idx(), i);
        }
    }
}
