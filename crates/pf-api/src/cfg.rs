// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine tunables.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The timeout class a state is currently in.
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
pub enum TimeoutClass {
    TcpFirstPacket,
    TcpOpening,
    TcpEstablished,
    TcpClosing,
    TcpFinWait,
    TcpClosed,
    UdpFirstPacket,
    UdpSingle,
    UdpMultiple,
    IcmpFirstPacket,
    IcmpErrorReply,
    OtherFirstPacket,
    OtherSingle,
    OtherMultiple,
    /// The state has been marked for immediate removal.
    Purge,
    /// The state has been removed from the lookup structures and is
    /// waiting to be freed.
    Unlinked,
}

impl Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::TcpFirstPacket => "tcp.first",
            Self::TcpOpening => "tcp.opening",
            Self::TcpEstablished => "tcp.established",
            Self::TcpClosing => "tcp.closing",
            Self::TcpFinWait => "tcp.finwait",
            Self::TcpClosed => "tcp.closed",
            Self::UdpFirstPacket => "udp.first",
            Self::UdpSingle => "udp.single",
            Self::UdpMultiple => "udp.multiple",
            Self::IcmpFirstPacket => "icmp.first",
            Self::IcmpErrorReply => "icmp.error",
            Self::OtherFirstPacket => "other.first",
            Self::OtherSingle => "other.single",
            Self::OtherMultiple => "other.multiple",
            Self::Purge => "purge",
            Self::Unlinked => "unlinked",
        };
        write!(f, "{s}")
    }
}

/// Per-class state timeouts, in seconds.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Timeouts {
    pub tcp_first: u32,
    pub tcp_opening: u32,
    pub tcp_established: u32,
    pub tcp_closing: u32,
    pub tcp_finwait: u32,
    pub tcp_closed: u32,
    pub udp_first: u32,
    pub udp_single: u32,
    pub udp_multiple: u32,
    pub icmp_first: u32,
    pub icmp_error: u32,
    pub other_first: u32,
    pub other_single: u32,
    pub other_multiple: u32,
    /// How often the sweeper should cover the whole state table.
    pub interval: u32,
    /// How long an unused source node lingers.
    pub src_node: u32,
    /// The number of states at which timeouts start to shrink.
    pub adaptive_start: u32,
    /// The number of states at which timeouts reach zero.
    pub adaptive_end: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_first: 120,
            tcp_opening: 30,
            tcp_established: 24 * 60 * 60,
            tcp_closing: 15 * 60,
            tcp_finwait: 45,
            tcp_closed: 90,
            udp_first: 60,
            udp_single: 30,
            udp_multiple: 60,
            icmp_first: 20,
            icmp_error: 10,
            other_first: 60,
            other_single: 30,
            other_multiple: 60,
            interval: 10,
            src_node: 0,
            adaptive_start: 6000,
            adaptive_end: 12000,
        }
    }
}

impl Timeouts {
    /// The configured timeout for a class. The purge and unlinked
    /// classes have no configurable timeout.
    pub fn get(&self, class: TimeoutClass) -> Option<u32> {
        use TimeoutClass::*;

        let val = match class {
            TcpFirstPacket => self.tcp_first,
            TcpOpening => self.tcp_opening,
            TcpEstablished => self.tcp_established,
            TcpClosing => self.tcp_closing,
            TcpFinWait => self.tcp_finwait,
            TcpClosed => self.tcp_closed,
            UdpFirstPacket => self.udp_first,
            UdpSingle => self.udp_single,
            UdpMultiple => self.udp_multiple,
            IcmpFirstPacket => self.icmp_first,
            IcmpErrorReply => self.icmp_error,
            OtherFirstPacket => self.other_first,
            OtherSingle => self.other_single,
            OtherMultiple => self.other_multiple,
            Purge | Unlinked => return None,
        };
        Some(val)
    }
}

/// Hard limits on table sizes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Limits {
    pub states: u32,
    pub src_nodes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { states: 10_000, src_nodes: 10_000 }
    }
}

/// The engine-wide configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PfConfig {
    pub timeouts: Timeouts,
    pub limits: Limits,
    /// The id stamped on states created by this engine.
    pub hostid: u32,
    /// Seed for the engine's random number generator. When unset the
    /// generator is seeded from the operating system.
    pub seed: Option<u64>,
    /// Hand the first packet of each new state to the sync provider
    /// for deferral.
    pub defer_new_states: bool,
    /// The MSS advertised by synproxy when the client did not send one.
    pub default_mss: u16,
}

impl Default for PfConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            limits: Limits::default(),
            hostid: 0,
            seed: None,
            defer_new_states: false,
            default_mss: 536,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: PfConfig = toml::from_str(
            "hostid = 7\n[timeouts]\ntcp_established = 3600\n",
        )
        .unwrap();
        assert_eq!(cfg.hostid, 7);
        assert_eq!(cfg.timeouts.tcp_established, 3600);
        assert_eq!(cfg.timeouts.tcp_first, 120);
        assert_eq!(cfg.limits.states, 10_000);
        assert_eq!(cfg.default_mss, 536);
    }

    #[test]
    fn special_classes_have_no_timeout() {
        let t = Timeouts::default();
        assert_eq!(t.get(TimeoutClass::Purge), None);
        assert_eq!(t.get(TimeoutClass::Unlinked), None);
        assert_eq!(t.get(TimeoutClass::UdpSingle), Some(30));
    }
}
