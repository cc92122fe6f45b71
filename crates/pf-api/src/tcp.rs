// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

bitflags! {
    /// The TCP header flags.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

const FLAG_CHARS: [(TcpFlags, char); 8] = [
    (TcpFlags::FIN, 'F'),
    (TcpFlags::SYN, 'S'),
    (TcpFlags::RST, 'R'),
    (TcpFlags::PSH, 'P'),
    (TcpFlags::ACK, 'A'),
    (TcpFlags::URG, 'U'),
    (TcpFlags::ECE, 'E'),
    (TcpFlags::CWR, 'W'),
];

impl Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (flag, c) in FLAG_CHARS {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for TcpFlags {
    type Err = String;

    /// Parse the `pfctl` letter form, e.g. `"SA"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = TcpFlags::empty();
        for c in s.chars() {
            let Some((flag, _)) = FLAG_CHARS
                .iter()
                .find(|(_, fc)| *fc == c.to_ascii_uppercase())
            else {
                return Err(format!("invalid TCP flag: {c}"));
            };
            flags |= *flag;
        }
        Ok(flags)
    }
}

/// The state of one side of a tracked connection.
///
/// The TCP states follow the standard state diagram and are ordered:
/// the tracker relies on comparisons such as "at least FIN_WAIT_2".
/// The two proxy states are only used while a synproxy handshake is
/// in progress. The liveness states are used by UDP, ICMP and all
/// other protocols.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum PeerState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
    ProxySrc,
    ProxyDst,
    NoTraffic,
    Single,
    Multiple,
}

impl Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynRcvd => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::TimeWait => "TIME_WAIT",
            Self::ProxySrc => "PROXY:SRC",
            Self::ProxyDst => "PROXY:DST",
            Self::NoTraffic => "NO_TRAFFIC",
            Self::Single => "SINGLE",
            Self::Multiple => "MULTIPLE",
        };
        write!(f, "{s}")
    }
}
