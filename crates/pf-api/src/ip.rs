// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use alloc::string::ToString;
use core::fmt;
use core::fmt::Display;
use core::net::IpAddr;
use core::net::Ipv4Addr;
use core::net::Ipv6Addr;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An address family.
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
pub enum Af {
    Inet,
    Inet6,
}

impl Af {
    /// The number of bits in an address of this family.
    pub const fn bits(self) -> u8 {
        match self {
            Self::Inet => 32,
            Self::Inet6 => 128,
        }
    }

    /// A mask covering every bit of an address of this family.
    pub const fn full_mask(self) -> PfAddr {
        match self {
            Self::Inet => PfAddr(u32::MAX as u128),
            Self::Inet6 => PfAddr(u128::MAX),
        }
    }

    /// The ICMP protocol used by this family.
    pub const fn icmp_proto(self) -> Protocol {
        match self {
            Self::Inet => Protocol::ICMP,
            Self::Inet6 => Protocol::ICMPv6,
        }
    }
}

impl Display for Af {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
        }
    }
}

/// An address of either family.
///
/// The value is held as a single big-endian integer: IPv4 addresses
/// occupy the low 32 bits. The family is carried alongside (in the
/// state key, the rule, the packet) rather than inside the address,
/// which keeps masking and pool arithmetic family-agnostic.
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
pub struct PfAddr(u128);

impl PfAddr {
    pub const ANY: Self = Self(0);

    pub const fn from_raw(val: u128) -> Self {
        Self(val)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Build an address from an [`IpAddr`], returning its family.
    pub fn from_ip(ip: IpAddr) -> (Af, Self) {
        match ip {
            IpAddr::V4(v4) => (Af::Inet, Self::from(v4)),
            IpAddr::V6(v6) => (Af::Inet6, Self::from(v6)),
        }
    }

    pub fn to_ip(self, af: Af) -> IpAddr {
        match af {
            Af::Inet => IpAddr::V4(Ipv4Addr::from(self.0 as u32)),
            Af::Inet6 => IpAddr::V6(Ipv6Addr::from(self.0)),
        }
    }

    /// Is every bit of this address zero?
    pub const fn is_zero(self, af: Af) -> bool {
        self.0 & af.full_mask().0 == 0
    }

    pub const fn and(self, mask: PfAddr) -> Self {
        Self(self.0 & mask.0)
    }

    /// Does `other` fall within `self/mask`?
    pub const fn matches(self, mask: PfAddr, other: PfAddr) -> bool {
        self.0 & mask.0 == other.0 & mask.0
    }

    /// Combine the network bits of `raddr` with the host bits of
    /// `saddr`.
    pub const fn poolmask(
        raddr: PfAddr,
        rmask: PfAddr,
        saddr: PfAddr,
        af: Af,
    ) -> Self {
        Self(((raddr.0 & rmask.0) | (!rmask.0 & saddr.0)) & af.full_mask().0)
    }

    /// Increment the address by one, wrapping within the family.
    pub const fn inc(self, af: Af) -> Self {
        Self(self.0.wrapping_add(1) & af.full_mask().0)
    }

    /// The netmask for a prefix of `len` bits.
    pub const fn prefix_mask(af: Af, len: u8) -> Self {
        let bits = af.bits();
        if len == 0 {
            return Self(0);
        }
        let len = if len > bits { bits } else { len };
        let host = bits - len;
        let full = af.full_mask().0;
        if host == 0 { Self(full) } else { Self(full & !((1u128 << host) - 1)) }
    }

    /// The 32-bit words of the address, most significant first. IPv4
    /// addresses only populate the first word.
    pub const fn words32(self, af: Af) -> [u32; 4] {
        match af {
            Af::Inet => [self.0 as u32, 0, 0, 0],
            Af::Inet6 => [
                (self.0 >> 96) as u32,
                (self.0 >> 64) as u32,
                (self.0 >> 32) as u32,
                self.0 as u32,
            ],
        }
    }

    pub const fn from_words32(words: [u32; 4], af: Af) -> Self {
        match af {
            Af::Inet => Self(words[0] as u128),
            Af::Inet6 => Self(
                ((words[0] as u128) << 96)
                    | ((words[1] as u128) << 64)
                    | ((words[2] as u128) << 32)
                    | words[3] as u128,
            ),
        }
    }

    /// The 16-bit words of the address as they appear on the wire,
    /// for checksum arithmetic.
    pub fn csum_words(self, af: Af) -> impl Iterator<Item = u16> {
        let n = match af {
            Af::Inet => 2,
            Af::Inet6 => 8,
        };
        let val = self.0;
        (0..n).rev().map(move |i| (val >> (i * 16)) as u16)
    }

    /// Render this address in the given family.
    pub fn display(self, af: Af) -> AddrDisplay {
        AddrDisplay { af, addr: self }
    }
}

impl From<Ipv4Addr> for PfAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip) as u128)
    }
}

impl From<Ipv6Addr> for PfAddr {
    fn from(ip: Ipv6Addr) -> Self {
        Self(u128::from(ip))
    }
}

pub struct AddrDisplay {
    af: Af,
    addr: PfAddr,
}

impl Display for AddrDisplay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr.to_ip(self.af))
    }
}

/// An address and mask of a single family, written `addr/len`.
///
/// A bare address is treated as a host prefix.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PfCidr {
    pub af: Af,
    pub addr: PfAddr,
    pub mask: PfAddr,
}

impl PfCidr {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let (af, addr) = PfAddr::from_ip(ip);
        if prefix_len > af.bits() {
            return Err(format!("bad prefix length: {prefix_len}"));
        }
        let mask = PfAddr::prefix_mask(af, prefix_len);
        Ok(Self { af, addr: addr.and(mask), mask })
    }

    pub fn host(ip: IpAddr) -> Self {
        let (af, addr) = PfAddr::from_ip(ip);
        Self { af, addr, mask: af.full_mask() }
    }

    pub fn contains(&self, af: Af, addr: PfAddr) -> bool {
        self.af == af && self.addr.matches(self.mask, addr)
    }

    pub fn prefix_len(&self) -> u8 {
        (self.mask.raw().count_ones()) as u8
    }

    /// Is this a single address rather than a network?
    pub fn is_host(&self) -> bool {
        self.mask == self.af.full_mask()
    }
}

impl FromStr for PfCidr {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let (ip_s, len) = match val.split_once('/') {
            Some((ip_s, len_s)) => {
                let len = len_s
                    .parse::<u8>()
                    .map_err(|e| format!("bad prefix length {len_s}: {e}"))?;
                (ip_s, Some(len))
            }
            None => (val, None),
        };

        let ip = ip_s
            .parse::<IpAddr>()
            .map_err(|e| format!("bad address {ip_s}: {e}"))?;

        match len {
            Some(len) => Self::new(ip, len),
            None => Ok(Self::host(ip)),
        }
    }
}

impl TryFrom<String> for PfCidr {
    type Error = String;

    fn try_from(val: String) -> Result<Self, Self::Error> {
        val.parse()
    }
}

impl From<PfCidr> for String {
    fn from(cidr: PfCidr) -> String {
        cidr.to_string()
    }
}

impl Display for PfCidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.addr.display(self.af))
        } else {
            write!(f, "{}/{}", self.addr.display(self.af), self.prefix_len())
        }
    }
}

/// An IP protocol value.
#[repr(u8)]
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
pub enum Protocol {
    ICMP,
    TCP,
    UDP,
    ICMPv6,
    Unknown(u8),
}

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ICMPV6: u8 = 0x3A;

impl Protocol {
    /// Does this protocol carry ports (or an ICMP query identifier
    /// standing in for one)?
    pub const fn has_ports(self) -> bool {
        matches!(self, Self::TCP | Self::UDP)
    }

    pub const fn is_icmp(self) -> bool {
        matches!(self, Self::ICMP | Self::ICMPv6)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPv6 => write!(f, "ICMPv6"),
            Self::Unknown(p) => write!(f, "{p}"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_ICMP => Self::ICMP,
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            PROTO_ICMPV6 => Self::ICMPv6,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::ICMP => PROTO_ICMP,
            Protocol::TCP => PROTO_TCP,
            Protocol::UDP => PROTO_UDP,
            Protocol::ICMPv6 => PROTO_ICMPV6,
            Protocol::Unknown(v) => v,
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::ICMP),
            "tcp" => Ok(Self::TCP),
            "udp" => Ok(Self::UDP),
            "icmp6" | "icmpv6" => Ok(Self::ICMPv6),
            num => num
                .parse::<u8>()
                .map(Self::from)
                .map_err(|_| format!("invalid protocol: {s}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_masks() {
        assert_eq!(PfAddr::prefix_mask(Af::Inet, 24).raw(), 0xFFFF_FF00);
        assert_eq!(PfAddr::prefix_mask(Af::Inet, 32).raw(), 0xFFFF_FFFF);
        assert_eq!(PfAddr::prefix_mask(Af::Inet, 0).raw(), 0);
        assert_eq!(
            PfAddr::prefix_mask(Af::Inet6, 64).raw(),
            0xFFFF_FFFF_FFFF_FFFF_0000_0000_0000_0000
        );
    }

    #[test]
    fn cidr_parse_and_contains() {
        let net: PfCidr = "10.0.0.0/8".parse().unwrap();
        let (af, inside) =
            PfAddr::from_ip("10.200.1.1".parse::<IpAddr>().unwrap());
        let (_, outside) =
            PfAddr::from_ip("11.0.0.1".parse::<IpAddr>().unwrap());
        assert!(net.contains(af, inside));
        assert!(!net.contains(af, outside));
        assert!(!net.contains(Af::Inet6, inside));
        assert_eq!(net.to_string(), "10.0.0.0/8");

        let host: PfCidr = "fd00::1".parse().unwrap();
        assert!(host.is_host());
        assert_eq!(host.to_string(), "fd00::1");
        assert!("10.0.0.0/33".parse::<PfCidr>().is_err());
    }

    #[test]
    fn poolmask_keeps_host_bits() {
        let r = PfAddr::from(Ipv4Addr::new(192, 0, 2, 0));
        let m = PfAddr::prefix_mask(Af::Inet, 24);
        let s = PfAddr::from(Ipv4Addr::new(10, 1, 2, 77));
        let n = PfAddr::poolmask(r, m, s, Af::Inet);
        assert_eq!(n, PfAddr::from(Ipv4Addr::new(192, 0, 2, 77)));
    }

    #[test]
    fn inc_wraps_within_family() {
        let a = PfAddr::from(Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(a.inc(Af::Inet), PfAddr::ANY);
        let b = PfAddr::from(Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(b.inc(Af::Inet), PfAddr::from(Ipv4Addr::new(10, 0, 1, 0)));
    }

    #[test]
    fn words_round_trip() {
        let (af, a) = PfAddr::from_ip("2001:db8::1:2".parse().unwrap());
        assert_eq!(PfAddr::from_words32(a.words32(af), af), a);
        let words: std::vec::Vec<u16> = a.csum_words(af).collect();
        assert_eq!(words, [0x2001, 0x0db8, 0, 0, 0, 0, 1, 2]);
    }
}
