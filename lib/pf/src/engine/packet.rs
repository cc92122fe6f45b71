// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The parsed view of a packet handed to the engine.
//!
//! The boundary layer (driver, normalizer, reassembler) is
//! responsible for turning bytes into a [`Packet`]. The engine reads
//! and rewrites the header fields held here; every rewrite updates the
//! affected checksums incrementally. The emit methods produce the
//! wire form of the headers, which is what full checksum recomputation
//! (and therefore verification of the incremental fixups) is based
//! on.

use super::checksum::Checksum;
use super::checksum::Fixup;
use super::checksum::ZeroPolicy;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use pf_api::Af;
use pf_api::FlowTuple;
use pf_api::HeaderSnapshot;
use pf_api::PfAddr;
use pf_api::Protocol;
use pf_api::TcpFlags;

pub const IPV4_HDR_SZ: usize = 20;
pub const IPV4_OPTS_SZ: usize = 4;
pub const IPV6_HDR_SZ: usize = 40;
pub const TCP_HDR_SZ: usize = 20;
pub const UDP_HDR_SZ: usize = 8;
pub const ICMP_HDR_SZ: usize = 8;
/// The number of transport header bytes quoted by an ICMP error.
pub const QUOTED_L4_SZ: usize = 8;

pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_MAXSEG: u8 = 2;
pub const TCPOPT_WINDOW: u8 = 3;
pub const TCPOPT_SACK: u8 = 5;
pub const TCP_MAX_WINSHIFT: u8 = 14;

pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_SOURCEQUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIMXCEED: u8 = 11;
pub const ICMP_PARAMPROB: u8 = 12;
pub const ICMP_UNREACH_PORT: u8 = 3;

pub const ICMP6_DST_UNREACH: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROB: u8 = 4;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ICMP6_DST_UNREACH_NOPORT: u8 = 4;

/// One end of a packet's flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Src,
    Dst,
}

/// IPv4 fragmentation fields. IPv6 fragments are presented to the
/// engine with the same fields filled in from the fragment header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Frag {
    /// Offset in 8-byte units.
    pub offset: u16,
    pub more: bool,
}

impl Frag {
    /// Is this any fragment other than the first?
    pub fn is_later_fragment(&self) -> bool {
        self.offset != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.offset != 0 || self.more
    }
}

/// Packet metadata supplied by (and handed back to) the boundary
/// layer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PacketMeta {
    /// The packet tag. Rules match on it and may set it; the engine
    /// writes the final tag back here.
    pub tag: u16,
    /// The egress queue of the interface is congested.
    pub congested: bool,
    /// The boundary layer found a bad transport checksum.
    pub bad_csum: bool,
    /// The packet was reassembled from fragments.
    pub reassembled: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpHdr {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset in 32-bit words.
    pub off: u8,
    pub flags: TcpFlags,
    pub win: u16,
    pub sum: u16,
    pub urp: u16,
    /// Raw option bytes, `(off - 5) * 4` of them.
    pub opts: Vec<u8>,
}

impl TcpHdr {
    pub fn new(sport: u16, dport: u16, flags: TcpFlags) -> Self {
        Self {
            sport,
            dport,
            seq: 0,
            ack: 0,
            off: 5,
            flags,
            win: 0,
            sum: 0,
            urp: 0,
            opts: Vec::new(),
        }
    }

    /// Set the options, padding them to a word boundary with EOL.
    pub fn set_opts(&mut self, mut opts: Vec<u8>) {
        while opts.len() % 4 != 0 {
            opts.push(TCPOPT_EOL);
        }
        self.off = (5 + opts.len() / 4) as u8;
        self.opts = opts;
    }

    pub fn hdr_len(&self) -> usize {
        usize::from(self.off) * 4
    }

    pub fn has_flag(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Walk the options, calling `f` with each option's kind and body
    /// (the bytes after the kind and length). Truncated options end
    /// the walk.
    fn walk_opts<F: FnMut(u8, &[u8])>(&self, min_len: usize, mut f: F) {
        let opts = &self.opts;
        let mut i = 0;
        while opts.len() - i >= min_len {
            match opts[i] {
                TCPOPT_EOL | TCPOPT_NOP => i += 1,
                kind => {
                    let olen = usize::from(opts[i + 1]).max(2);
                    let end = (i + olen).min(opts.len());
                    f(kind, &opts[i + 2..end]);
                    i += olen;
                    if i > opts.len() {
                        break;
                    }
                }
            }
        }
    }

    /// The window scale option, capped at the maximum shift.
    pub fn wscale(&self) -> Option<u8> {
        let mut wscale = None;
        self.walk_opts(3, |kind, body| {
            if kind == TCPOPT_WINDOW && !body.is_empty() {
                wscale = Some(body[0].min(TCP_MAX_WINSHIFT));
            }
        });
        wscale
    }

    /// The MSS option.
    pub fn mss(&self) -> Option<u16> {
        let mut mss = None;
        self.walk_opts(4, |kind, body| {
            if kind == TCPOPT_MAXSEG && body.len() >= 2 {
                mss = Some(u16::from_be_bytes([body[0], body[1]]));
            }
        });
        mss
    }

    fn emit(&self, zero_sum: bool, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sport.to_be_bytes());
        out.extend_from_slice(&self.dport.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.off << 4);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.win.to_be_bytes());
        let sum = if zero_sum { 0 } else { self.sum };
        out.extend_from_slice(&sum.to_be_bytes());
        out.extend_from_slice(&self.urp.to_be_bytes());
        out.extend_from_slice(&self.opts);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpHdr {
    pub sport: u16,
    pub dport: u16,
    pub sum: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IcmpHdr {
    pub ty: u8,
    pub code: u8,
    pub sum: u16,
    /// The identifier of a query; unused (and zero) for errors.
    pub id: u16,
    pub seq: u16,
    /// The header of the packet an error message refers to.
    pub inner: Option<Box<Quoted>>,
}

impl IcmpHdr {
    /// Is this an error message for the given family?
    pub fn is_error(&self, af: Af) -> bool {
        is_icmp_error(af, self.ty)
    }
}

/// Is `ty` one of the ICMP error types that quote the packet that
/// caused them?
pub fn is_icmp_error(af: Af, ty: u8) -> bool {
    match af {
        Af::Inet => matches!(
            ty,
            ICMP_UNREACH
                | ICMP_SOURCEQUENCH
                | ICMP_REDIRECT
                | ICMP_TIMXCEED
                | ICMP_PARAMPROB
        ),
        Af::Inet6 => matches!(
            ty,
            ICMP6_DST_UNREACH
                | ICMP6_PACKET_TOO_BIG
                | ICMP6_TIME_EXCEEDED
                | ICMP6_PARAM_PROB
        ),
    }
}

/// The transport bytes quoted by an ICMP error: only the first eight
/// bytes of the offending header are available.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotedL4 {
    Tcp { sport: u16, dport: u16, seq: u32 },
    Udp { sport: u16, dport: u16, len: u16, sum: u16 },
    Icmp { ty: u8, code: u8, sum: u16, id: u16, seq: u16 },
    None,
}

/// The IP header (plus transport prefix) embedded in an ICMP error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Quoted {
    pub af: Af,
    pub src: PfAddr,
    pub dst: PfAddr,
    pub proto: Protocol,
    pub tos: u8,
    pub ttl: u8,
    pub ip_id: u16,
    pub ip_sum: u16,
    /// The IPv4 total length or IPv6 payload length of the quoted
    /// packet.
    pub ip_len: u16,
    pub frag_off: u16,
    pub l4: QuotedL4,
}

impl Quoted {
    /// The header an ICMP error about `pkt` would quote.
    pub fn of(pkt: &Packet) -> Self {
        let l4 = match &pkt.l4 {
            L4::Tcp(t) => {
                QuotedL4::Tcp { sport: t.sport, dport: t.dport, seq: t.seq }
            }
            L4::Udp(u) => QuotedL4::Udp {
                sport: u.sport,
                dport: u.dport,
                len: (UDP_HDR_SZ + pkt.payload.len()) as u16,
                sum: u.sum,
            },
            L4::Icmp(i) => QuotedL4::Icmp {
                ty: i.ty,
                code: i.code,
                sum: i.sum,
                id: i.id,
                seq: i.seq,
            },
            L4::None => QuotedL4::None,
        };
        let ip_len = match pkt.af {
            Af::Inet => pkt.len(),
            Af::Inet6 => pkt.len() - IPV6_HDR_SZ,
        };
        let more = if pkt.frag.more { 0x2000 } else { 0 };
        Self {
            af: pkt.af,
            src: pkt.src,
            dst: pkt.dst,
            proto: pkt.proto,
            tos: pkt.tos,
            ttl: pkt.ttl,
            ip_id: pkt.ip_id,
            ip_sum: pkt.ip_sum,
            ip_len: ip_len as u16,
            frag_off: more | pkt.frag.offset,
            l4,
        }
    }

    pub fn port(&self, e: Endpoint) -> u16 {
        match (self.l4, e) {
            (QuotedL4::Tcp { sport, .. }, Endpoint::Src) => sport,
            (QuotedL4::Tcp { dport, .. }, Endpoint::Dst) => dport,
            (QuotedL4::Udp { sport, .. }, Endpoint::Src) => sport,
            (QuotedL4::Udp { dport, .. }, Endpoint::Dst) => dport,
            (QuotedL4::Icmp { id, .. }, _) => id,
            (QuotedL4::None, _) => 0,
        }
    }

    pub fn addr(&self, e: Endpoint) -> PfAddr {
        match e {
            Endpoint::Src => self.src,
            Endpoint::Dst => self.dst,
        }
    }

    /// Change the address at one end, keeping the quoted IPv4 header
    /// checksum and any quoted transport checksum over it in step.
    fn set_addr(&mut self, e: Endpoint, addr: PfAddr) {
        let old = self.addr(e);
        if old == addr {
            return;
        }
        let af = self.af;
        if af == Af::Inet {
            self.ip_sum = Fixup::new(self.ip_sum, ZeroPolicy::Normal)
                .addr(af, old, addr)
                .finish(self.ip_sum);
        }
        match &mut self.l4 {
            QuotedL4::Udp { sum, .. } => {
                *sum = Fixup::new(*sum, ZeroPolicy::Udp)
                    .addr(af, old, addr)
                    .finish(*sum);
            }
            QuotedL4::Icmp { sum, .. } if af == Af::Inet6 => {
                *sum = Fixup::new(*sum, ZeroPolicy::Normal)
                    .addr(af, old, addr)
                    .finish(*sum);
            }
            _ => {}
        }
        match e {
            Endpoint::Src => self.src = addr,
            Endpoint::Dst => self.dst = addr,
        }
    }

    /// Change the port at one end; for a quoted ICMP query, the
    /// identifier.
    fn set_port(&mut self, e: Endpoint, port: u16) {
        match (&mut self.l4, e) {
            (QuotedL4::Tcp { sport, .. }, Endpoint::Src) => *sport = port,
            (QuotedL4::Tcp { dport, .. }, Endpoint::Dst) => *dport = port,
            (QuotedL4::Udp { sport, sum, .. }, Endpoint::Src) => {
                *sum = Fixup::new(*sum, ZeroPolicy::Udp)
                    .u16(*sport, port)
                    .finish(*sum);
                *sport = port;
            }
            (QuotedL4::Udp { dport, sum, .. }, Endpoint::Dst) => {
                *sum = Fixup::new(*sum, ZeroPolicy::Udp)
                    .u16(*dport, port)
                    .finish(*sum);
                *dport = port;
            }
            (QuotedL4::Icmp { id, sum, .. }, _) => {
                *sum = Fixup::new(*sum, ZeroPolicy::Normal)
                    .u16(*id, port)
                    .finish(*sum);
                *id = port;
            }
            (QuotedL4::None, _) => {}
        }
    }

    fn emit_ip(&self, zero_sum: bool, out: &mut Vec<u8>) {
        let proto = u8::from(self.proto);
        match self.af {
            Af::Inet => {
                out.push(0x45);
                out.push(self.tos);
                out.extend_from_slice(&self.ip_len.to_be_bytes());
                out.extend_from_slice(&self.ip_id.to_be_bytes());
                out.extend_from_slice(&self.frag_off.to_be_bytes());
                out.push(self.ttl);
                out.push(proto);
                let sum = if zero_sum { 0 } else { self.ip_sum };
                out.extend_from_slice(&sum.to_be_bytes());
                out.extend_from_slice(&(self.src.raw() as u32).to_be_bytes());
                out.extend_from_slice(&(self.dst.raw() as u32).to_be_bytes());
            }
            Af::Inet6 => {
                let vtc = 0x6000_0000u32 | (u32::from(self.tos) << 20);
                out.extend_from_slice(&vtc.to_be_bytes());
                out.extend_from_slice(&self.ip_len.to_be_bytes());
                out.push(proto);
                out.push(self.ttl);
                out.extend_from_slice(&self.src.raw().to_be_bytes());
                out.extend_from_slice(&self.dst.raw().to_be_bytes());
            }
        }
    }

    fn emit(&self, out: &mut Vec<u8>) {
        self.emit_ip(false, out);
        match self.l4 {
            QuotedL4::Tcp { sport, dport, seq } => {
                out.extend_from_slice(&sport.to_be_bytes());
                out.extend_from_slice(&dport.to_be_bytes());
                out.extend_from_slice(&seq.to_be_bytes());
            }
            QuotedL4::Udp { sport, dport, len, sum } => {
                out.extend_from_slice(&sport.to_be_bytes());
                out.extend_from_slice(&dport.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&sum.to_be_bytes());
            }
            QuotedL4::Icmp { ty, code, sum, id, seq } => {
                out.push(ty);
                out.push(code);
                out.extend_from_slice(&sum.to_be_bytes());
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&seq.to_be_bytes());
            }
            QuotedL4::None => out.extend_from_slice(&[0u8; QUOTED_L4_SZ]),
        }
    }

    /// The IPv4 header checksum of the quoted header.
    pub fn compute_ip_sum(&self) -> u16 {
        let mut bytes = Vec::with_capacity(IPV4_HDR_SZ);
        self.emit_ip(true, &mut bytes);
        Checksum::compute(&bytes).header_value()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum L4 {
    Tcp(TcpHdr),
    Udp(UdpHdr),
    Icmp(IcmpHdr),
    None,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub af: Af,
    pub src: PfAddr,
    pub dst: PfAddr,
    pub proto: Protocol,
    pub tos: u8,
    pub ttl: u8,
    pub ip_id: u16,
    /// The IPv4 header checksum. Unused for IPv6.
    pub ip_sum: u16,
    /// The IPv4 header carries options.
    pub ip_opts: bool,
    pub frag: Frag,
    pub l4: L4,
    pub payload: Vec<u8>,
    pub meta: PacketMeta,
}

impl Packet {
    /// Build a packet with valid checksums.
    pub fn new(
        af: Af,
        src: PfAddr,
        dst: PfAddr,
        proto: Protocol,
        l4: L4,
        payload: Vec<u8>,
    ) -> Self {
        let mut pkt = Self {
            af,
            src,
            dst,
            proto,
            tos: 0,
            ttl: 64,
            ip_id: 0,
            ip_sum: 0,
            ip_opts: false,
            frag: Frag::default(),
            l4,
            payload,
            meta: PacketMeta::default(),
        };
        pkt.fill_checksums();
        pkt
    }

    pub fn ip_hdr_len(&self) -> usize {
        match self.af {
            Af::Inet if self.ip_opts => IPV4_HDR_SZ + IPV4_OPTS_SZ,
            Af::Inet => IPV4_HDR_SZ,
            Af::Inet6 => IPV6_HDR_SZ,
        }
    }

    /// The length of the transport header.
    pub fn l4_hdr_len(&self) -> usize {
        match &self.l4 {
            L4::Tcp(tcp) => tcp.hdr_len(),
            L4::Udp(_) => UDP_HDR_SZ,
            L4::Icmp(icmp) => {
                let quoted = match &icmp.inner {
                    Some(q) => quoted_ip_len(q.af) + QUOTED_L4_SZ,
                    None => 0,
                };
                ICMP_HDR_SZ + quoted
            }
            L4::None => 0,
        }
    }

    pub fn l4_len(&self) -> usize {
        self.l4_hdr_len() + self.payload.len()
    }

    /// The total length of the packet.
    pub fn len(&self) -> usize {
        self.ip_hdr_len() + self.l4_len()
    }

    /// The transport payload length: for TCP the number of sequence
    /// bytes the segment carries, excluding SYN and FIN.
    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn tcp(&self) -> Option<&TcpHdr> {
        match &self.l4 {
            L4::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpHdr> {
        match &mut self.l4 {
            L4::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpHdr> {
        match &self.l4 {
            L4::Icmp(icmp) => Some(icmp),
            _ => None,
        }
    }

    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        self.tcp().map(|t| t.flags)
    }

    /// Is this an ICMP error message quoting another packet?
    pub fn is_icmp_error(&self) -> bool {
        self.icmp().is_some_and(|i| i.is_error(self.af))
    }

    /// The ICMP type and code, if this is ICMP of the packet's own
    /// family.
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        if self.proto != self.af.icmp_proto() {
            return None;
        }
        self.icmp().map(|i| (i.ty, i.code))
    }

    pub fn addr(&self, e: Endpoint) -> PfAddr {
        match e {
            Endpoint::Src => self.src,
            Endpoint::Dst => self.dst,
        }
    }

    /// The port at the given end, if the protocol has ports. ICMP
    /// queries use their identifier as both ports.
    pub fn port(&self, e: Endpoint) -> Option<u16> {
        match (&self.l4, e) {
            (L4::Tcp(t), Endpoint::Src) => Some(t.sport),
            (L4::Tcp(t), Endpoint::Dst) => Some(t.dport),
            (L4::Udp(u), Endpoint::Src) => Some(u.sport),
            (L4::Udp(u), Endpoint::Dst) => Some(u.dport),
            (L4::Icmp(i), _) if self.proto == self.af.icmp_proto() => {
                Some(i.id)
            }
            _ => None,
        }
    }

    pub fn sport(&self) -> Option<u16> {
        self.port(Endpoint::Src)
    }

    pub fn dport(&self) -> Option<u16> {
        self.port(Endpoint::Dst)
    }

    /// The flow as seen in this packet.
    pub fn tuple(&self) -> FlowTuple {
        FlowTuple {
            af: self.af,
            proto: self.proto,
            src: self.src,
            dst: self.dst,
            sport: self.sport().unwrap_or(0),
            dport: self.dport().unwrap_or(0),
        }
    }

    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            tuple: self.tuple(),
            len: self.len() as u16,
            tcp_flags: self.tcp_flags(),
            tos: self.tos,
        }
    }

    /// Does the transport checksum include the IP pseudo header?
    fn l4_pseudo(&self) -> bool {
        match &self.l4 {
            L4::Tcp(_) | L4::Udp(_) => true,
            L4::Icmp(_) => self.af == Af::Inet6,
            L4::None => false,
        }
    }

    fn l4_policy(&self) -> ZeroPolicy {
        match self.l4 {
            L4::Udp(_) => ZeroPolicy::Udp,
            _ => ZeroPolicy::Normal,
        }
    }

    /// Rewrite the address and port at one end of the flow, fixing up
    /// the IP and transport checksums incrementally. A port is ignored
    /// for protocols without ports; for ICMP queries it replaces the
    /// identifier.
    pub fn rewrite(&mut self, e: Endpoint, addr: PfAddr, port: u16) {
        self.rewrite_addr(e, addr);
        self.rewrite_port(e, port);
    }

    /// Rewrite only the address at one end.
    pub fn rewrite_addr(&mut self, e: Endpoint, addr: PfAddr) {
        let old = self.addr(e);
        if old == addr {
            return;
        }
        if self.af == Af::Inet {
            self.ip_sum = Fixup::new(self.ip_sum, ZeroPolicy::Normal)
                .addr(self.af, old, addr)
                .finish(self.ip_sum);
        }
        if self.l4_pseudo() {
            let (af, policy) = (self.af, self.l4_policy());
            if let Some(sum) = self.l4_sum_mut() {
                *sum =
                    Fixup::new(*sum, policy).addr(af, old, addr).finish(*sum);
            }
        }
        match e {
            Endpoint::Src => self.src = addr,
            Endpoint::Dst => self.dst = addr,
        }
    }

    fn rewrite_port(&mut self, e: Endpoint, port: u16) {
        let Some(old_port) = self.port(e) else {
            return;
        };
        if old_port == port {
            return;
        }
        match &mut self.l4 {
            L4::Tcp(t) => {
                t.sum = Fixup::new(t.sum, ZeroPolicy::Normal)
                    .u16(old_port, port)
                    .finish(t.sum);
                match e {
                    Endpoint::Src => t.sport = port,
                    Endpoint::Dst => t.dport = port,
                }
            }
            L4::Udp(u) => {
                u.sum = Fixup::new(u.sum, ZeroPolicy::Udp)
                    .u16(old_port, port)
                    .finish(u.sum);
                match e {
                    Endpoint::Src => u.sport = port,
                    Endpoint::Dst => u.dport = port,
                }
            }
            L4::Icmp(i) => {
                i.sum = Fixup::new(i.sum, ZeroPolicy::Normal)
                    .u16(i.id, port)
                    .finish(i.sum);
                i.id = port;
            }
            L4::None => {}
        }
    }

    /// The header quoted by an ICMP error.
    pub fn quoted(&self) -> Option<&Quoted> {
        self.icmp().and_then(|i| i.inner.as_deref())
    }

    /// Apply `f` to the quoted header, folding whatever it changes
    /// into the ICMP checksum. Returns false if there is no quoted
    /// header.
    fn update_quoted<F: FnOnce(&mut Quoted)>(&mut self, f: F) -> bool {
        let L4::Icmp(icmp) = &mut self.l4 else {
            return false;
        };
        let Some(q) = icmp.inner.as_deref_mut() else {
            return false;
        };
        let mut before = Vec::with_capacity(IPV6_HDR_SZ + QUOTED_L4_SZ);
        q.emit(&mut before);
        f(q);
        let mut after = Vec::with_capacity(before.len());
        q.emit(&mut after);
        if before != after {
            icmp.sum = Fixup::new(icmp.sum, ZeroPolicy::Normal)
                .bytes(&before, &after)
                .finish(icmp.sum);
        }
        true
    }

    /// Rewrite one end of the flow quoted by an ICMP error. If `outer`
    /// is given, the same address replaces the outer header's address
    /// at that end.
    pub fn rewrite_quoted(
        &mut self,
        e: Endpoint,
        addr: PfAddr,
        port: u16,
        outer: Option<Endpoint>,
    ) {
        self.update_quoted(|q| {
            q.set_port(e, port);
            q.set_addr(e, addr);
        });
        if let Some(o) = outer {
            self.rewrite_addr(o, addr);
        }
    }

    /// Replace the sequence number of a quoted TCP header.
    pub fn set_quoted_seq(&mut self, seq: u32) {
        self.update_quoted(|q| {
            if let QuotedL4::Tcp { seq: s, .. } = &mut q.l4 {
                *s = seq;
            }
        });
    }

    fn l4_sum_mut(&mut self) -> Option<&mut u16> {
        match &mut self.l4 {
            L4::Tcp(t) => Some(&mut t.sum),
            L4::Udp(u) => Some(&mut u.sum),
            L4::Icmp(i) => Some(&mut i.sum),
            L4::None => None,
        }
    }

    /// Replace the TCP sequence number, fixing up the checksum.
    pub fn set_tcp_seq(&mut self, seq: u32) {
        if let Some(t) = self.tcp_mut() {
            if t.seq != seq {
                t.sum = Fixup::new(t.sum, ZeroPolicy::Normal)
                    .u32(t.seq, seq)
                    .finish(t.sum);
                t.seq = seq;
            }
        }
    }

    /// Replace the TCP acknowledgement number, fixing up the checksum.
    pub fn set_tcp_ack(&mut self, ack: u32) {
        if let Some(t) = self.tcp_mut() {
            if t.ack != ack {
                t.sum = Fixup::new(t.sum, ZeroPolicy::Normal)
                    .u32(t.ack, ack)
                    .finish(t.sum);
                t.ack = ack;
            }
        }
    }

    /// Shift every SACK block edge down by `seqdiff`, fixing up the
    /// checksum. Returns whether any block was rewritten.
    pub fn modulate_sack(&mut self, seqdiff: u32) -> bool {
        const SACK_BLK: usize = 8;
        let Some(t) = self.tcp_mut() else {
            return false;
        };
        let mut fix = Fixup::new(t.sum, ZeroPolicy::Normal);
        let mut changed = false;
        let opts = &mut t.opts;
        let mut i = 0;
        while opts.len().saturating_sub(i) >= SACK_BLK + 2 {
            match opts[i] {
                TCPOPT_EOL | TCPOPT_NOP => i += 1,
                kind => {
                    let mut olen = usize::from(opts[i + 1]);
                    if kind == TCPOPT_SACK {
                        olen = olen.min(opts.len() - i);
                        let mut j = 2;
                        while j + SACK_BLK <= olen {
                            for edge in [i + j, i + j + 4] {
                                let b = &mut opts[edge..edge + 4];
                                let old = u32::from_be_bytes([
                                    b[0], b[1], b[2], b[3],
                                ]);
                                let new = old.wrapping_sub(seqdiff);
                                b.copy_from_slice(&new.to_be_bytes());
                                fix.u32(old, new);
                            }
                            j += SACK_BLK;
                            changed = true;
                        }
                    }
                    i += olen.max(2);
                }
            }
        }
        if changed {
            t.sum = fix.finish(t.sum);
        }
        changed
    }

    /// Emit the IP header as it would appear on the wire.
    pub fn emit_ip(&self, zero_sum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ip_hdr_len());
        let proto = u8::from(self.proto);
        match self.af {
            Af::Inet => {
                let ihl = (self.ip_hdr_len() / 4) as u8;
                out.push(0x40 | ihl);
                out.push(self.tos);
                out.extend_from_slice(&(self.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.ip_id.to_be_bytes());
                let mut frag = self.frag.offset & 0x1FFF;
                if self.frag.more {
                    frag |= 0x2000;
                }
                out.extend_from_slice(&frag.to_be_bytes());
                out.push(self.ttl);
                out.push(proto);
                let sum = if zero_sum { 0 } else { self.ip_sum };
                out.extend_from_slice(&sum.to_be_bytes());
                out.extend_from_slice(&(self.src.raw() as u32).to_be_bytes());
                out.extend_from_slice(&(self.dst.raw() as u32).to_be_bytes());
                if self.ip_opts {
                    out.extend_from_slice(&[
                        TCPOPT_NOP, TCPOPT_NOP, TCPOPT_NOP, TCPOPT_EOL,
                    ]);
                }
            }
            Af::Inet6 => {
                let vtc = 0x6000_0000u32 | (u32::from(self.tos) << 20);
                out.extend_from_slice(&vtc.to_be_bytes());
                out.extend_from_slice(&(self.l4_len() as u16).to_be_bytes());
                out.push(proto);
                out.push(self.ttl);
                out.extend_from_slice(&self.src.raw().to_be_bytes());
                out.extend_from_slice(&self.dst.raw().to_be_bytes());
            }
        }
        out
    }

    /// Emit the transport header and payload as they would appear on
    /// the wire.
    pub fn emit_l4(&self, zero_sum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.l4_len());
        match &self.l4 {
            L4::Tcp(t) => t.emit(zero_sum, &mut out),
            L4::Udp(u) => {
                out.extend_from_slice(&u.sport.to_be_bytes());
                out.extend_from_slice(&u.dport.to_be_bytes());
                out.extend_from_slice(&(self.l4_len() as u16).to_be_bytes());
                let sum = if zero_sum { 0 } else { u.sum };
                out.extend_from_slice(&sum.to_be_bytes());
            }
            L4::Icmp(i) => {
                out.push(i.ty);
                out.push(i.code);
                let sum = if zero_sum { 0 } else { i.sum };
                out.extend_from_slice(&sum.to_be_bytes());
                out.extend_from_slice(&i.id.to_be_bytes());
                out.extend_from_slice(&i.seq.to_be_bytes());
                if let Some(q) = &i.inner {
                    q.emit(&mut out);
                }
            }
            L4::None => {}
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Compute the IPv4 header checksum from scratch.
    pub fn compute_ip_sum(&self) -> u16 {
        Checksum::compute(&self.emit_ip(true)).header_value()
    }

    /// Compute the transport checksum from scratch, or `None` for
    /// protocols the engine does not checksum.
    pub fn compute_l4_sum(&self) -> Option<u16> {
        if matches!(self.l4, L4::None) {
            return None;
        }
        let mut csum = Checksum::new();
        if self.l4_pseudo() {
            csum.add_addr(self.af, self.src);
            csum.add_addr(self.af, self.dst);
            csum.add_u16(u16::from(u8::from(self.proto)));
            csum.add_u32(self.l4_len() as u32);
        }
        csum.add_bytes(&self.emit_l4(true));
        let val = csum.header_value();
        Some(match self.l4 {
            L4::Udp(_) if val == 0 => 0xFFFF,
            _ => val,
        })
    }

    /// Recompute every checksum, including that of a quoted header.
    pub fn fill_checksums(&mut self) {
        if let L4::Icmp(IcmpHdr { inner: Some(q), .. }) = &mut self.l4 {
            if q.af == Af::Inet {
                q.ip_sum = q.compute_ip_sum();
            }
        }
        if self.af == Af::Inet {
            self.ip_sum = self.compute_ip_sum();
        }
        if let Some(sum) = self.compute_l4_sum() {
            if let Some(field) = self.l4_sum_mut() {
                *field = sum;
            }
        }
    }

    /// Do the stored checksums agree with a full recomputation? A zero
    /// UDP checksum is always acceptable.
    pub fn checksums_ok(&self) -> bool {
        if self.af == Af::Inet && self.ip_sum != self.compute_ip_sum() {
            return false;
        }
        let stored = match &self.l4 {
            L4::Tcp(t) => t.sum,
            L4::Udp(u) if u.sum == 0 => return true,
            L4::Udp(u) => u.sum,
            L4::Icmp(i) => i.sum,
            L4::None => return true,
        };
        self.compute_l4_sum() == Some(stored)
    }
}

/// The length of a quoted IP header of the given family.
pub fn quoted_ip_len(af: Af) -> usize {
    match af {
        Af::Inet => IPV4_HDR_SZ,
        Af::Inet6 => IPV6_HDR_SZ,
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} len={}", self.tuple(), self.len())?;
        if let Some(flags) = self.tcp_flags() {
            write!(f, " flags={flags}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> PfAddr {
        PfAddr::from(Ipv4Addr::new(a, b, c, d))
    }

    fn syn() -> Packet {
        let mut tcp = TcpHdr::new(4000, 80, TcpFlags::SYN);
        tcp.seq = 1000;
        tcp.win = 8192;
        tcp.set_opts(vec![
            TCPOPT_MAXSEG,
            4,
            0x05,
            0xb4,
            TCPOPT_NOP,
            TCPOPT_WINDOW,
            3,
            7,
        ]);
        Packet::new(
            Af::Inet,
            v4(10, 0, 0, 5),
            v4(93, 1, 1, 1),
            Protocol::TCP,
            L4::Tcp(tcp),
            vec![],
        )
    }

    #[test]
    fn tcp_options() {
        let pkt = syn();
        let tcp = pkt.tcp().unwrap();
        assert_eq!(tcp.off, 7);
        assert_eq!(tcp.mss(), Some(1460));
        assert_eq!(tcp.wscale(), Some(7));
        assert_eq!(pkt.len(), 20 + 28);
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn wscale_is_capped() {
        let mut tcp = TcpHdr::new(1, 2, TcpFlags::SYN);
        tcp.set_opts(vec![TCPOPT_WINDOW, 3, 20]);
        assert_eq!(tcp.wscale(), Some(TCP_MAX_WINSHIFT));
        assert_eq!(TcpHdr::new(1, 2, TcpFlags::SYN).wscale(), None);
    }

    #[test]
    fn rewrite_keeps_checksums_valid() {
        let mut pkt = syn();
        pkt.rewrite(Endpoint::Src, v4(192, 0, 2, 1), 50001);
        assert_eq!(pkt.src, v4(192, 0, 2, 1));
        assert_eq!(pkt.sport(), Some(50001));
        assert!(pkt.checksums_ok());

        pkt.set_tcp_seq(0xdead_beef);
        pkt.set_tcp_ack(77);
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn udp_rewrite_with_zero_checksum() {
        let udp = UdpHdr { sport: 53, dport: 5353, sum: 0 };
        let mut pkt = Packet::new(
            Af::Inet,
            v4(10, 0, 0, 1),
            v4(10, 0, 0, 2),
            Protocol::UDP,
            L4::Udp(udp),
            vec![1, 2, 3],
        );
        // Clear the computed checksum: the sender opted out.
        if let L4::Udp(u) = &mut pkt.l4 {
            u.sum = 0;
        }
        pkt.rewrite(Endpoint::Dst, v4(10, 0, 0, 9), 53);
        assert!(matches!(pkt.l4, L4::Udp(UdpHdr { sum: 0, .. })));
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn icmp_v6_rewrite_covers_pseudo_header() {
        let (_, a) = PfAddr::from_ip("fd00::1".parse().unwrap());
        let (_, b) = PfAddr::from_ip("fd00::2".parse().unwrap());
        let (_, c) = PfAddr::from_ip("2001:db8::7".parse().unwrap());
        let icmp = IcmpHdr {
            ty: ICMP6_ECHO_REQUEST,
            code: 0,
            sum: 0,
            id: 99,
            seq: 1,
            inner: None,
        };
        let mut pkt = Packet::new(
            Af::Inet6,
            a,
            b,
            Protocol::ICMPv6,
            L4::Icmp(icmp),
            vec![0xaa; 16],
        );
        pkt.rewrite(Endpoint::Src, c, 1234);
        assert_eq!(pkt.sport(), Some(1234));
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn sack_modulation() {
        let mut pkt = syn();
        let mut opts = vec![TCPOPT_NOP, TCPOPT_NOP, TCPOPT_SACK, 10];
        opts.extend_from_slice(&5000u32.to_be_bytes());
        opts.extend_from_slice(&6000u32.to_be_bytes());
        pkt.tcp_mut().unwrap().set_opts(opts);
        pkt.fill_checksums();

        assert!(pkt.modulate_sack(1000));
        let t = pkt.tcp().unwrap();
        assert_eq!(&t.opts[4..8], &4000u32.to_be_bytes());
        assert_eq!(&t.opts[8..12], &5000u32.to_be_bytes());
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn quoted_rewrite_keeps_checksums_valid() {
        // A port unreachable from 198.51.100.1 about a UDP datagram
        // that went out as 192.0.2.1:50001 -> 203.0.113.5:53.
        let mut quoted = Quoted {
            af: Af::Inet,
            src: v4(192, 0, 2, 1),
            dst: v4(203, 0, 113, 5),
            proto: Protocol::UDP,
            tos: 0,
            ttl: 63,
            ip_id: 7,
            ip_sum: 0,
            ip_len: 40,
            frag_off: 0,
            l4: QuotedL4::Udp { sport: 50001, dport: 53, len: 20, sum: 0x1c46 },
        };
        quoted.ip_sum = quoted.compute_ip_sum();
        let icmp = IcmpHdr {
            ty: ICMP_UNREACH,
            code: ICMP_UNREACH_PORT,
            sum: 0,
            id: 0,
            seq: 0,
            inner: Some(Box::new(quoted)),
        };
        let mut pkt = Packet::new(
            Af::Inet,
            v4(198, 51, 100, 1),
            v4(192, 0, 2, 1),
            Protocol::ICMP,
            L4::Icmp(icmp),
            vec![],
        );

        pkt.rewrite_quoted(
            Endpoint::Src,
            v4(10, 0, 0, 5),
            4000,
            Some(Endpoint::Dst),
        );
        let q = pkt.quoted().unwrap();
        assert_eq!(q.src, v4(10, 0, 0, 5));
        assert_eq!(q.port(Endpoint::Src), 4000);
        assert_eq!(q.ip_sum, q.compute_ip_sum());
        assert_eq!(pkt.dst, v4(10, 0, 0, 5));
        assert!(pkt.checksums_ok());

        pkt.rewrite_quoted(Endpoint::Dst, v4(203, 0, 113, 6), 5353, None);
        assert_eq!(pkt.src, v4(198, 51, 100, 1));
        assert!(pkt.checksums_ok());
    }

    #[test]
    fn ip_options_lengthen_header() {
        let mut pkt = syn();
        pkt.ip_opts = true;
        pkt.fill_checksums();
        assert_eq!(pkt.ip_hdr_len(), 24);
        assert_eq!(pkt.emit_ip(false)[0], 0x46);
        assert!(pkt.checksums_ok());
    }
}
