// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMP errors.
//!
//! An ICMP error belongs to the connection whose packet it quotes.
//! The quoted packet travelled the opposite way to the error, so its
//! key is built for the reverse direction and then looked up as if
//! for the error's own direction. When that connection is translated
//! the quoted header is rewritten along with the outer address that
//! names the same endpoint.

use super::packet::Endpoint;
use super::packet::Packet;
use super::packet::QuotedL4;
use super::packet::is_icmp_error;
use super::state::State;
use super::state::StateFlags;
use super::state::StateKey;
use super::state::didx;
use super::state::sidx;
use super::tcp_state::seq_geq;
use super::track::Verdict;
use super::track::load;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use pf_api::Direction;
use pf_api::Reason;

/// The key of the flow quoted by an ICMP error travelling in `dir`.
/// Errors quoting other errors belong to no flow.
pub fn quoted_key(pkt: &Packet, dir: Direction) -> Option<StateKey> {
    let q = pkt.quoted()?;
    if let QuotedL4::Icmp { ty, .. } = q.l4 {
        if is_icmp_error(q.af, ty) {
            return None;
        }
    }
    Some(StateKey::new(
        q.af,
        q.proto,
        (q.src, q.port(Endpoint::Src)),
        (q.dst, q.port(Endpoint::Dst)),
        dir.reverse(),
    ))
}

/// Check an ICMP error against the state of the flow it quotes and
/// translate it into the view of the side it is heading to.
pub fn track_error(
    st: &State,
    pkt: &mut Packet,
    dir: Direction,
    log: &dyn LogProvider,
) -> Verdict {
    let Some(q) = pkt.quoted() else {
        return Verdict::Drop(Reason::Short);
    };
    let qdir = dir.reverse();

    if let QuotedL4::Tcp { seq, .. } = q.l4 {
        let (src, dst) = load(st, qdir);
        let dws = match (src.wscale, dst.wscale) {
            (Some(_), Some(d)) => d,
            _ => 0,
        };
        let seq = seq.wrapping_sub(src.seqdiff);
        if src.seqdiff != 0 {
            pkt.set_quoted_seq(seq);
        }
        let floor = src.seqlo.wrapping_sub(u32::from(dst.max_win) << dws);
        if !st.flags.contains(StateFlags::SLOPPY)
            && (!seq_geq(src.seqhi, seq) || !seq_geq(seq, floor))
        {
            log.log(
                LogLevel::Debug,
                &format!(
                    "bad icmp error {}: quoted seq={seq} outside {}..{}",
                    st.key[0], floor, src.seqhi
                ),
            );
            return Verdict::Drop(Reason::BadState);
        }
    }

    if st.is_translated() {
        let Some(q) = pkt.quoted() else {
            return Verdict::Drop(Reason::Short);
        };
        let nk = st.key[didx(dir)];
        let (qs, qd) = (sidx(qdir), didx(qdir));
        let (src, sport) = (q.src, q.port(Endpoint::Src));
        let (dst, dport) = (q.dst, q.port(Endpoint::Dst));
        if src != nk.addr[qs] || sport != nk.port[qs] {
            pkt.rewrite_quoted(
                Endpoint::Src,
                nk.addr[qs],
                nk.port[qs],
                Some(Endpoint::Dst),
            );
        }
        if dst != nk.addr[qd] || dport != nk.port[qd] {
            pkt.rewrite_quoted(
                Endpoint::Dst,
                nk.addr[qd],
                nk.port[qd],
                Some(Endpoint::Src),
            );
        }
    }
    Verdict::Pass
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::ICMP_TIMXCEED;
    use crate::engine::packet::ICMP_UNREACH;
    use crate::engine::packet::ICMP_UNREACH_PORT;
    use crate::engine::packet::IcmpHdr;
    use crate::engine::packet::L4;
    use crate::engine::packet::Quoted;
    use crate::engine::packet::TcpHdr;
    use crate::engine::packet::UdpHdr;
    use crate::engine::rule::Rule;
    use crate::engine::state::StateTable;
    use crate::provider::PrintlnLog;
    use alloc::sync::Arc;
    use core::net::Ipv4Addr;
    use pf_api::Af;
    use pf_api::PfAddr;
    use pf_api::Protocol;
    use pf_api::TcpFlags;

    fn v4(s: &str) -> PfAddr {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    fn error_about(from: &str, orig: &Packet, ty: u8, code: u8) -> Packet {
        let icmp = IcmpHdr {
            ty,
            code,
            sum: 0,
            id: 0,
            seq: 0,
            inner: Some(Box::new(Quoted::of(orig))),
        };
        Packet::new(
            Af::Inet,
            v4(from),
            orig.src,
            Protocol::ICMP,
            L4::Icmp(icmp),
            vec![],
        )
    }

    #[test]
    fn error_reaches_translated_source() {
        // 10.0.0.5:4000 went out as 192.0.2.1:50001.
        let (remote, port) = (v4("203.0.113.5"), 53);
        let wire = StateKey::new(
            Af::Inet,
            Protocol::UDP,
            (v4("192.0.2.1"), 50001),
            (remote, port),
            Direction::Out,
        );
        let stack = StateKey::new(
            Af::Inet,
            Protocol::UDP,
            (v4("10.0.0.5"), 4000),
            (remote, port),
            Direction::Out,
        );
        let rule = Arc::new(Rule::pass());
        let st = State::new([wire, stack], Direction::Out, rule, 0);
        let mut tbl = StateTable::new();
        let (sref, _) = tbl.insert(st).unwrap();

        let sent = Packet::new(
            Af::Inet,
            v4("192.0.2.1"),
            remote,
            Protocol::UDP,
            L4::Udp(UdpHdr { sport: 50001, dport: port, sum: 0 }),
            vec![1, 2, 3, 4],
        );
        let mut err =
            error_about("198.51.100.1", &sent, ICMP_UNREACH, ICMP_UNREACH_PORT);

        let key = quoted_key(&err, Direction::In).unwrap();
        assert_eq!(key, wire);
        let found = tbl.lookup(&key, Direction::In, "em0").unwrap();
        assert!(Arc::ptr_eq(&found, &sref));

        let st = found.lock();
        let v = track_error(&st, &mut err, Direction::In, &PrintlnLog);
        assert_eq!(v, Verdict::Pass);
        let q = err.quoted().unwrap();
        assert_eq!((q.src, q.port(Endpoint::Src)), (v4("10.0.0.5"), 4000));
        assert_eq!((q.dst, q.port(Endpoint::Dst)), (remote, port));
        assert_eq!(err.dst, v4("10.0.0.5"));
        assert_eq!(err.src, v4("198.51.100.1"));
        assert!(err.checksums_ok());
    }

    #[test]
    fn quoted_sequence_must_be_in_window() {
        let (client, server) = (v4("10.0.0.5"), v4("203.0.113.5"));
        let key = StateKey::new(
            Af::Inet,
            Protocol::TCP,
            (client, 4000),
            (server, 80),
            Direction::Out,
        );
        let mut st =
            State::new([key, key], Direction::Out, Arc::new(Rule::pass()), 0);
        st.src.seqlo = 1000;
        st.src.seqhi = 1000 + 65535;
        st.dst.seqlo = 5000;
        st.dst.max_win = 8192;

        let segment = |seq: u32| {
            let mut t = TcpHdr::new(4000, 80, TcpFlags::ACK);
            t.seq = seq;
            Packet::new(
                Af::Inet,
                client,
                server,
                Protocol::TCP,
                L4::Tcp(t),
                vec![],
            )
        };

        let mut err =
            error_about("198.51.100.1", &segment(1500), ICMP_TIMXCEED, 0);
        assert_eq!(quoted_key(&err, Direction::In), Some(key));
        assert_eq!(
            track_error(&st, &mut err, Direction::In, &PrintlnLog),
            Verdict::Pass
        );

        let mut err =
            error_about("198.51.100.1", &segment(900_000), ICMP_TIMXCEED, 0);
        assert_eq!(
            track_error(&st, &mut err, Direction::In, &PrintlnLog),
            Verdict::Drop(Reason::BadState)
        );

        st.flags |= StateFlags::SLOPPY;
        assert_eq!(
            track_error(&st, &mut err, Direction::In, &PrintlnLog),
            Verdict::Pass
        );
    }

    #[test]
    fn errors_about_errors_have_no_flow() {
        let inner = Packet::new(
            Af::Inet,
            v4("10.0.0.5"),
            v4("203.0.113.5"),
            Protocol::UDP,
            L4::Udp(UdpHdr { sport: 1, dport: 2, sum: 0 }),
            vec![],
        );
        let first = error_about("10.0.0.1", &inner, ICMP_UNREACH, 1);
        let second = error_about("10.0.0.9", &first, ICMP_UNREACH, 1);
        assert!(quoted_key(&first, Direction::Out).is_some());
        assert_eq!(quoted_key(&second, Direction::Out), None);
    }
}
