// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-packet side of state tracking shared by every protocol.
//!
//! A packet that finds its state is handed to the tracker for its
//! protocol, which advances the peers and decides whether the packet
//! belongs to the connection. If it does, [`translate`] rewrites the
//! packet into the other side's view of the flow.

use super::packet::Endpoint;
use super::packet::Packet;
use super::state::Peer;
use super::state::State;
use super::state::StateFlags;
use super::state::didx;
use super::state::sidx;
use crate::provider::LogProvider;
use crate::provider::PacketSender;
use crate::provider::TcpReply;
use pf_api::Direction;
use pf_api::PeerState;
use pf_api::Reason;
use pf_api::TimeoutClass;

/// What a tracker made of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Drop(Reason),
    /// The packet was answered on the destination's behalf.
    SynproxyDrop,
    /// The connection is closed on both sides and a new SYN arrived:
    /// the state has been marked closed and the packet should be
    /// evaluated as the start of a new connection.
    Reuse,
}

/// The result of counting a completed handshake against the state's
/// source node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnLimit {
    /// The state has no source node.
    NoNode,
    Ok,
    /// A connection limit was exceeded.
    Over,
}

pub trait ConnLimiter {
    fn connlimit(&mut self, st: &State) -> ConnLimit;
}

/// Everything a tracker needs beyond the state and the packet.
pub struct TrackCtx<'a, R> {
    pub dir: Direction,
    pub now: u64,
    pub rng: &'a mut R,
    pub sender: Option<&'a dyn PacketSender>,
    pub log: &'a dyn LogProvider,
    pub limiter: &'a mut dyn ConnLimiter,
}

impl<R> TrackCtx<'_, R> {
    pub(crate) fn send_tcp(&self, reply: TcpReply) {
        if let Some(sender) = self.sender {
            sender.send_tcp(reply);
        }
    }

    /// Count a completed handshake. Returns the verdict to give the
    /// packet if a limit was exceeded, having killed the state.
    pub(crate) fn connlimit(&mut self, st: &mut State) -> Option<Verdict> {
        match self.limiter.connlimit(st) {
            ConnLimit::NoNode => None,
            ConnLimit::Ok => {
                st.flags |= StateFlags::SRC_CONN;
                None
            }
            ConnLimit::Over => {
                st.flags |= StateFlags::SRC_CONN;
                st.kill();
                Some(Verdict::Drop(Reason::SrcLimit))
            }
        }
    }
}

/// Copy out the (source, destination) peers of a packet travelling in
/// `dir`.
pub(crate) fn load(st: &State, dir: Direction) -> (Peer, Peer) {
    if dir == st.direction {
        (st.src, st.dst)
    } else {
        (st.dst, st.src)
    }
}

pub(crate) fn store(st: &mut State, dir: Direction, src: Peer, dst: Peer) {
    if dir == st.direction {
        (st.src, st.dst) = (src, dst);
    } else {
        (st.dst, st.src) = (src, dst);
    }
}

/// The timeout class of a TCP connection whose peers are in the given
/// states.
pub fn tcp_timeout(src: PeerState, dst: PeerState) -> TimeoutClass {
    use PeerState::*;

    if src >= FinWait2 && dst >= FinWait2 {
        TimeoutClass::TcpClosed
    } else if src >= Closing && dst >= Closing {
        TimeoutClass::TcpFinWait
    } else if src < Established || dst < Established {
        TimeoutClass::TcpOpening
    } else if src >= Closing || dst >= Closing {
        TimeoutClass::TcpClosing
    } else {
        TimeoutClass::TcpEstablished
    }
}

/// Track a packet of a connectionless protocol: each side goes from
/// no traffic to single once it sends, and the state becomes multiple
/// once both sides have.
pub fn track_single_multiple(
    st: &mut State,
    dir: Direction,
    now: u64,
    single: TimeoutClass,
    multiple: TimeoutClass,
) -> Verdict {
    let (mut src, mut dst) = load(st, dir);
    if src.state < PeerState::Single {
        src.state = PeerState::Single;
    }
    if dst.state == PeerState::Single {
        dst.state = PeerState::Multiple;
    }
    store(st, dir, src, dst);

    st.expire = now;
    st.timeout = if src.state == PeerState::Multiple
        && dst.state == PeerState::Multiple
    {
        multiple
    } else {
        single
    };
    Verdict::Pass
}

/// Track an ICMP query or reply.
pub fn track_icmp_query(st: &mut State, now: u64) -> Verdict {
    st.expire = now;
    st.timeout = TimeoutClass::IcmpErrorReply;
    Verdict::Pass
}

/// Rewrite a packet matching a translated state into the view of the
/// side it is heading to.
pub fn translate(st: &State, pkt: &mut Packet, dir: Direction) {
    if !st.is_translated() {
        return;
    }
    let nk = &st.key[didx(dir)];
    let (s, d) = (sidx(dir), didx(dir));
    pkt.rewrite(Endpoint::Src, nk.addr[s], nk.port[s]);
    pkt.rewrite(Endpoint::Dst, nk.addr[d], nk.port[d]);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::rule::Rule;
    use crate::engine::state::StateKey;
    use alloc::sync::Arc;
    use pf_api::Af;
    use pf_api::PfAddr;
    use pf_api::Protocol;

    fn udp_state() -> State {
        let a = PfAddr::from(core::net::Ipv4Addr::new(10, 0, 0, 1));
        let b = PfAddr::from(core::net::Ipv4Addr::new(192, 0, 2, 1));
        let k = StateKey::new(
            Af::Inet,
            Protocol::UDP,
            (a, 5000),
            (b, 53),
            Direction::Out,
        );
        let rule = Arc::new(Rule::pass());
        let mut st = State::new([k, k], Direction::Out, rule, 0);
        st.src.state = PeerState::Single;
        st.dst.state = PeerState::NoTraffic;
        st
    }

    #[test]
    fn single_then_multiple() {
        let mut st = udp_state();
        let (single, multiple) =
            (TimeoutClass::UdpSingle, TimeoutClass::UdpMultiple);

        track_single_multiple(&mut st, Direction::Out, 5, single, multiple);
        assert_eq!(st.timeout, single);
        assert_eq!(st.dst.state, PeerState::NoTraffic);

        // The reply makes the responder single and the originator
        // multiple; one more packet out settles both on multiple.
        track_single_multiple(&mut st, Direction::In, 6, single, multiple);
        assert_eq!(st.src.state, PeerState::Multiple);
        assert_eq!(st.dst.state, PeerState::Single);
        assert_eq!(st.timeout, single);
        track_single_multiple(&mut st, Direction::Out, 7, single, multiple);
        assert_eq!(st.timeout, multiple);
        assert_eq!(st.expire, 7);
    }

    #[test]
    fn tcp_timeout_classes() {
        use PeerState::*;
        assert_eq!(tcp_timeout(SynSent, Closed), TimeoutClass::TcpOpening);
        assert_eq!(
            tcp_timeout(Established, Established),
            TimeoutClass::TcpEstablished
        );
        assert_eq!(
            tcp_timeout(Closing, Established),
            TimeoutClass::TcpClosing
        );
        assert_eq!(tcp_timeout(Closing, FinWait2), TimeoutClass::TcpFinWait);
        assert_eq!(tcp_timeout(TimeWait, TimeWait), TimeoutClass::TcpClosed);
    }
}
