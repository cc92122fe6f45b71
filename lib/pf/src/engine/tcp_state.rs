// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP connection tracking.
//!
//! Full tracking follows each side's sequence space: a segment is
//! accepted when it lies inside the window its peer advertised and
//! acknowledges nothing the peer has not sent. A looser window is
//! allowed while a connection is being picked up or torn down. Sloppy
//! tracking only follows the flags.
//!
//! A synproxy state answers the client's handshake itself and only
//! then opens the connection to the server, splicing the two
//! sequence spaces together with per-side offsets.

use super::packet::Packet;
use super::state::State;
use super::state::StateFlags;
use super::state::didx;
use super::state::sidx;
use super::track::TrackCtx;
use super::track::Verdict;
use super::track::load;
use super::track::store;
use super::track::tcp_timeout;
use crate::provider::LogLevel;
use crate::provider::PacketSender;
use crate::provider::TcpReply;
use pf_api::Direction;
use pf_api::PeerState;
use pf_api::Reason;
use pf_api::TcpFlags;
use pf_api::TimeoutClass;
use rand::Rng;

/// How far past the window an ACK may reach: a full window plus an
/// MTU's worth of slack.
const MAX_ACK_WINDOW: u32 = 0xffff + 1500;

pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub(crate) fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Seed the tracking of a new connection from its first packet. With
/// `modulate`, a bare SYN gets a random initial sequence number.
pub fn init_state<R: Rng>(
    st: &mut State,
    pkt: &mut Packet,
    modulate: bool,
    rng: &mut R,
) {
    let Some(t) = pkt.tcp() else {
        return;
    };
    let (flags, seq, win, wscale) = (t.flags, t.seq, t.win, t.wscale());

    st.src.seqlo = seq;
    st.src.seqhi = seq.wrapping_add(pkt.payload_len()).wrapping_add(1);
    if modulate && flags & (TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
    {
        let diff = rng.random::<u32>().wrapping_sub(seq);
        st.src.seqdiff = if diff == 0 { 1 } else { diff };
        pkt.set_tcp_seq(seq.wrapping_add(st.src.seqdiff));
    }
    if flags.contains(TcpFlags::SYN) {
        st.src.seqhi = st.src.seqhi.wrapping_add(1);
        st.src.wscale = wscale;
    }
    st.src.max_win = win.max(1);
    if let Some(shift) = st.src.wscale.filter(|&s| s != 0) {
        // Remove the scale factor from the initial window.
        let w = u32::from(st.src.max_win) + (1 << shift) - 1;
        st.src.max_win = (w >> shift) as u16;
    }
    if flags.contains(TcpFlags::FIN) {
        st.src.seqhi = st.src.seqhi.wrapping_add(1);
    }
    st.dst.seqhi = 1;
    st.dst.max_win = 1;
    st.src.state = PeerState::SynSent;
    st.dst.state = PeerState::Closed;
    st.timeout = TimeoutClass::TcpFirstPacket;
}

/// Put a new state into synproxy mode and answer the client's SYN.
/// `pkt` is the SYN as the client sent it.
pub fn start_synproxy<R: Rng>(
    st: &mut State,
    pkt: &Packet,
    dir: Direction,
    default_mss: u16,
    rng: &mut R,
    sender: Option<&dyn PacketSender>,
) -> Verdict {
    let Some(t) = pkt.tcp() else {
        return Verdict::Drop(Reason::Synproxy);
    };
    st.src.state = PeerState::ProxySrc;
    st.src.seqhi = rng.random();
    st.src.mss = t.mss().unwrap_or(default_mss);
    if let Some(sender) = sender {
        sender.send_tcp(TcpReply {
            af: pkt.af,
            src: pkt.dst,
            dst: pkt.src,
            sport: t.dport,
            dport: t.sport,
            seq: st.src.seqhi,
            ack: t.seq.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            win: 0,
            mss: Some(st.src.mss),
            ttl: 0,
            tag: 0,
            outbound: dir == Direction::In,
        });
    }
    Verdict::SynproxyDrop
}

/// Track a TCP packet that matched `st`. The caller translates the
/// packet if the verdict is [`Verdict::Pass`].
pub fn track<R: Rng>(
    st: &mut State,
    pkt: &mut Packet,
    ctx: &mut TrackCtx<'_, R>,
) -> Verdict {
    let Some(flags) = pkt.tcp_flags() else {
        return Verdict::Drop(Reason::Short);
    };

    if st.src.state == PeerState::ProxySrc {
        if let Some(v) = proxy_src(st, pkt, ctx) {
            return v;
        }
    }
    if st.src.state == PeerState::ProxyDst {
        return proxy_dst(st, pkt, ctx);
    }

    let (src, dst) = load(st, ctx.dir);
    if flags & (TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
        && src.state >= PeerState::FinWait2
        && dst.state >= PeerState::FinWait2
    {
        ctx.log.log(LogLevel::Debug, &format!("state reuse: {}", st.key[0]));
        st.src.state = PeerState::Closed;
        st.dst.state = PeerState::Closed;
        return Verdict::Reuse;
    }

    if st.flags.contains(StateFlags::SLOPPY) {
        track_sloppy(st, flags, ctx)
    } else {
        track_full(st, pkt, ctx)
    }
}

// The client's side of the proxied handshake. Returns `None` once the
// client's handshake is complete and the server side should start.
fn proxy_src<R: Rng>(
    st: &mut State,
    pkt: &Packet,
    ctx: &mut TrackCtx<'_, R>,
) -> Option<Verdict> {
    let t = pkt.tcp()?;
    if ctx.dir != st.direction {
        return Some(Verdict::SynproxyDrop);
    }
    if t.has_flag(TcpFlags::SYN) {
        if t.seq != st.src.seqlo {
            return Some(Verdict::Drop(Reason::Synproxy));
        }
        // A retransmitted SYN: answer it again.
        ctx.send_tcp(TcpReply {
            af: pkt.af,
            src: pkt.dst,
            dst: pkt.src,
            sport: t.dport,
            dport: t.sport,
            seq: st.src.seqhi,
            ack: t.seq.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            win: 0,
            mss: Some(st.src.mss),
            ttl: 0,
            tag: 0,
            outbound: ctx.dir == Direction::In,
        });
        return Some(Verdict::SynproxyDrop);
    }
    if !t.has_flag(TcpFlags::ACK)
        || t.ack != st.src.seqhi.wrapping_add(1)
        || t.seq != st.src.seqlo.wrapping_add(1)
    {
        return Some(Verdict::Drop(Reason::Synproxy));
    }
    if let Some(v) = ctx.connlimit(st) {
        return Some(v);
    }
    st.src.state = PeerState::ProxyDst;
    None
}

// The server's side of the proxied handshake.
fn proxy_dst<R: Rng>(
    st: &mut State,
    pkt: &Packet,
    ctx: &mut TrackCtx<'_, R>,
) -> Verdict {
    let Some(t) = pkt.tcp() else {
        return Verdict::Drop(Reason::Synproxy);
    };
    let dir = ctx.dir;
    let sk = st.key[didx(dir)];
    let (s, d) = (sidx(dir), didx(dir));
    let handshake = t.flags & (TcpFlags::SYN | TcpFlags::ACK);

    if dir == st.direction {
        // The client's ACK: open the connection to the server.
        if handshake != TcpFlags::ACK
            || t.ack != st.src.seqhi.wrapping_add(1)
            || t.seq != st.src.seqlo.wrapping_add(1)
        {
            return Verdict::Drop(Reason::Synproxy);
        }
        st.src.max_win = t.win.max(1);
        if st.dst.seqhi == 1 {
            st.dst.seqhi = ctx.rng.random();
        }
        ctx.send_tcp(TcpReply {
            af: sk.af,
            src: sk.addr[s],
            dst: sk.addr[d],
            sport: sk.port[s],
            dport: sk.port[d],
            seq: st.dst.seqhi,
            ack: 0,
            flags: TcpFlags::SYN,
            win: 0,
            mss: Some(st.src.mss),
            ttl: 0,
            tag: st.tag,
            outbound: dir == Direction::Out,
        });
        return Verdict::SynproxyDrop;
    }

    if handshake != TcpFlags::SYN | TcpFlags::ACK
        || t.ack != st.dst.seqhi.wrapping_add(1)
    {
        return Verdict::Drop(Reason::Synproxy);
    }

    // The server's SYN|ACK: acknowledge it, then let the client's ACK
    // through as if the server had sent it.
    st.dst.max_win = t.win.max(1);
    st.dst.seqlo = t.seq;
    ctx.send_tcp(TcpReply {
        af: pkt.af,
        src: pkt.dst,
        dst: pkt.src,
        sport: t.dport,
        dport: t.sport,
        seq: t.ack,
        ack: t.seq.wrapping_add(1),
        flags: TcpFlags::ACK,
        win: st.src.max_win,
        mss: None,
        ttl: 0,
        tag: st.tag,
        outbound: dir == Direction::In,
    });
    ctx.send_tcp(TcpReply {
        af: sk.af,
        src: sk.addr[s],
        dst: sk.addr[d],
        sport: sk.port[s],
        dport: sk.port[d],
        seq: st.src.seqhi.wrapping_add(1),
        ack: st.src.seqlo.wrapping_add(1),
        flags: TcpFlags::ACK,
        win: st.dst.max_win,
        mss: None,
        ttl: 0,
        tag: 0,
        outbound: dir == Direction::Out,
    });

    st.src.seqdiff = st.dst.seqhi.wrapping_sub(st.src.seqlo);
    st.dst.seqdiff = st.src.seqhi.wrapping_sub(st.dst.seqlo);
    st.src.seqhi = st.src.seqlo.wrapping_add(u32::from(st.dst.max_win));
    st.dst.seqhi = st.dst.seqlo.wrapping_add(u32::from(st.src.max_win));
    st.src.wscale = None;
    st.dst.wscale = None;
    st.src.state = PeerState::Established;
    st.dst.state = PeerState::Established;
    Verdict::SynproxyDrop
}

fn track_sloppy<R>(
    st: &mut State,
    flags: TcpFlags,
    ctx: &mut TrackCtx<'_, R>,
) -> Verdict {
    use PeerState::*;

    let dir = ctx.dir;
    let (mut src, mut dst) = load(st, dir);
    let mut counted = false;

    if flags.contains(TcpFlags::SYN) && src.state < SynSent {
        src.state = SynSent;
    }
    if flags.contains(TcpFlags::FIN) && src.state < Closing {
        src.state = Closing;
    }
    if flags.contains(TcpFlags::ACK) {
        if dst.state == SynSent {
            dst.state = Established;
            counted = src.state == Established;
        } else if dst.state == Closing {
            dst.state = FinWait2;
        } else if src.state == SynSent && dst.state < SynSent {
            // Only one half of the connection is visible: an ACK
            // after the SYN establishes it.
            src.state = Established;
            dst.state = Established;
            counted = true;
        } else if src.state == Closing
            && dst.state == Established
            && dst.seqlo == 0
        {
            // A half-seen close.
            dst.state = Closing;
        }
    }
    store(st, dir, src, dst);
    if counted {
        if let Some(v) = ctx.connlimit(st) {
            return v;
        }
    }

    if flags.contains(TcpFlags::RST) {
        src.state = TimeWait;
        dst.state = TimeWait;
        store(st, dir, src, dst);
    }
    st.expire = ctx.now;
    st.timeout = tcp_timeout(src.state, dst.state);
    Verdict::Pass
}

fn track_full<R: Rng>(
    st: &mut State,
    pkt: &mut Packet,
    ctx: &mut TrackCtx<'_, R>,
) -> Verdict {
    use PeerState::*;

    let Some(t) = pkt.tcp() else {
        return Verdict::Drop(Reason::Short);
    };
    let dir = ctx.dir;
    let flags = t.flags;
    let orig_seq = t.seq;
    let th_ack = t.ack;
    let has_opts = t.off > 5;
    let pkt_wscale = t.wscale();
    let mut win = t.win;
    let plen = pkt.payload_len();
    let syn = flags.contains(TcpFlags::SYN);
    let fin = flags.contains(TcpFlags::FIN);
    let rst = flags.contains(TcpFlags::RST);

    let (mut src, mut dst) = load(st, dir);
    let (mut sws, mut dws) = match (src.wscale, dst.wscale) {
        (Some(s), Some(d)) if !syn => (s, d),
        _ => (0, 0),
    };

    let mut seq = orig_seq;
    let mut ack;
    let mut end;
    if src.seqlo == 0 {
        // The first packet from this side.
        if dst.seqdiff != 0 && src.seqdiff == 0 {
            // The other side is modulated: pick this side's offset
            // now.
            src.seqdiff = loop {
                let diff = ctx.rng.random::<u32>().wrapping_sub(seq);
                if diff != 0 {
                    break diff;
                }
            };
            ack = th_ack.wrapping_sub(dst.seqdiff);
            pkt.set_tcp_seq(seq.wrapping_add(src.seqdiff));
            pkt.set_tcp_ack(ack);
        } else {
            ack = th_ack;
        }

        end = seq.wrapping_add(plen);
        if syn {
            end = end.wrapping_add(1);
            if let Some(dshift) = dst.wscale {
                src.wscale = pkt_wscale;
                match src.wscale {
                    Some(shift) => {
                        sws = shift;
                        let w = u32::from(win) + (1 << sws) - 1;
                        win = (w >> sws) as u16;
                        dws = dshift;
                    }
                    None => {
                        // The other side's window was scaled for
                        // nothing.
                        let w = u32::from(dst.max_win) << dshift;
                        dst.max_win = w as u16;
                        dst.wscale = None;
                    }
                }
            }
        }
        if fin {
            end = end.wrapping_add(1);
        }

        src.seqlo = seq;
        if src.state < SynSent {
            src.state = SynSent;
        }
        let span = (u32::from(dst.max_win) << dws).max(1);
        if src.seqhi == 1 || seq_geq(end.wrapping_add(span), src.seqhi) {
            src.seqhi = end.wrapping_add(span);
        }
        if win > src.max_win {
            src.max_win = win;
        }
    } else {
        ack = th_ack.wrapping_sub(dst.seqdiff);
        if src.seqdiff != 0 {
            pkt.set_tcp_seq(seq.wrapping_add(src.seqdiff));
            pkt.set_tcp_ack(ack);
        }
        end = seq.wrapping_add(plen);
        if syn {
            end = end.wrapping_add(1);
        }
        if fin {
            end = end.wrapping_add(1);
        }
    }

    if !flags.contains(TcpFlags::ACK) {
        ack = dst.seqlo;
    } else if (ack == 0 && flags.contains(TcpFlags::ACK | TcpFlags::RST))
        || dst.state < SynSent
    {
        // Stacks set the ACK in a FIN|ACK or RST|ACK when there is
        // nothing to acknowledge.
        ack = dst.seqlo;
    }

    if seq == end {
        // No data: relax the sequence checks.
        seq = src.seqlo;
        end = seq;
    }

    let ackskew = i64::from(dst.seqlo.wrapping_sub(ack) as i32);
    if dst.seqdiff != 0 && has_opts {
        pkt.modulate_sack(dst.seqdiff);
    }

    let max_ack = i64::from(MAX_ACK_WINDOW);
    let dwin = u32::from(dst.max_win) << dws;
    let rst_ok = !rst
        || orig_seq == src.seqlo
        || orig_seq == src.seqlo.wrapping_add(1)
        || orig_seq.wrapping_add(1) == src.seqlo
        || !pkt.meta.reassembled;
    let strict = seq_geq(src.seqhi, end)
        && seq_geq(seq, src.seqlo.wrapping_sub(dwin))
        && ackskew >= -max_ack
        && ackskew <= (max_ack << sws)
        && rst_ok;
    let loose = (dst.state < SynSent
        || dst.state >= FinWait2
        || src.state >= FinWait2)
        && seq_geq(src.seqhi.wrapping_add(MAX_ACK_WINDOW), end)
        && seq_geq(seq, src.seqlo.wrapping_sub(MAX_ACK_WINDOW));

    if strict || loose {
        if src.max_win < win {
            src.max_win = win;
        }
        if seq_gt(end, src.seqlo) {
            src.seqlo = end;
        }
        let scaled = u32::from(win) << sws;
        if seq_geq(ack.wrapping_add(scaled), dst.seqhi) {
            dst.seqhi = ack.wrapping_add(scaled.max(1));
        }
    }

    if strict {
        let mut counted = false;
        if syn && src.state < SynSent {
            src.state = SynSent;
        }
        if fin && src.state < Closing {
            src.state = Closing;
        }
        if flags.contains(TcpFlags::ACK) {
            if dst.state == SynSent {
                dst.state = Established;
                counted = src.state == Established;
            } else if dst.state == Closing {
                dst.state = FinWait2;
            }
        }
        store(st, dir, src, dst);
        if counted {
            if let Some(v) = ctx.connlimit(st) {
                return v;
            }
        }
        if rst {
            src.state = TimeWait;
            dst.state = TimeWait;
            store(st, dir, src, dst);
        }
        st.expire = ctx.now;
        st.timeout = tcp_timeout(src.state, dst.state);
        return Verdict::Pass;
    }

    if loose {
        // A connection being picked up mid-stream, shotgunned SYNs or
        // stray segments after a close. The expiry is deliberately
        // left alone so a flood cannot keep the state alive.
        ctx.log.log(
            LogLevel::Debug,
            &format!(
                "loose state match: {} [{flags}] seq={seq} ({orig_seq}) \
                 ack={ack} len={plen} ackskew={ackskew}",
                st.key[0]
            ),
        );
        if fin && src.state < Closing {
            src.state = Closing;
        }
        if rst {
            src.state = TimeWait;
            dst.state = TimeWait;
        }
        store(st, dir, src, dst);
        return Verdict::Pass;
    }

    if st.src.state == SynSent && st.dst.state == SynSent {
        // The two sides disagree about the handshake: reset both.
        if !rst {
            send_resets(st, pkt, th_ack, ctx);
        }
        src.seqlo = 0;
        src.seqhi = 1;
        src.max_win = 1;
    } else {
        ctx.log.log(
            LogLevel::Debug,
            &format!(
                "bad state: {} [{flags}] seq={seq} ({orig_seq}) ack={ack} \
                 len={plen} ackskew={ackskew}",
                st.key[0]
            ),
        );
    }
    store(st, dir, src, dst);
    Verdict::Drop(Reason::BadState)
}

// Reset a handshake both ways: back to the sender of `pkt`, and on to
// its destination as that end sees the connection.
fn send_resets<R>(
    st: &State,
    pkt: &Packet,
    th_ack: u32,
    ctx: &TrackCtx<'_, R>,
) {
    let Some(t) = pkt.tcp() else {
        return;
    };
    let dir = ctx.dir;
    let ttl = st.rule.return_ttl();
    ctx.send_tcp(TcpReply {
        af: pkt.af,
        src: pkt.dst,
        dst: pkt.src,
        sport: t.dport,
        dport: t.sport,
        seq: th_ack,
        ack: 0,
        flags: TcpFlags::RST,
        win: 0,
        mss: None,
        ttl,
        tag: 0,
        outbound: dir == Direction::In,
    });

    let nk = &st.key[didx(dir)];
    let (s, d) = (sidx(dir), didx(dir));
    ctx.send_tcp(TcpReply {
        af: nk.af,
        src: nk.addr[s],
        dst: nk.addr[d],
        sport: nk.port[s],
        dport: nk.port[d],
        seq: t.seq,
        ack: 0,
        flags: TcpFlags::RST,
        win: 0,
        mss: None,
        ttl,
        tag: 0,
        outbound: dir == Direction::Out,
    });
}
