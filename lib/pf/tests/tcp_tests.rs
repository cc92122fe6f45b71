// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP connection tracking through the engine.

use common::*;
use pf_test_utils as common;

const CLIENT: &str = "10.0.0.5";
const SERVER: &str = "203.0.113.5";

fn out_seg(flags: TcpFlags, seq: u32, ack: u32) -> Packet {
    tcp_pkt((CLIENT, 40000), (SERVER, 80), flags, seq, ack)
}

fn in_seg(flags: TcpFlags, seq: u32, ack: u32) -> Packet {
    tcp_pkt((SERVER, 80), (CLIENT, 40000), flags, seq, ack)
}

// Open a connection from the client, returning the state id.
fn handshake(g: &TestPf) -> u64 {
    let out = g.out(&mut out_seg(TcpFlags::SYN, 1000, 0));
    expect_action!(out, Action::Pass);
    let synack = TcpFlags::SYN | TcpFlags::ACK;
    expect_action!(g.inb(&mut in_seg(synack, 5000, 1001)), Action::Pass);
    let mut ack = out_seg(TcpFlags::ACK, 1001, 5001);
    expect_action!(g.out(&mut ack), Action::Pass);
    out.state_id.unwrap()
}

fn client_rules() -> Ruleset {
    filter(vec![pass_keep().dir(Direction::Out).proto(Protocol::TCP)])
}

#[test]
fn handshake_establishes_both_sides() {
    let g = TestPf::with_rules(client_rules());
    handshake(&g);

    let st = &g.pf.state_dump()[0];
    assert_eq!(st.src.state, PeerState::Established);
    assert_eq!(st.dst.state, PeerState::Established);
    assert_eq!(st.timeout, TimeoutClass::TcpEstablished);
    assert_eq!(st.packets, [2, 1]);
    assert_eq!(g.pf.stats().state_inserts, 1);
}

#[test]
fn stray_syn_from_server_is_blocked() {
    let g = TestPf::with_rules(client_rules());
    let mut syn = in_seg(TcpFlags::SYN, 5000, 0);
    expect_drop!(g.inb(&mut syn), Reason::Match);
}

#[test]
fn wild_ack_is_bad_state() {
    let g = TestPf::with_rules(client_rules());
    handshake(&g);

    let mut seg = out_seg(TcpFlags::ACK, 1001, 505_001);
    let out = g.out(&mut seg);
    expect_drop!(out, Reason::BadState);
    assert!(out.state_id.is_some());
    assert_eq!(g.pf.reason_count(Reason::BadState), 1);

    // The connection itself carries on.
    let mut seg = out_seg(TcpFlags::ACK, 1001, 5001);
    expect_action!(g.out(&mut seg), Action::Pass);
}

#[test]
fn reset_closes_connection() {
    let g = TestPf::with_rules(client_rules());
    handshake(&g);
    expect_action!(g.out(&mut out_seg(TcpFlags::RST, 1001, 0)), Action::Pass);

    let st = &g.pf.state_dump()[0];
    assert_eq!(st.src.state, PeerState::TimeWait);
    assert_eq!(st.timeout, TimeoutClass::TcpClosed);

    let closed = g.pf.config().timeouts.tcp_closed;
    g.clock.advance(u64::from(closed) + 1);
    assert_eq!(g.purge_all(), 1);
}

#[test]
fn established_connections_last() {
    let g = TestPf::with_rules(client_rules());
    handshake(&g);
    g.clock.advance(3600);
    assert_eq!(g.purge_all(), 0);
    let mut seg = out_seg(TcpFlags::ACK | TcpFlags::PSH, 1001, 5001);
    expect_action!(g.out(&mut seg), Action::Pass);
}

#[test]
fn closed_connection_is_reused_by_new_syn() {
    let g = TestPf::with_rules(client_rules());
    let first = handshake(&g);

    let fin = TcpFlags::FIN | TcpFlags::ACK;
    expect_action!(g.out(&mut out_seg(fin, 1001, 5001)), Action::Pass);
    expect_action!(g.inb(&mut in_seg(fin, 5001, 1002)), Action::Pass);
    let mut ack = out_seg(TcpFlags::ACK, 1002, 5002);
    expect_action!(g.out(&mut ack), Action::Pass);
    assert_eq!(g.pf.state_dump()[0].timeout, TimeoutClass::TcpClosed);

    let out = g.out(&mut out_seg(TcpFlags::SYN, 9000, 0));
    expect_action!(out, Action::Pass);
    assert_ne!(out.state_id, Some(first));
    assert_eq!(g.pf.state_count(), 1);
    assert_eq!(g.sync.deleted(), vec![first]);
    assert_eq!(g.pf.state_dump()[0].src.state, PeerState::SynSent);
}

#[test]
fn modulated_sequence_numbers() {
    let g = TestPf::with_rules(filter(vec![
        Rule::pass().dir(Direction::Out).keep_state(KeepState::Modulate),
    ]));

    let mut syn = out_seg(TcpFlags::SYN, 1000, 0);
    expect_action!(g.out(&mut syn), Action::Pass);
    let wire_isn = syn.tcp().unwrap().seq;
    assert_ne!(wire_isn, 1000);
    assert!(syn.checksums_ok());

    // The server acknowledges what it saw; the client gets its own
    // sequence space back.
    let synack = TcpFlags::SYN | TcpFlags::ACK;
    let mut reply = in_seg(synack, 5000, wire_isn.wrapping_add(1));
    expect_action!(g.inb(&mut reply), Action::Pass);
    let t = reply.tcp().unwrap();
    assert_eq!(t.ack, 1001);
    let client_view = t.seq;

    let mut ack = out_seg(TcpFlags::ACK, 1001, client_view.wrapping_add(1));
    expect_action!(g.out(&mut ack), Action::Pass);
    let t = ack.tcp().unwrap();
    assert_eq!(t.seq, wire_isn.wrapping_add(1));
    assert_eq!(t.ack, 5001);
    assert!(ack.checksums_ok());

    let st = &g.pf.state_dump()[0];
    assert_eq!(st.src.state, PeerState::Established);
    assert_eq!(st.dst.state, PeerState::Established);
}

#[test]
fn synproxy_splices_connection() {
    const WEB: &str = "10.0.0.80";
    const REMOTE: &str = "198.51.100.7";
    let g = TestPf::with_rules(filter(vec![
        Rule::pass().dir(Direction::In).keep_state(KeepState::Synproxy),
    ]));
    let seg = |flags, seq, ack, inbound: bool| {
        if inbound {
            tcp_pkt((REMOTE, 40000), (WEB, 22), flags, seq, ack)
        } else {
            tcp_pkt((WEB, 22), (REMOTE, 40000), flags, seq, ack)
        }
    };

    // The client's SYN is answered by the engine.
    let out = g.inb(&mut seg(TcpFlags::SYN, 1000, 0, true));
    assert_eq!(out.action, Action::SynproxyDrop);
    assert_eq!(out.reason, Reason::Synproxy);
    let sent = g.sent.tcp();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(sent[0].ack, 1001);
    assert_eq!(sent[0].dst, addr(REMOTE).1);
    assert!(sent[0].outbound);
    let isn = sent[0].seq;

    // A retransmitted SYN gets the same answer.
    let out = g.inb(&mut seg(TcpFlags::SYN, 1000, 0, true));
    assert_eq!(out.action, Action::SynproxyDrop);
    assert_eq!(g.sent.tcp()[1].seq, isn);
    g.sent.clear();

    // Once the client completes, the engine opens the server side.
    let ack = isn.wrapping_add(1);
    let out = g.inb(&mut seg(TcpFlags::ACK, 1001, ack, true));
    assert_eq!(out.action, Action::SynproxyDrop);
    let sent = g.sent.tcp();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::SYN);
    assert_eq!(sent[0].dst, addr(WEB).1);
    assert_eq!(sent[0].dport, 22);
    let server_isn = sent[0].seq;
    g.sent.clear();

    let synack = TcpFlags::SYN | TcpFlags::ACK;
    let out = g.out(&mut seg(synack, 7000, server_isn.wrapping_add(1), false));
    assert_eq!(out.action, Action::SynproxyDrop);
    assert_eq!(g.sent.tcp().len(), 2);

    let st = &g.pf.state_dump()[0];
    assert_eq!(st.src.state, PeerState::Established);
    assert_eq!(st.dst.state, PeerState::Established);

    // From here on the two sequence spaces are spliced together.
    let mut data = seg(TcpFlags::ACK | TcpFlags::PSH, 1001, ack, true);
    expect_action!(g.inb(&mut data), Action::Pass);
    assert_eq!(data.tcp().unwrap().ack, 7001);
}

#[test]
fn synproxy_rejects_bad_ack() {
    let g = TestPf::with_rules(filter(vec![
        Rule::pass().dir(Direction::In).keep_state(KeepState::Synproxy),
    ]));
    let mut syn = tcp_syn(("198.51.100.7", 40000), ("10.0.0.80", 22), 1000);
    g.inb(&mut syn);
    let isn = g.sent.tcp()[0].seq;

    let mut ack = tcp_pkt(
        ("198.51.100.7", 40000),
        ("10.0.0.80", 22),
        TcpFlags::ACK,
        1001,
        isn.wrapping_add(2),
    );
    expect_drop!(g.inb(&mut ack), Reason::Synproxy);
}

#[test]
fn sloppy_state_follows_one_side() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out).sloppy(),
    ]));
    expect_action!(g.out(&mut out_seg(TcpFlags::SYN, 1000, 0)), Action::Pass);
    // Only the client half of the connection passes this host.
    let mut seg = out_seg(TcpFlags::ACK, 1001, 77);
    expect_action!(g.out(&mut seg), Action::Pass);
    let mut seg = out_seg(TcpFlags::ACK | TcpFlags::PSH, 900_000, 77);
    expect_action!(g.out(&mut seg), Action::Pass);
}
