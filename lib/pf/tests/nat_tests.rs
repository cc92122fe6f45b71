// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address translation through the engine.

use common::*;
use pf::engine::packet::ICMP_UNREACH;
use pf::engine::packet::ICMP_UNREACH_PORT;
use pf_test_utils as common;

const PUBLIC: &str = "192.0.2.1";

fn nat_ruleset(filter_rules: Vec<Rule>) -> Ruleset {
    filter(filter_rules).with_rules(
        RuleClass::Nat,
        vec![nat_rule("10.0.0.0/8", &format!("{PUBLIC}/32"), 50001, 50001)],
    )
}

#[test]
fn outbound_nat_round_trip() {
    let g = TestPf::with_rules(nat_ruleset(vec![pass_keep()]));

    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let out = g.out(&mut pkt);
    expect_action!(out, Action::Pass);
    assert_eq!(pkt.src, addr(PUBLIC).1);
    assert_eq!(pkt.sport(), Some(50001));
    assert!(pkt.checksums_ok());

    let st = &g.pf.state_dump()[0];
    assert_eq!(st.wire.src, addr(PUBLIC).1);
    assert_eq!(st.wire.sport, 50001);
    assert_eq!(st.stack.src, addr("10.0.0.5").1);
    assert_eq!(st.stack.sport, 4000);

    let mut reply = udp_pkt(("203.0.113.5", 53), (PUBLIC, 50001));
    let res = g.inb(&mut reply);
    expect_action!(res, Action::Pass);
    assert_eq!(res.state_id, out.state_id);
    assert_eq!(reply.dst, addr("10.0.0.5").1);
    assert_eq!(reply.dport(), Some(4000));
    assert!(reply.checksums_ok());

    let rules = g.pf.rule_dump(RuleClass::Nat);
    assert_eq!(rules[0].states_cur, 1);
    assert_eq!(rules[0].packets, [1, 1]);
}

#[test]
fn exhausted_ports_leave_packet_untranslated() {
    let g = TestPf::with_rules(nat_ruleset(vec![pass_keep()]));
    let mut first = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    g.out(&mut first);

    // The only port is taken for this destination.
    let mut second = udp_pkt(("10.0.0.6", 4000), ("203.0.113.5", 53));
    expect_action!(g.out(&mut second), Action::Pass);
    assert_eq!(second.src, addr("10.0.0.6").1);
    assert_eq!(g.pf.state_count(), 2);

    // Another destination frees the port up again.
    let mut third = udp_pkt(("10.0.0.6", 4000), ("203.0.113.6", 53));
    g.out(&mut third);
    assert_eq!(third.src, addr(PUBLIC).1);
}

#[test]
fn nat_without_filter_pass_is_dropped() {
    let g = TestPf::with_rules(nat_ruleset(vec![]));
    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let orig = pkt.clone();
    let out = g.out(&mut pkt);
    expect_drop!(out, Reason::Match);
    assert_eq!(g.pf.state_count(), 0);

    // Blocked replies are built from the packet as it arrived.
    let g = TestPf::with_rules(nat_ruleset(vec![
        Rule::block().return_policy(ReturnPolicy::Return),
    ]));
    let mut pkt = orig.clone();
    g.out(&mut pkt);
    assert_eq!(g.sent.icmp()[0].orig, orig);
}

#[test]
fn natpass_skips_filter_rules() {
    let pool =
        Pool::new(PoolType::None, vec![cidr(&format!("{PUBLIC}/32")).into()])
            .ports(50001, 50001);
    let nat = Rule::new(RuleAction::Nat)
        .from(RuleAddr::cidr(cidr("10.0.0.0/8")))
        .natpass()
        .pool(pool);
    let rs = filter(vec![Rule::block()]).with_rules(RuleClass::Nat, vec![nat]);
    let g = TestPf::with_rules(rs);

    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let out = g.out(&mut pkt);
    expect_action!(out, Action::Pass);
    assert_eq!(out.rule_nr, Some(0));
    assert!(out.state_id.is_some());
    assert_eq!(g.pf.rule_dump(RuleClass::Filter)[0].evaluations, 0);
}

#[test]
fn no_nat_exempts_traffic() {
    let rs = filter(vec![pass_keep()]).with_rules(
        RuleClass::Nat,
        vec![
            Rule::new(RuleAction::NoNat)
                .to(RuleAddr::cidr(cidr("10.0.0.0/8"))),
            nat_rule("10.0.0.0/8", &format!("{PUBLIC}/32"), 50001, 50001),
        ],
    );
    let g = TestPf::with_rules(rs);

    let mut local = udp_pkt(("10.0.0.5", 4000), ("10.1.0.1", 53));
    g.out(&mut local);
    assert_eq!(local.src, addr("10.0.0.5").1);

    let mut remote = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    g.out(&mut remote);
    assert_eq!(remote.src, addr(PUBLIC).1);
}

#[test]
fn rdr_to_internal_server() {
    let pool = Pool::new(PoolType::None, vec![cidr("10.0.0.80/32").into()])
        .ports(8080, 8080);
    let rdr = Rule::new(RuleAction::Rdr)
        .dir(Direction::In)
        .to(RuleAddr::cidr(cidr(&format!("{PUBLIC}/32"))))
        .pool(pool);
    let rs = filter(vec![pass_keep().dir(Direction::In)])
        .with_rules(RuleClass::Rdr, vec![rdr]);
    let g = TestPf::with_rules(rs);

    let mut syn = tcp_syn(("198.51.100.7", 40000), (PUBLIC, 80), 100);
    expect_action!(g.inb(&mut syn), Action::Pass);
    assert_eq!(syn.dst, addr("10.0.0.80").1);
    assert_eq!(syn.dport(), Some(8080));

    let mut synack = tcp_pkt(
        ("10.0.0.80", 8080),
        ("198.51.100.7", 40000),
        TcpFlags::SYN | TcpFlags::ACK,
        900,
        101,
    );
    expect_action!(g.out(&mut synack), Action::Pass);
    assert_eq!(synack.src, addr(PUBLIC).1);
    assert_eq!(synack.sport(), Some(80));
}

// A state whose stack key equals the wire key of a new flow blocks
// the new state, but not the packet.
#[test]
fn colliding_state_passes_statelessly() {
    let pool = Pool::new(PoolType::None, vec![cidr("10.0.0.80/32").into()])
        .ports(8080, 8080);
    let rdr = Rule::new(RuleAction::Rdr)
        .dir(Direction::In)
        .to(RuleAddr::cidr(cidr(&format!("{PUBLIC}/32"))))
        .pool(pool);
    let rs = filter(vec![pass_keep().dir(Direction::In)])
        .with_rules(RuleClass::Rdr, vec![rdr]);
    let g = TestPf::with_rules(rs);

    let mut via_rdr = udp_pkt(("198.51.100.7", 40000), (PUBLIC, 80));
    let first = g.inb(&mut via_rdr);
    expect_action!(first, Action::Pass);

    let mut direct = udp_pkt(("198.51.100.7", 40000), ("10.0.0.80", 8080));
    let out = g.inb(&mut direct);
    expect_action!(out, Action::Pass);
    assert_eq!(out.reason, Reason::StateInsertFailed);
    assert_eq!(out.state_id, None);
    assert_eq!(g.pf.state_count(), 1);
    assert_eq!(g.pf.reason_count(Reason::StateInsertFailed), 1);
}

#[test]
fn icmp_error_translated_back() {
    let g = TestPf::with_rules(nat_ruleset(vec![pass_keep()]));
    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    g.out(&mut pkt);

    let mut err =
        icmp_error_for("203.0.113.5", &pkt, ICMP_UNREACH, ICMP_UNREACH_PORT);
    let out = g.inb(&mut err);
    expect_action!(out, Action::Pass);
    assert!(out.state_id.is_some());
    assert_eq!(err.dst, addr("10.0.0.5").1);

    let q = err.quoted().unwrap();
    assert_eq!(q.src, addr("10.0.0.5").1);
    assert!(err.checksums_ok());
}

#[test]
fn icmp_echo_nat_rewrites_id() {
    let g = TestPf::with_rules(nat_ruleset(vec![pass_keep()]));
    let mut echo = icmp_echo("10.0.0.5", "203.0.113.5", 77, false);
    let out = g.out(&mut echo);
    expect_action!(out, Action::Pass);
    assert_eq!(echo.src, addr(PUBLIC).1);
    let id = echo.icmp().unwrap().id;

    let mut reply = icmp_echo("203.0.113.5", PUBLIC, id, true);
    let res = g.inb(&mut reply);
    expect_action!(res, Action::Pass);
    assert_eq!(res.state_id, out.state_id);
    assert_eq!(reply.dst, addr("10.0.0.5").1);
    assert_eq!(reply.icmp().unwrap().id, 77);
}

#[test]
fn sticky_address_follows_source() {
    let pool = Pool::new(
        PoolType::RoundRobin,
        vec![cidr("192.0.2.1/32").into(), cidr("192.0.2.2/32").into()],
    )
    .ports(50001, 60000)
    .sticky();
    let nat = Rule::new(RuleAction::Nat)
        .dir(Direction::Out)
        .from(RuleAddr::cidr(cidr("10.0.0.0/8")))
        .pool(pool);
    let rs =
        filter(vec![pass_keep()]).with_rules(RuleClass::Nat, vec![nat]);
    let g = TestPf::with_rules(rs);

    let mut a = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    g.out(&mut a);
    let mut b = udp_pkt(("10.0.0.5", 4001), ("203.0.113.9", 53));
    g.out(&mut b);
    assert_eq!(a.src, b.src);

    let nodes = g.pf.src_node_dump();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, addr("10.0.0.5").1);
    assert_eq!(nodes[0].raddr, Some(a.src));
    assert_eq!(nodes[0].states, 2);
}
