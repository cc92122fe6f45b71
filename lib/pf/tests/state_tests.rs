// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! State creation, lookup, expiry and removal.

use common::*;
use pf_test_utils as common;

fn udp_out(g: &TestPf, sport: u16) -> Outcome {
    let mut pkt = udp_pkt(("10.0.0.5", sport), ("203.0.113.5", 53));
    g.out(&mut pkt)
}

fn udp_reply(g: &TestPf, dport: u16) -> Outcome {
    let mut pkt = udp_pkt(("203.0.113.5", 53), ("10.0.0.5", dport));
    g.inb(&mut pkt)
}

#[test]
fn replies_need_a_state() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    expect_drop!(udp_reply(&g, 4000), Reason::Match);
    expect_action!(udp_out(&g, 4000), Action::Pass);
    expect_action!(udp_reply(&g, 4000), Action::Pass);
    assert_eq!(g.pf.stats().state_inserts, 1);
    assert!(g.pf.stats().state_searches >= 3);
}

#[test]
fn state_life_is_exported_and_synced() {
    let g = TestPf::with_rules(filter(vec![pass_keep()]));
    let id = udp_out(&g, 4000).state_id.unwrap();
    assert_eq!(g.flows.events(), vec![FlowEvent::Create]);
    assert_eq!(g.sync.inserted(), vec![id]);

    assert_eq!(g.pf.export_states(), 1);
    g.clock.advance(61);
    g.purge_all();
    assert_eq!(
        g.flows.events(),
        vec![FlowEvent::Create, FlowEvent::Update, FlowEvent::Delete]
    );
    assert_eq!(g.sync.deleted(), vec![id]);
}

#[test]
fn creator_id_is_the_host_id() {
    let cfg = PfConfig { hostid: 7, ..Default::default() };
    let g = TestPf::new(cfg);
    g.pf.activate(filter(vec![pass_keep()])).unwrap();
    udp_out(&g, 4000);
    let st = &g.pf.state_dump()[0];
    assert_eq!(st.creatorid, 7);
    g.clock.advance(61);
    g.purge_all();
    assert_eq!(g.sync.deleted(), vec![st.id]);
}

#[test]
fn kill_by_filter() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    udp_out(&g, 4000);
    udp_out(&g, 4001);
    let mut other = udp_pkt(("10.0.0.6", 4000), ("203.0.113.5", 53));
    g.out(&mut other);

    let kf = KillFilter {
        src: Some(cidr("10.0.0.5/32")),
        ..Default::default()
    };
    assert_eq!(g.pf.kill_states(&kf), 2);
    assert_eq!(g.pf.state_count(), 1);
    expect_drop!(udp_reply(&g, 4000), Reason::Match);

    // A rule number that matches nothing kills nothing.
    let kf = KillFilter { rule_nr: Some(9), ..Default::default() };
    assert_eq!(g.pf.kill_states(&kf), 0);
    // Unlinked states are freed by the next sweep.
    assert_eq!(g.purge_all(), 2);
}

#[test]
fn if_bound_states_stay_on_their_interface() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out).if_bound(),
    ]));
    udp_out(&g, 4000);
    assert_eq!(g.pf.state_dump()[0].ifname.as_deref(), Some(IFNAME));

    let mut reply = udp_pkt(("203.0.113.5", 53), ("10.0.0.5", 4000));
    let out = g.pf.process(Direction::In, "em1", &mut reply);
    expect_drop!(out, Reason::Match);
    expect_action!(udp_reply(&g, 4000), Action::Pass);
}

#[test]
fn floating_states_match_any_interface() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    udp_out(&g, 4000);
    let mut reply = udp_pkt(("203.0.113.5", 53), ("10.0.0.5", 4000));
    let out = g.pf.process(Direction::In, "em1", &mut reply);
    expect_action!(out, Action::Pass);
}

#[test]
fn icmp_echo_state() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    let mut req = icmp_echo("10.0.0.5", "203.0.113.5", 300, false);
    expect_action!(g.out(&mut req), Action::Pass);
    assert_eq!(
        g.pf.state_dump()[0].timeout,
        TimeoutClass::IcmpFirstPacket
    );

    let mut reply = icmp_echo("203.0.113.5", "10.0.0.5", 300, true);
    expect_action!(g.inb(&mut reply), Action::Pass);
    assert_eq!(g.pf.state_dump()[0].timeout, TimeoutClass::IcmpErrorReply);

    let mut stray = icmp_echo("203.0.113.5", "10.0.0.5", 301, true);
    expect_drop!(g.inb(&mut stray), Reason::Match);
}

#[test]
fn icmpv6_echo_state() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    let mut req = icmp_echo("fd00::5", "2001:db8::1", 9, false);
    expect_action!(g.out(&mut req), Action::Pass);
    let mut reply = icmp_echo("2001:db8::1", "fd00::5", 9, true);
    expect_action!(g.inb(&mut reply), Action::Pass);
}

#[test]
fn icmp_error_for_unknown_flow_uses_rules() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    let sent = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let mut err = icmp_error_for(
        "203.0.113.5",
        &sent,
        pf::engine::packet::ICMP_UNREACH,
        pf::engine::packet::ICMP_UNREACH_PORT,
    );
    expect_drop!(g.inb(&mut err), Reason::Match);

    let mut sent = sent;
    g.out(&mut sent);
    let mut err = icmp_error_for(
        "203.0.113.5",
        &sent,
        pf::engine::packet::ICMP_UNREACH,
        pf::engine::packet::ICMP_UNREACH_PORT,
    );
    expect_action!(g.inb(&mut err), Action::Pass);
    // Errors never create states.
    assert_eq!(g.pf.state_count(), 1);
}

#[test]
fn new_states_can_be_deferred() {
    let cfg = PfConfig { defer_new_states: true, ..Default::default() };
    let g = TestPf::with_sync(cfg, CaptureSync::deferring());
    g.pf.activate(filter(vec![pass_keep()])).unwrap();

    let out = udp_out(&g, 4000);
    expect_action!(out, Action::Defer);
    assert!(out.state_id.is_some());
    // Only the first packet is offered.
    expect_action!(udp_out(&g, 4000), Action::Pass);
}

#[test]
fn cleared_src_nodes_are_purged() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().src_track(SrcTrack::Global),
    ]));
    udp_out(&g, 4000);
    g.pf.clear_src_nodes();
    assert_eq!(g.pf.purge_src_nodes(), 1);
    assert_eq!(g.pf.stats().src_nodes, 0);

    // The state itself is unaffected.
    expect_action!(udp_reply(&g, 4000), Action::Pass);
    g.clock.advance(61);
    assert_eq!(g.purge_all(), 1);
}
