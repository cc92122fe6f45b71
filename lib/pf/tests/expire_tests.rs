// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Timeouts and the purge sweep.

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

fn adaptive_cfg(start: u32, end: u32) -> PfConfig {
    PfConfig {
        timeouts: Timeouts {
            adaptive_start: start,
            adaptive_end: end,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn udp_timeouts_follow_traffic() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().dir(Direction::Out),
    ]));
    udp_out(&g, 4000);
    assert_eq!(g.pf.state_dump()[0].timeout, TimeoutClass::UdpFirstPacket);
    udp_reply(&g, 4000);
    assert_eq!(g.pf.state_dump()[0].timeout, TimeoutClass::UdpSingle);
    udp_out(&g, 4000);
    let st = &g.pf.state_dump()[0];
    assert_eq!(st.timeout, TimeoutClass::UdpMultiple);
    assert_eq!(st.packets, [2, 1]);

    // Multiple is 60 seconds.
    g.clock.advance(59);
    assert_eq!(g.purge_all(), 0);
    g.clock.advance(2);
    assert_eq!(g.purge_all(), 1);
    assert_eq!(g.pf.state_count(), 0);
    expect_drop!(udp_reply(&g, 4000), Reason::Match);
}

#[test]
fn rule_timeout_overrides_default() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().timeout(TimeoutClass::UdpFirstPacket, 5),
    ]));
    udp_out(&g, 4000);
    g.clock.advance(6);
    assert_eq!(g.purge_all(), 1);
}

#[test]
fn sweeper_visits_whole_table_per_interval() {
    let g = TestPf::with_rules(filter(vec![pass_keep()]));
    for port in 0..200 {
        expect_action!(udp_out(&g, 1000 + port), Action::Pass);
    }
    assert_eq!(g.pf.state_count(), 200);
    assert_eq!(g.pf.rule_dump(RuleClass::Filter)[0].states_cur, 200);

    g.clock.advance(61);
    // Each call takes its share of the table as it stands.
    let interval = g.pf.config().timeouts.interval as usize;
    assert_eq!(g.pf.purge(), 1 + 200 / interval);
    assert_eq!(g.purge_all(), 200 - (1 + 200 / interval));
    assert_eq!(g.pf.state_count(), 0);
    assert_eq!(g.pf.rule_dump(RuleClass::Filter)[0].states_cur, 0);
    assert_eq!(g.pf.stats().state_removals, 200);
}

#[test]
fn src_nodes_linger_after_states() {
    let cfg = PfConfig {
        timeouts: Timeouts { src_node: 30, ..Default::default() },
        ..Default::default()
    };
    let g = TestPf::new(cfg);
    g.pf.activate(filter(vec![pass_keep().src_track(SrcTrack::Global)]))
        .unwrap();
    udp_out(&g, 4000);
    udp_out(&g, 4001);
    let nodes = g.pf.src_node_dump();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].states, 2);

    g.clock.advance(61);
    g.purge_all();
    assert_eq!(g.pf.src_node_dump()[0].states, 0);
    assert_eq!(g.pf.purge_src_nodes(), 0);
    g.clock.advance(31);
    assert_eq!(g.pf.purge_src_nodes(), 1);
    assert!(g.pf.src_node_dump().is_empty());
}

#[test]
fn crowded_table_shortens_timeouts() {
    let g = TestPf::new(adaptive_cfg(2, 4));
    g.pf.activate(filter(vec![pass_keep()])).unwrap();
    for port in 0..3 {
        udp_out(&g, 4000 + port);
    }
    // Three states sit halfway between start and end.
    assert!(g.pf.state_dump().iter().all(|st| st.expire == 1030));

    // Once a state goes the table is back at the start threshold and
    // the rest get their full timeout again.
    g.clock.advance(31);
    assert_eq!(g.purge_all(), 1);
    assert_eq!(g.pf.state_count(), 2);
    assert!(g.pf.state_dump().iter().all(|st| st.expire == 1060));
}

#[test]
fn full_table_expires_immediately() {
    let g = TestPf::new(adaptive_cfg(2, 4));
    g.pf.activate(filter(vec![pass_keep()])).unwrap();
    for port in 0..4 {
        udp_out(&g, 4000 + port);
    }
    assert_eq!(g.purge_all(), 1);
    assert_eq!(g.pf.state_count(), 3);
}

#[test]
fn rule_adaptive_counts_its_own_states() {
    let g = TestPf::with_rules(filter(vec![
        pass_keep().proto(Protocol::UDP).adaptive(1, 3),
        pass_keep().proto(Protocol::ICMP),
    ]));
    for id in 0..4 {
        let mut echo = icmp_echo("10.0.0.5", "203.0.113.5", id, false);
        expect_action!(g.out(&mut echo), Action::Pass);
    }
    udp_out(&g, 4000);
    udp_out(&g, 4001);

    // The ICMP states do not count against the UDP rule.
    let dump = g.pf.state_dump();
    let udp: Vec<_> =
        dump.iter().filter(|st| st.wire.proto == Protocol::UDP).collect();
    assert_eq!(udp.len(), 2);
    assert!(udp.iter().all(|st| st.expire == 1030));
}

#[test]
fn expiry_counts_from_last_packet() {
    let g = TestPf::with_rules(filter(vec![pass_keep()]));
    udp_out(&g, 4000);
    g.clock.advance(50);
    expect_action!(udp_reply(&g, 4000), Action::Pass);
    // Single is 30 seconds from the reply.
    g.clock.advance(29);
    assert_eq!(g.purge_all(), 0);
    g.clock.advance(2);
    assert_eq!(g.purge_all(), 1);
}
