// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use pf_test_utils::*;
use std::hint::black_box;

const IFACES: u16 = 8;
const RULES_PER_IFACE: u16 = 125;

// Runs of block rules bound to other interfaces, then a catch-all.
// A packet on the harness interface can skip each run in one step.
fn big_ruleset(last: Rule) -> Ruleset {
    let mut rules = Vec::new();
    for ifidx in 0..IFACES {
        let ifname = format!("vnic{ifidx}");
        for i in 0..RULES_PER_IFACE {
            let to = RuleAddr::cidr(cidr("10.1.0.0/16"))
                .with_port(OpMatch::exact(1000 + i));
            rules.push(
                Rule::block()
                    .on(&ifname)
                    .dir(Direction::In)
                    .proto(Protocol::TCP)
                    .to(to),
            );
        }
    }
    rules.push(last);
    filter(rules)
}

fn engine(mode: EvalMode, last: Rule) -> TestPf {
    let t = TestPf::with_rules(big_ruleset(last));
    TestPf { pf: t.pf.with_eval_mode(mode), ..t }
}

pub fn rule_walk(c: &mut Criterion) {
    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let mut c = c.benchmark_group("ruleset");

    let g = engine(EvalMode::SkipSteps, Rule::pass());
    c.bench_function("skip steps", |b| {
        b.iter(|| g.out(black_box(&mut pkt)))
    });

    let g = engine(EvalMode::Linear, Rule::pass());
    c.bench_function("linear", |b| b.iter(|| g.out(black_box(&mut pkt))));
}

pub fn state_hit(c: &mut Criterion) {
    let mut pkt = udp_pkt(("10.0.0.5", 4000), ("203.0.113.5", 53));
    let g = engine(EvalMode::SkipSteps, pass_keep());
    g.out(&mut pkt);

    c.bench_function("state hit", |b| {
        b.iter(|| g.out(black_box(&mut pkt)))
    });
}

criterion_group!(benches, rule_walk, state_hit);
criterion_main!(benches);
