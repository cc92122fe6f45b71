// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Skip steps.
//!
//! For each rule and each of the cheap match fields, the index of the
//! next rule whose value for that field differs. Consecutive rules
//! sharing a field value form a run; when a rule fails on a field,
//! every other rule in its run fails on it too, so evaluation can
//! jump straight past the run.

use super::rule::Rule;
use alloc::sync::Arc;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipField {
    Ifp,
    Dir,
    Af,
    Proto,
    SrcAddr,
    SrcPort,
    DstAddr,
    DstPort,
}

impl SkipField {
    pub const COUNT: usize = 8;

    pub const ALL: [SkipField; Self::COUNT] = [
        Self::Ifp,
        Self::Dir,
        Self::Af,
        Self::Proto,
        Self::SrcAddr,
        Self::SrcPort,
        Self::DstAddr,
        Self::DstPort,
    ];

    /// Do two rules hold the same value for this field?
    fn same(self, a: &Rule, b: &Rule) -> bool {
        match self {
            Self::Ifp => a.ifname == b.ifname && a.ifnot == b.ifnot,
            Self::Dir => a.direction == b.direction,
            Self::Af => a.af == b.af,
            Self::Proto => a.proto == b.proto,
            Self::SrcAddr => {
                a.src.addr == b.src.addr && a.src.neg == b.src.neg
            }
            Self::SrcPort => a.src.port == b.src.port,
            Self::DstAddr => {
                a.dst.addr == b.dst.addr && a.dst.neg == b.dst.neg
            }
            Self::DstPort => a.dst.port == b.dst.port,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SkipSteps {
    steps: [Vec<usize>; SkipField::COUNT],
}

impl SkipSteps {
    pub fn compute(rules: &[Arc<Rule>]) -> Self {
        let mut steps: [Vec<usize>; SkipField::COUNT] = Default::default();
        for (f, field) in SkipField::ALL.into_iter().enumerate() {
            let out = &mut steps[f];
            out.resize(rules.len(), rules.len());
            let mut head = 0;
            for cur in 1..rules.len() {
                if !field.same(&rules[head], &rules[cur]) {
                    out[head..cur].fill(cur);
                    head = cur;
                }
            }
        }
        Self { steps }
    }

    /// The rule to resume at when rule `idx` fails on `field`.
    pub fn next(&self, field: SkipField, idx: usize) -> usize {
        self.steps[field as usize][idx]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pf_api::Direction;
    use pf_api::Protocol;

    #[test]
    fn runs_jump_to_first_difference() {
        let rules: Vec<Arc<Rule>> = [
            Rule::pass().dir(Direction::In).proto(Protocol::TCP),
            Rule::pass().dir(Direction::In).proto(Protocol::UDP),
            Rule::pass().dir(Direction::In).proto(Protocol::UDP),
            Rule::pass().dir(Direction::Out),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();

        let s = SkipSteps::compute(&rules);
        assert_eq!(
            (0..4).map(|i| s.next(SkipField::Dir, i)).collect::<Vec<_>>(),
            [3, 3, 3, 4]
        );
        assert_eq!(
            (0..4).map(|i| s.next(SkipField::Proto, i)).collect::<Vec<_>>(),
            [1, 3, 3, 4]
        );
        assert_eq!(s.next(SkipField::DstPort, 0), 4);
    }

    #[test]
    fn empty_list() {
        let s = SkipSteps::compute(&[]);
        assert_eq!(s, SkipSteps::compute(&[]));
    }
}
