// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ruleset evaluation.
//!
//! Rules are walked in order, descending into anchors through an
//! explicit, bounded frame stack. The filter class keeps the last
//! matching rule unless a quick rule stops the walk; translation
//! classes take the first match (see [`super::nat`]).
//!
//! Anchors carry their own notion of "matched": an anchor rule
//! behaves like a quick rule once any rule inside the anchor (or,
//! for a wildcard anchor, inside any of its children) has matched.

use super::packet::Packet;
use super::predicate::PredCtx;
use super::rule::AnchorCall;
use super::rule::Rule;
use super::ruleset::Anchor;
use super::ruleset::MAX_ANCHOR_DEPTH;
use super::ruleset::RuleList;
use super::ruleset::Ruleset;
use super::skip::SkipField;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use heapless::Vec as HVec;
use pf_api::RuleClass;
use rand::Rng;

/// How the filter walk advances past a rule that does not match.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EvalMode {
    /// Jump with the precomputed skip steps.
    #[default]
    SkipSteps,
    /// Test every rule in turn.
    Linear,
}

/// The outcome of a ruleset walk.
#[derive(Clone, Debug)]
pub struct EvalMatch {
    pub rule: Arc<Rule>,
    /// The outermost anchor rule the walk was inside of.
    pub anchor: Option<Arc<Rule>>,
    /// The anchor whose ruleset `rule` belongs to; `None` for the main
    /// ruleset.
    pub ruleset: Option<Arc<Anchor>>,
}

/// Matches compare by identity.
impl PartialEq for EvalMatch {
    fn eq(&self, other: &Self) -> bool {
        fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
        }

        Arc::ptr_eq(&self.rule, &other.rule)
            && same(&self.anchor, &other.anchor)
            && same(&self.ruleset, &other.ruleset)
    }
}

struct Frame<'r> {
    list: &'r RuleList,
    ruleset: Option<&'r Arc<Anchor>>,
    /// The index of the anchor rule in `list`.
    idx: usize,
    rule: &'r Arc<Rule>,
    /// For a wildcard call: the children and the one being visited.
    children: Option<(&'r [Arc<Anchor>], usize)>,
    matched: bool,
}

/// A position in a ruleset walk, including the anchor frames that
/// lead to it.
pub(crate) struct Cursor<'r> {
    class: RuleClass,
    list: &'r RuleList,
    ruleset: Option<&'r Arc<Anchor>>,
    idx: usize,
    stack: HVec<Frame<'r>, MAX_ANCHOR_DEPTH>,
    anchor_rule: Option<&'r Arc<Rule>>,
    /// Has a rule matched at the current level?
    matched: bool,
}

impl<'r> Cursor<'r> {
    pub(crate) fn new(rs: &'r Ruleset, class: RuleClass) -> Self {
        Self {
            class,
            list: rs.list(class),
            ruleset: None,
            idx: 0,
            stack: HVec::new(),
            anchor_rule: None,
            matched: false,
        }
    }

    pub(crate) fn current(&self) -> Option<&'r Arc<Rule>> {
        self.list.rules().get(self.idx)
    }

    pub(crate) fn next(&mut self) {
        self.idx += 1;
    }

    pub(crate) fn skip(&mut self, field: SkipField) {
        self.idx = self.list.skip().next(field, self.idx);
    }

    /// Record `rule`, the current rule, as a match.
    pub(crate) fn matched(&mut self, rule: &'r Arc<Rule>) -> EvalMatch {
        self.matched = true;
        EvalMatch {
            rule: Arc::clone(rule),
            anchor: self.anchor_rule.cloned(),
            ruleset: self.ruleset.cloned(),
        }
    }

    /// Descend into the anchor called by `rule`, the current rule.
    /// Returns false, having moved past the rule, if the frame stack
    /// is full.
    pub(crate) fn step_into(
        &mut self,
        rule: &'r Arc<Rule>,
        call: &'r AnchorCall,
    ) -> bool {
        self.matched = false;
        let was_empty = self.stack.is_empty();
        let children = call.wildcard.then(|| (call.anchor.children(), 0));
        let frame = Frame {
            list: self.list,
            ruleset: self.ruleset,
            idx: self.idx,
            rule,
            children,
            matched: false,
        };
        if self.stack.push(frame).is_err() {
            self.idx += 1;
            return false;
        }
        if was_empty {
            self.anchor_rule = Some(rule);
        }

        let target = match children {
            Some((kids, _)) => kids.first(),
            None => Some(&call.anchor),
        };
        match target {
            Some(anchor) => self.enter(anchor),
            // An empty wildcard: leave the cursor past the end so the
            // next step out pops the frame.
            None => self.idx = self.list.len(),
        }
        true
    }

    fn enter(&mut self, anchor: &'r Arc<Anchor>) {
        self.list = anchor.ruleset().list(self.class);
        self.ruleset = Some(anchor);
        self.idx = 0;
    }

    /// Climb out of finished anchors until there is a rule to look at
    /// or the main ruleset is exhausted. Returns true if the walk must
    /// stop: a quick anchor rule whose anchor matched.
    pub(crate) fn step_out(&mut self) -> bool {
        let mut quick = false;
        while self.current().is_none() {
            let Some(f) = self.stack.last_mut() else {
                break;
            };

            let next_child = match &mut f.children {
                Some((kids, ci)) => {
                    if self.matched {
                        f.matched = true;
                        self.matched = false;
                    }
                    *ci += 1;
                    let kids: &'r [Arc<Anchor>] = *kids;
                    kids.get(*ci)
                }
                None => None,
            };
            if let Some(child) = next_child {
                self.enter(child);
                continue;
            }

            let Some(f) = self.stack.pop() else {
                break;
            };
            if self.stack.is_empty() {
                self.anchor_rule = None;
            }
            self.list = f.list;
            self.ruleset = f.ruleset;
            if f.matched || self.matched {
                quick = f.rule.quick;
            }
            self.idx = f.idx + 1;
        }
        quick
    }
}

/// The ports rules compare against: only TCP and UDP have them.
pub(crate) fn rule_ports(pkt: &Packet) -> (Option<u16>, Option<u16>) {
    if pkt.proto.has_ports() {
        (pkt.sport(), pkt.dport())
    } else {
        (None, None)
    }
}

/// Test the skip-step fields of `rule`, returning the first that
/// fails.
pub(crate) fn check_fields(
    rule: &Rule,
    pkt: &Packet,
    dir: pf_api::Direction,
    ifname: &str,
) -> Option<SkipField> {
    let (sport, dport) = rule_ports(pkt);
    if !rule.matches_ifname(ifname) {
        Some(SkipField::Ifp)
    } else if rule.direction.is_some_and(|d| d != dir) {
        Some(SkipField::Dir)
    } else if rule.af.is_some_and(|af| af != pkt.af) {
        Some(SkipField::Af)
    } else if rule.proto.is_some_and(|p| p != pkt.proto) {
        Some(SkipField::Proto)
    } else if !rule.src.addr_matches(pkt.af, pkt.src) {
        Some(SkipField::SrcAddr)
    } else if !rule.src.port_matches(sport) {
        Some(SkipField::SrcPort)
    } else if !rule.dst.addr_matches(pkt.af, pkt.dst) {
        Some(SkipField::DstAddr)
    } else if !rule.dst.port_matches(dport) {
        Some(SkipField::DstPort)
    } else {
        None
    }
}

/// Test the rule's explicit predicates.
pub(crate) fn check_preds<R: Rng>(
    rule: &Rule,
    ctx: &mut PredCtx<'_, R>,
) -> bool {
    // Without a transport header the port and header predicates
    // cannot be answered.
    if ctx.pkt.frag.is_fragment() && !ctx.pkt.meta.reassembled {
        let ports = rule.src.port.is_some() || rule.dst.port.is_some();
        if ports || rule.preds.iter().any(|p| p.needs_l4()) {
            return false;
        }
    }
    rule.preds.iter().all(|p| p.is_match(ctx))
}

/// Walk the filter rules for the packet in `ctx`, returning the
/// deciding rule, if any. Matching rules' tags are applied to
/// `ctx.tag` as the walk passes them.
pub fn eval_filter<R: Rng>(
    rs: &Ruleset,
    mode: EvalMode,
    ifname: &str,
    ctx: &mut PredCtx<'_, R>,
    log: &dyn LogProvider,
) -> Option<EvalMatch> {
    let mut cur = Cursor::new(rs, RuleClass::Filter);
    let mut found = None;

    while let Some(rule) = cur.current() {
        rule.counters().evaluations.fetch_add(1, Ordering::Relaxed);

        if let Some(field) = check_fields(rule, ctx.pkt, ctx.dir, ifname) {
            match mode {
                EvalMode::SkipSteps => cur.skip(field),
                EvalMode::Linear => cur.next(),
            }
        } else if !check_preds(rule, ctx) {
            cur.next();
        } else {
            if let Some(tag) = rule.tag {
                ctx.tag = tag;
            }
            match rule.anchor_call() {
                None => {
                    found = Some(cur.matched(rule));
                    if rule.quick {
                        break;
                    }
                    cur.next();
                }
                Some(call) => {
                    if !cur.step_into(rule, call) {
                        log.log(
                            LogLevel::Warn,
                            &format!(
                                "anchor stack overflow at rule {}",
                                rule.nr()
                            ),
                        );
                    }
                }
            }
        }

        if cur.current().is_none() && cur.step_out() {
            break;
        }
    }

    found
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::L4;
    use crate::engine::packet::TcpHdr;
    use crate::engine::predicate::Predicate;
    use crate::engine::predicate::RuleAddr;
    use crate::provider::PrintlnLog;
    use pf_api::Af;
    use pf_api::Direction;
    use pf_api::OpMatch;
    use pf_api::PfAddr;
    use pf_api::Protocol;
    use pf_api::TcpFlags;
    use core::net::Ipv4Addr;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn v4(s: &str) -> PfAddr {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    fn tcp(dport: u16) -> Packet {
        Packet::new(
            Af::Inet,
            v4("10.0.0.5"),
            v4("192.0.2.9"),
            Protocol::TCP,
            L4::Tcp(TcpHdr::new(4000, dport, TcpFlags::SYN)),
            vec![],
        )
    }

    fn eval(rs: &Ruleset, pkt: &Packet, mode: EvalMode) -> Option<EvalMatch> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = PredCtx::new(pkt, Direction::In, None, &mut rng);
        eval_filter(rs, mode, "em0", &mut ctx, &PrintlnLog)
    }

    fn nr(m: &Option<EvalMatch>) -> Option<u32> {
        m.as_ref().map(|m| m.rule.nr())
    }

    #[test]
    fn last_match_wins_unless_quick() {
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![
                Rule::block(),
                Rule::pass(),
                Rule::block().proto(Protocol::UDP),
            ],
        );
        assert_eq!(nr(&eval(&rs, &tcp(80), EvalMode::SkipSteps)), Some(1));

        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![Rule::block().quick(), Rule::pass()],
        );
        assert_eq!(nr(&eval(&rs, &tcp(80), EvalMode::SkipSteps)), Some(0));
    }

    #[test]
    fn empty_ruleset_has_no_match() {
        assert!(eval(&Ruleset::new(), &tcp(80), EvalMode::Linear).is_none());
    }

    #[test]
    fn quick_anchor_stops_after_inner_match() {
        let inner = Arc::new(Anchor::new(
            "web",
            Ruleset::new().with_rules(
                RuleClass::Filter,
                vec![
                    Rule::pass()
                        .to(RuleAddr::any().with_port(OpMatch::exact(80))),
                ],
            ),
        ));
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![
                Rule::block(),
                Rule::anchor(inner.clone()).quick(),
                Rule::block(),
            ],
        );

        let m = eval(&rs, &tcp(80), EvalMode::SkipSteps).unwrap();
        assert_eq!(m.rule.nr(), 0);
        assert!(Arc::ptr_eq(m.ruleset.as_ref().unwrap(), &inner));
        assert_eq!(m.anchor.as_ref().unwrap().nr(), 1);

        // No inner match: the anchor rule is not quick and the last
        // rule wins.
        let m = eval(&rs, &tcp(22), EvalMode::SkipSteps).unwrap();
        assert_eq!(m.rule.nr(), 2);
        assert!(m.ruleset.is_none());
        assert!(m.anchor.is_none());
    }

    #[test]
    fn wildcard_visits_children_in_order() {
        let child = |name: &str, rule: Rule| {
            Arc::new(Anchor::new(
                name,
                Ruleset::new().with_rules(RuleClass::Filter, vec![rule]),
            ))
        };
        let top = Arc::new(
            Anchor::new("top", Ruleset::new())
                .with_child(child("b", Rule::block()))
                .with_child(child("a", Rule::pass()))
                .with_child(child("c", Rule::block().proto(Protocol::UDP))),
        );
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![Rule::anchor_wildcard(top)],
        );
        let m = eval(&rs, &tcp(80), EvalMode::SkipSteps).unwrap();
        assert_eq!(m.ruleset.as_ref().unwrap().name(), "b");
        assert_eq!(m.rule.action(), pf_api::RuleAction::Drop);
    }

    #[test]
    fn tags_follow_matches() {
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![
                Rule::pass().tag(7),
                Rule::block().pred(Predicate::Tagged { tag: 7, neg: true }),
            ],
        );
        let pkt = tcp(80);
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = PredCtx::new(&pkt, Direction::In, None, &mut rng);
        let m =
            eval_filter(&rs, EvalMode::Linear, "em0", &mut ctx, &PrintlnLog);
        assert_eq!(nr(&m), Some(0));
        assert_eq!(ctx.tag, 7);
    }

    #[test]
    fn later_fragments_skip_port_rules() {
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![
                Rule::block(),
                Rule::pass().to(RuleAddr::any().with_port(OpMatch::exact(80))),
            ],
        );
        let mut pkt = tcp(80);
        pkt.frag.offset = 185;
        pkt.l4 = L4::None;
        assert_eq!(nr(&eval(&rs, &pkt, EvalMode::SkipSteps)), Some(0));
    }
}
