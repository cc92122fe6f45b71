// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rulesets and anchors.
//!
//! A [`Ruleset`] holds one ordered list per [`RuleClass`]. Anchors
//! are named rulesets reached through anchor rules, and may have
//! children of their own that a wildcard anchor rule visits in name
//! order. The whole graph is immutable once built: it is constructed
//! bottom-up, validated by [`Ruleset::validate`] and swapped in as a
//! unit.

use super::nat::PoolAddr;
use super::rule::Rule;
use super::skip::SkipSteps;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use pf_api::PoolType;
use pf_api::RuleAction;
use pf_api::RuleClass;

/// The deepest chain of anchor calls evaluation will follow.
pub const MAX_ANCHOR_DEPTH: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("anchors nest {depth} deep, the limit is {max}")]
    AnchorDepth { depth: usize, max: usize },

    #[error("rule {nr}: {action} rule in the {class:?} ruleset")]
    WrongClass { nr: u32, action: RuleAction, class: RuleClass },

    #[error("rule {nr}: translation rule without pool addresses")]
    EmptyPool { nr: u32 },

    #[error("rule {nr}: tables are only usable in round-robin pools")]
    TablePoolUnsupported { nr: u32 },

    #[error("rule {nr}: binat needs a single prefix pool")]
    BinatPool { nr: u32 },

    #[error("rule {nr}: pool prefix does not match the rule's family")]
    PoolFamily { nr: u32 },
}

/// One class's ordered rules with their skip steps.
#[derive(Debug, Default)]
pub struct RuleList {
    rules: Vec<Arc<Rule>>,
    skip: SkipSteps,
}

impl RuleList {
    fn new(rules: Vec<Rule>) -> Self {
        let rules: Vec<Arc<Rule>> = rules
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                r.nr = i as u32;
                Arc::new(r)
            })
            .collect();
        let skip = SkipSteps::compute(&rules);
        Self { rules, skip }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn skip(&self) -> &SkipSteps {
        &self.skip
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Ruleset {
    lists: [RuleList; RuleClass::COUNT],
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the rules for `class`, numbering them in order.
    pub fn with_rules(mut self, class: RuleClass, rules: Vec<Rule>) -> Self {
        self.lists[class.idx()] = RuleList::new(rules);
        self
    }

    pub fn list(&self, class: RuleClass) -> &RuleList {
        &self.lists[class.idx()]
    }

    /// The longest chain of anchor calls starting here.
    pub fn depth(&self) -> usize {
        self.lists
            .iter()
            .flat_map(|l| l.rules.iter())
            .filter_map(|r| r.anchor.as_ref())
            .map(|call| {
                let inner = if call.wildcard {
                    call.anchor
                        .children()
                        .iter()
                        .map(|c| c.ruleset.depth())
                        .max()
                        .unwrap_or(0)
                } else {
                    call.anchor.ruleset.depth()
                };
                inner + 1
            })
            .max()
            .unwrap_or(0)
    }

    /// Check the ruleset, and every anchor reachable from it, for
    /// anything evaluation could not act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let depth = self.depth();
        if depth > MAX_ANCHOR_DEPTH {
            return Err(ConfigError::AnchorDepth {
                depth,
                max: MAX_ANCHOR_DEPTH,
            });
        }
        self.validate_rules()
    }

    fn validate_rules(&self) -> Result<(), ConfigError> {
        for class in [
            RuleClass::Filter,
            RuleClass::Nat,
            RuleClass::Binat,
            RuleClass::Rdr,
        ] {
            for rule in self.list(class).rules() {
                match &rule.anchor {
                    Some(call) => {
                        call.anchor.ruleset.validate_rules()?;
                        for child in call.anchor.children() {
                            child.ruleset.validate_rules()?;
                        }
                    }
                    None => validate_rule(class, rule)?,
                }
            }
        }
        Ok(())
    }
}

fn validate_rule(class: RuleClass, rule: &Rule) -> Result<(), ConfigError> {
    use RuleAction::*;

    let nr = rule.nr;
    let action = rule.action;
    let fits = match class {
        RuleClass::Filter => matches!(action, Pass | Drop),
        RuleClass::Nat => matches!(action, Nat | NoNat),
        RuleClass::Binat => matches!(action, Binat | NoBinat),
        RuleClass::Rdr => matches!(action, Rdr | NoRdr),
    };
    if !fits {
        return Err(ConfigError::WrongClass { nr, action, class });
    }
    if class == RuleClass::Filter || action.is_no_translation() {
        return Ok(());
    }

    let Some(pool) = rule.pool.as_ref().filter(|p| !p.addrs.is_empty())
    else {
        return Err(ConfigError::EmptyPool { nr });
    };

    for addr in &pool.addrs {
        match addr {
            PoolAddr::Table(_) if pool.ty != PoolType::RoundRobin => {
                return Err(ConfigError::TablePoolUnsupported { nr });
            }
            PoolAddr::Cidr(cidr) if rule.af.is_some_and(|af| af != cidr.af) => {
                return Err(ConfigError::PoolFamily { nr });
            }
            _ => {}
        }
    }

    if action == Binat
        && !matches!(pool.addrs.as_slice(), [PoolAddr::Cidr(_)])
    {
        return Err(ConfigError::BinatPool { nr });
    }
    Ok(())
}

/// A named, nested ruleset.
#[derive(Debug)]
pub struct Anchor {
    name: String,
    ruleset: Ruleset,
    // Sorted by name.
    children: Vec<Arc<Anchor>>,
}

impl Anchor {
    pub fn new(name: &str, ruleset: Ruleset) -> Self {
        Self { name: name.into(), ruleset, children: Vec::new() }
    }

    /// Add (or replace) a child anchor.
    pub fn with_child(mut self, child: Arc<Anchor>) -> Self {
        match self.children.binary_search_by(|c| c.name.cmp(&child.name)) {
            Ok(i) => self.children[i] = child,
            Err(i) => self.children.insert(i, child),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// The child anchors in name order.
    pub fn children(&self) -> &[Arc<Anchor>] {
        &self.children
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::nat::Pool;
    use pf_api::PfCidr;

    fn nest(depth: usize) -> Ruleset {
        let mut rs = Ruleset::new()
            .with_rules(RuleClass::Filter, vec![Rule::pass()]);
        for i in 0..depth {
            let name = format!("a{i}");
            let a = Arc::new(Anchor::new(&name, rs));
            rs = Ruleset::new()
                .with_rules(RuleClass::Filter, vec![Rule::anchor(a)]);
        }
        rs
    }

    #[test]
    fn rules_are_numbered() {
        let rs = Ruleset::new().with_rules(
            RuleClass::Filter,
            vec![Rule::pass(), Rule::block(), Rule::pass()],
        );
        let nrs: Vec<u32> =
            rs.list(RuleClass::Filter).rules().iter().map(|r| r.nr).collect();
        assert_eq!(nrs, [0, 1, 2]);
    }

    #[test]
    fn anchor_depth_is_bounded() {
        assert_eq!(nest(3).depth(), 3);
        assert!(nest(MAX_ANCHOR_DEPTH).validate().is_ok());
        assert_eq!(
            nest(MAX_ANCHOR_DEPTH + 1).validate(),
            Err(ConfigError::AnchorDepth {
                depth: MAX_ANCHOR_DEPTH + 1,
                max: MAX_ANCHOR_DEPTH
            })
        );
    }

    #[test]
    fn wrong_class_and_empty_pool() {
        let rs = Ruleset::new().with_rules(RuleClass::Nat, vec![Rule::pass()]);
        assert!(matches!(rs.validate(), Err(ConfigError::WrongClass { .. })));

        let rs = Ruleset::new()
            .with_rules(RuleClass::Nat, vec![Rule::new(RuleAction::Nat)]);
        assert_eq!(rs.validate(), Err(ConfigError::EmptyPool { nr: 0 }));

        let rs = Ruleset::new()
            .with_rules(RuleClass::Nat, vec![Rule::new(RuleAction::NoNat)]);
        assert!(rs.validate().is_ok());
    }

    #[test]
    fn binat_needs_one_prefix() {
        let a: PfCidr = "192.0.2.1".parse().unwrap();
        let b: PfCidr = "192.0.2.2".parse().unwrap();
        let rule = Rule::new(RuleAction::Binat)
            .pool(Pool::new(PoolType::None, vec![a.into(), b.into()]));
        let rs = Ruleset::new().with_rules(RuleClass::Binat, vec![rule]);
        assert_eq!(rs.validate(), Err(ConfigError::BinatPool { nr: 0 }));
    }

    #[test]
    fn children_sorted() {
        let a = Anchor::new("top", Ruleset::new())
            .with_child(Arc::new(Anchor::new("zeta", Ruleset::new())))
            .with_child(Arc::new(Anchor::new("alpha", Ruleset::new())));
        let names: Vec<&str> = a.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
