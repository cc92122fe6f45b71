// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet filter engine.
//!
//! [`Pf`] is the front door; the submodules hold the rule model and
//! evaluation, translation, the state and source node tables, and the
//! per-protocol trackers.

pub mod checksum;
pub mod eval;
pub mod expire;
pub mod icmp;
pub mod nat;
pub mod packet;
pub mod pf;
pub mod predicate;
pub mod rule;
pub mod ruleset;
pub mod skip;
pub mod src_node;
pub mod stat;
pub mod state;
pub mod table;
pub mod tcp_state;
pub mod track;

pub use pf::EvalError;
pub use pf::Outcome;
pub use pf::Pf;
pub use pf_api::Direction;
