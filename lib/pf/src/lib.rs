// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A stateful packet filter and network address translation engine.
//!
//! The entry point is [`engine::Pf`]: hand it a parsed packet, the
//! interface it was seen on and the direction of travel, and it
//! returns an [`api::Action`] after rewriting any translated header
//! fields in place. Everything the engine needs from its environment
//! (time, logging, replies, socket owners, state synchronization) is
//! supplied through [`provider::Providers`].

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

extern crate alloc;

pub use pf_api as api;

pub mod d_error;
pub mod ddi;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;
