// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Utility for converting nested error enums into a flat list of
//! static names, so a drop can be logged with its full cause without
//! formatting strings on the packet path.

pub use derror_macro::DError;
use heapless::Vec as HVec;

/// A trait used for walking chains of errors which store useful data in
/// a leaf node.
pub trait DError {
    /// Provide the name of an error's discriminant.
    fn discriminant(&self) -> &'static str;

    /// Provide a reference to the next error in the chain.
    fn child(&self) -> Option<&dyn DError>;

    /// Store data from a leaf error alongside the chain.
    fn leaf_data(&self, _data: &mut [u64]) {}
}

/// The names of every enum discriminant encountered while walking an
/// error, outermost first, plus any data held by the innermost error.
#[derive(Clone, Debug, Default)]
pub struct ErrorChain<const L: usize> {
    names: HVec<&'static str, L>,
    more: bool,
    data: [u64; 2],
}

/// Signals that an [`ErrorChain`] could not hold another entry.
#[derive(Clone, Copy, Debug)]
pub struct ErrorChainFull;

impl<const L: usize> ErrorChain<L> {
    pub fn new() -> Self {
        Self { names: HVec::new(), more: false, data: [0; 2] }
    }

    /// Flatten a nested error.
    ///
    /// If `err` is deeper than `L` the truncated chain is returned as
    /// the error value.
    pub fn from_err(err: &dyn DError) -> Result<Self, Self> {
        let mut out = Self::new();

        if out.append(err).is_err() { Err(out) } else { Ok(out) }
    }

    /// Push all layers (and data) of an error into the chain.
    pub fn append(&mut self, err: &dyn DError) -> Result<(), ErrorChainFull> {
        let mut top: Option<&dyn DError> = Some(err);
        while let Some(el) = top {
            self.append_name(el.discriminant())?;
            top = el.child();

            if top.is_none() {
                el.leaf_data(&mut self.data[..]);
            }
        }
        Ok(())
    }

    /// Append a single name.
    pub fn append_name(
        &mut self,
        name: &'static str,
    ) -> Result<(), ErrorChainFull> {
        if self.names.push(name).is_err() {
            self.more = true;
            return Err(ErrorChainFull);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Was the chain truncated?
    pub fn more(&self) -> bool {
        self.more
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Provides access to data stored in a leaf error.
    pub fn data(&self) -> &[u64] {
        &self.data[..]
    }
}
